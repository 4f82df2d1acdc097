use crate::cache::{CancelSignal, FetchCell};
use crate::db::{self, SqliteGradeSink};
use crate::grades::{
    general_average, save_batches, GradeContext, GradeSink, Slot, Stage, StudentBatch,
    StudentGradeRow,
};
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::types::{AppState, GradeSession, Request};
use crate::reconcile::{EffectiveValue, GradeReconciler, UnlockSet};
use rusqlite::Connection;
use serde_json::json;
use tokio::runtime::Runtime;
use tracing::{info, warn};

fn str_param(req: &Request, name: &str) -> Result<String, HandlerErr> {
    req.params
        .get(name)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {name}")))
}

fn opt_str_param(req: &Request, name: &str) -> Option<String> {
    req.params
        .get(name)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.to_string())
}

fn slot_param(req: &Request) -> Result<Slot, HandlerErr> {
    let Some(n) = req.params.get("slot").and_then(|v| v.as_i64()) else {
        return Err(HandlerErr::bad_params("missing slot"));
    };
    Slot::try_from(n)
        .map_err(|e| HandlerErr::bad_params(e.to_string()).with_details(json!({ "slot": n })))
}

fn context_from_params(req: &Request) -> Result<GradeContext, HandlerErr> {
    let subject_id = str_param(req, "subjectId")?;
    let course_id = str_param(req, "courseId")?;
    let Some(stage_no) = req.params.get("stage").and_then(|v| v.as_i64()) else {
        return Err(HandlerErr::bad_params("missing stage"));
    };
    let stage = Stage::try_from(stage_no).map_err(|e| {
        HandlerErr::bad_params(e.to_string()).with_details(json!({ "stage": stage_no }))
    })?;
    let academic_year = req
        .params
        .get("academicYear")
        .and_then(|v| v.as_i64())
        .and_then(|y| i32::try_from(y).ok())
        .ok_or_else(|| HandlerErr::bad_params("missing academicYear"))?;

    Ok(GradeContext {
        subject_id,
        course_id,
        enrollment_id: opt_str_param(req, "enrollmentId"),
        stage,
        academic_year,
    })
}

fn no_workspace() -> HandlerErr {
    HandlerErr::new("no_workspace", "select a workspace first")
}

fn no_session() -> HandlerErr {
    HandlerErr::new("no_session", "open a grade grid first")
}

fn require_student(reconciler: &GradeReconciler, student_id: &str) -> Result<(), HandlerErr> {
    if reconciler.rows().iter().any(|r| r.student_id == student_id) {
        Ok(())
    } else {
        Err(HandlerErr::new("not_found", "student not in grid")
            .with_details(json!({ "studentId": student_id })))
    }
}

/// Loads the baseline through the shared cache. `refresh` bypasses the TTL.
fn fetch_rows(
    runtime: &Runtime,
    cell: &FetchCell<Vec<StudentGradeRow>>,
    conn: &Connection,
    ctx: &GradeContext,
    refresh: bool,
) -> Result<Vec<StudentGradeRow>, HandlerErr> {
    let loader = move |signal: CancelSignal| async move {
        if signal.is_cancelled() {
            anyhow::bail!("load superseded");
        }
        db::load_grade_rows(
            conn,
            &ctx.subject_id,
            &ctx.course_id,
            ctx.academic_year,
            Some(ctx.stage),
        )
    };
    let snap = if refresh {
        runtime.block_on(cell.refresh(loader))
    } else {
        runtime.block_on(cell.load(loader))
    };

    if let Some(message) = snap.error {
        return Err(HandlerErr::new("load_failed", message)
            .with_details(json!({ "cacheKey": cell.key() })));
    }
    snap.data
        .ok_or_else(|| HandlerErr::new("load_failed", "no grades loaded"))
}

/// Reloads the baseline after a write. Pending edits of rows other than
/// `written` survive the reload; edits of `written` rows are dropped. When the
/// reload fails nothing is dropped, so the grid keeps showing what was saved
/// until a later `grades.refresh` succeeds.
fn reload_after_write(
    runtime: &Runtime,
    conn: &Connection,
    session: &mut GradeSession,
    written: &[String],
) -> Result<(), HandlerErr> {
    let keep: Vec<(String, Vec<(Slot, String)>)> = session
        .reconciler
        .rows()
        .iter()
        .map(|r| r.student_id.clone())
        .filter(|id| !written.contains(id) && session.reconciler.has_pending(id))
        .map(|id| {
            let edits = session.reconciler.pending_edits(&id);
            (id, edits)
        })
        .collect();

    let ctx = session.reconciler.context().clone();
    match fetch_rows(runtime, &session.cell, conn, &ctx, true) {
        Ok(rows) => {
            session.reconciler.replace_baseline(rows);
            for (student_id, edits) in keep {
                for (slot, raw) in edits {
                    session.reconciler.set_cell_value(&student_id, slot, &raw);
                }
            }
            Ok(())
        }
        Err(e) => {
            warn!(
                cache_key = session.cell.key(),
                error = %e.message,
                "reload after write failed"
            );
            Err(e)
        }
    }
}

fn session_view(session: &GradeSession) -> serde_json::Value {
    let r = &session.reconciler;
    let ctx = r.context();
    let rows: Vec<serde_json::Value> = r
        .rows()
        .iter()
        .map(|row| {
            let cells: Vec<serde_json::Value> = Slot::all()
                .map(|slot| {
                    let value = r.effective_value(&row.student_id, slot);
                    json!({
                        "slot": slot.number(),
                        "value": value.to_string(),
                        "edited": matches!(value, EffectiveValue::Edited(_)),
                        "locked": r.is_locked(&row.student_id, slot, &session.unlocked),
                        "recordId": row
                            .persisted(ctx.stage, slot)
                            .and_then(|g| g.record_id.clone()),
                    })
                })
                .collect();
            json!({
                "studentId": row.student_id,
                "displayName": row.display_name,
                "cells": cells,
                "average": r.average(&row.student_id),
                "savedAverage": row.average(),
                "pending": r.has_pending(&row.student_id),
            })
        })
        .collect();
    let empty_columns: Vec<u8> = Slot::all()
        .filter(|s| r.is_column_empty(*s))
        .map(Slot::number)
        .collect();

    json!({
        "cacheKey": session.cell.key(),
        "subjectId": ctx.subject_id,
        "courseId": ctx.course_id,
        "stage": ctx.stage.number(),
        "academicYear": ctx.academic_year,
        "editMode": r.edit_mode(),
        "emptyColumns": empty_columns,
        "unlockedCount": session.unlocked.len(),
        "rows": rows,
    })
}

fn grades_open(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let ctx = context_from_params(req)?;
    let Some(conn) = state.db.as_ref() else {
        return Err(no_workspace());
    };
    let key = ctx.cache_key();
    let ttl = state.config.cache_ttl;
    let from_cache = state.grade_cache.fresh(&key, ttl).is_some();
    let cell = FetchCell::new(state.grade_cache.clone(), key, ttl);
    let rows = fetch_rows(&state.runtime, &cell, conn, &ctx, false)?;
    info!(cache_key = cell.key(), rows = rows.len(), from_cache, "grade grid opened");

    let session = GradeSession {
        cell,
        reconciler: GradeReconciler::new(ctx, rows),
        unlocked: UnlockSet::default(),
    };
    let mut view = session_view(&session);
    view["fromCache"] = json!(from_cache);
    state.session = Some(session);
    Ok(view)
}

fn grades_refresh(state: &mut AppState) -> Result<serde_json::Value, HandlerErr> {
    let AppState {
        db,
        session,
        runtime,
        ..
    } = state;
    let conn = db.as_ref().ok_or_else(no_workspace)?;
    let session = session.as_mut().ok_or_else(no_session)?;
    let ctx = session.reconciler.context().clone();
    let rows = fetch_rows(runtime, &session.cell, conn, &ctx, true)?;
    session.reconciler.replace_baseline(rows);
    session.unlocked = UnlockSet::default();
    Ok(session_view(session))
}

fn grades_view(state: &mut AppState) -> Result<serde_json::Value, HandlerErr> {
    let session = state.session.as_ref().ok_or_else(no_session)?;
    Ok(session_view(session))
}

fn grades_set_cell(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let session = state.session.as_mut().ok_or_else(no_session)?;
    let student_id = str_param(req, "studentId")?;
    let slot = slot_param(req)?;
    let raw = match req.params.get("value") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        Some(serde_json::Value::Null) => String::new(),
        _ => return Err(HandlerErr::bad_params("value must be a string, number or null")),
    };
    require_student(&session.reconciler, &student_id)?;

    let locked = session
        .reconciler
        .is_locked(&student_id, slot, &session.unlocked);
    let accepted = !locked && session.reconciler.set_cell_value(&student_id, slot, &raw);

    let r = &session.reconciler;
    Ok(json!({
        "accepted": accepted,
        "locked": locked,
        "value": r.effective_value(&student_id, slot).to_string(),
        "average": r.average(&student_id),
    }))
}

fn grades_set_edit_mode(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let session = state.session.as_mut().ok_or_else(no_session)?;
    let Some(enabled) = req.params.get("enabled").and_then(|v| v.as_bool()) else {
        return Err(HandlerErr::bad_params("missing enabled"));
    };
    session.reconciler.set_edit_mode(enabled);
    Ok(session_view(session))
}

fn grades_unlock(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let session = state.session.as_mut().ok_or_else(no_session)?;
    let r = &session.reconciler;
    match req.method.as_str() {
        "grades.unlockCell" => {
            let student_id = str_param(req, "studentId")?;
            let slot = slot_param(req)?;
            require_student(r, &student_id)?;
            r.unlock_cell(&student_id, slot, &mut session.unlocked);
        }
        "grades.unlockRow" => {
            let student_id = str_param(req, "studentId")?;
            require_student(r, &student_id)?;
            r.unlock_row(&student_id, &mut session.unlocked);
        }
        _ => {
            let slot = slot_param(req)?;
            r.unlock_column(slot, &mut session.unlocked);
        }
    }
    Ok(session_view(session))
}

fn selected_batches(
    reconciler: &GradeReconciler,
    student_id: Option<&str>,
) -> Vec<StudentBatch> {
    match student_id {
        Some(id) => {
            let payloads = reconciler.build_payloads(id);
            if payloads.is_empty() {
                Vec::new()
            } else {
                vec![StudentBatch {
                    student_id: id.to_string(),
                    payloads,
                }]
            }
        }
        None => reconciler.build_all_payloads(),
    }
}

fn grades_payloads(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let session = state.session.as_ref().ok_or_else(no_session)?;
    let student_id = opt_str_param(req, "studentId");
    if let Some(id) = student_id.as_deref() {
        require_student(&session.reconciler, id)?;
    }
    let batches = selected_batches(&session.reconciler, student_id.as_deref());
    Ok(json!({ "batches": batches }))
}

fn grades_save(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let student_id = if req.method == "grades.save" {
        Some(str_param(req, "studentId")?)
    } else {
        None
    };
    let AppState {
        db,
        session,
        runtime,
        ..
    } = state;
    let conn = db.as_mut().ok_or_else(no_workspace)?;
    let session = session.as_mut().ok_or_else(no_session)?;
    if let Some(id) = student_id.as_deref() {
        require_student(&session.reconciler, id)?;
    }

    let batches = selected_batches(&session.reconciler, student_id.as_deref());
    if batches.is_empty() {
        return Ok(json!({ "results": [], "saved": 0, "failed": 0 }));
    }

    let ctx = session.reconciler.context().clone();
    let outcomes = save_batches(&mut SqliteGradeSink::new(conn), &ctx, &batches);
    let written: Vec<String> = outcomes
        .iter()
        .filter(|o| o.ok)
        .map(|o| o.student_id.clone())
        .collect();
    let failed = outcomes.len() - written.len();
    info!(
        cache_key = session.cell.key(),
        saved = written.len(),
        failed,
        "grade batches applied"
    );

    let reload_error = if written.is_empty() {
        None
    } else {
        reload_after_write(runtime, conn, session, &written)
            .err()
            .map(|e| e.message)
    };

    Ok(json!({
        "results": outcomes,
        "saved": written.len(),
        "failed": failed,
        "refreshRequired": reload_error.is_some(),
        "reloadError": reload_error,
        "view": session_view(session),
    }))
}

fn grades_discard(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let session = state.session.as_mut().ok_or_else(no_session)?;
    match opt_str_param(req, "studentId") {
        Some(id) => {
            require_student(&session.reconciler, &id)?;
            session.reconciler.discard_row(&id);
        }
        None => session.reconciler.discard_all(),
    }
    Ok(session_view(session))
}

fn grades_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let student_id = str_param(req, "studentId")?;
    let slot = slot_param(req)?;
    let record_id = str_param(req, "recordId")?;
    let confirmed = req
        .params
        .get("confirmed")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let AppState {
        db,
        session,
        runtime,
        ..
    } = state;
    let conn = db.as_mut().ok_or_else(no_workspace)?;
    let session = session.as_mut().ok_or_else(no_session)?;
    require_student(&session.reconciler, &student_id)?;

    let stage = session.reconciler.context().stage;
    let known = session
        .reconciler
        .rows()
        .iter()
        .filter(|r| r.student_id == student_id)
        .filter_map(|r| r.persisted(stage, slot))
        .any(|g| g.record_id.as_deref() == Some(record_id.as_str()));
    if !known {
        return Err(HandlerErr::new("not_found", "grade record not found").with_details(
            json!({ "studentId": student_id, "slot": slot.number(), "recordId": record_id }),
        ));
    }

    let Some(intent) =
        session
            .reconciler
            .confirm_delete(&student_id, slot, &record_id, |_| confirmed)
    else {
        return Ok(json!({ "deleted": false, "requiresConfirmation": true }));
    };

    SqliteGradeSink::new(conn)
        .apply_delete(&intent)
        .map_err(|e| HandlerErr::new("db_delete_failed", format!("{e:#}")))?;
    info!(student_id = %intent.student_id, slot = %intent.slot, "grade record deleted");

    let reload_error = reload_after_write(runtime, conn, session, &[])
        .err()
        .map(|e| e.message);
    Ok(json!({
        "deleted": true,
        "intent": intent,
        "refreshRequired": reload_error.is_some(),
        "reloadError": reload_error,
        "view": session_view(session),
    }))
}

fn grades_general_averages(state: &mut AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.db.as_ref().ok_or_else(no_workspace)?;
    let session = state.session.as_ref().ok_or_else(no_session)?;
    let ctx = session.reconciler.context();
    let rows = db::load_grade_rows(
        conn,
        &ctx.subject_id,
        &ctx.course_id,
        ctx.academic_year,
        None,
    )
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let students: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| {
            json!({
                "studentId": row.student_id,
                "displayName": row.display_name,
                "generalAverage": general_average(&row.grades),
            })
        })
        .collect();
    Ok(json!({ "students": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "grades.open" => grades_open(state, req),
        "grades.refresh" => grades_refresh(state),
        "grades.view" => grades_view(state),
        "grades.setCell" => grades_set_cell(state, req),
        "grades.setEditMode" => grades_set_edit_mode(state, req),
        "grades.unlockCell" | "grades.unlockRow" | "grades.unlockColumn" => {
            grades_unlock(state, req)
        }
        "grades.payloads" => grades_payloads(state, req),
        "grades.save" | "grades.saveAll" => grades_save(state, req),
        "grades.discard" => grades_discard(state, req),
        "grades.delete" => grades_delete(state, req),
        "grades.generalAverages" => grades_general_averages(state),
        _ => return None,
    };
    Some(respond(&req.id, result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FetchCache;
    use crate::grades::GradeSlot;
    use std::sync::Arc;
    use std::time::Duration;

    fn session() -> GradeSession {
        let ctx = GradeContext {
            subject_id: "mat".into(),
            course_id: "3B".into(),
            enrollment_id: None,
            stage: Stage::First,
            academic_year: 2026,
        };
        let rows = vec![StudentGradeRow {
            student_id: "ana".into(),
            display_name: "Ana Paz".into(),
            grades: vec![GradeSlot {
                slot: Slot::try_from(1_i64).unwrap(),
                stage: Stage::First,
                value: Some(6.0),
                record_id: Some("c-ana-1".into()),
            }],
        }];
        GradeSession {
            cell: FetchCell::new(
                Arc::new(FetchCache::new()),
                ctx.cache_key(),
                Duration::from_secs(60),
            ),
            reconciler: GradeReconciler::new(ctx, rows),
            unlocked: UnlockSet::default(),
        }
    }

    #[test]
    fn failed_reload_keeps_written_edits() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        // No schema: every baseline query fails.
        let conn = Connection::open_in_memory().unwrap();
        let mut session = session();
        let slot = Slot::try_from(1_i64).unwrap();
        assert!(session.reconciler.set_cell_value("ana", slot, "9"));

        let err = reload_after_write(&runtime, &conn, &mut session, &["ana".to_string()])
            .err()
            .expect("reload fails");
        assert_eq!(err.code, "load_failed");
        assert!(session.reconciler.has_pending("ana"));
        assert_eq!(
            session.reconciler.effective_value("ana", slot),
            EffectiveValue::Edited("9".into())
        );

        let view = session_view(&session);
        assert_eq!(view["rows"][0]["cells"][0]["value"], json!("9"));
    }
}
