use crate::db;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

const ROSTER_IMPORT_MAX_STUDENTS: usize = 500;

fn course_id(req: &Request) -> Result<String, HandlerErr> {
    req.params
        .get("courseId")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params("missing courseId"))
}

fn roster_import(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let Some(conn) = state.db.as_mut() else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };
    let course_id = course_id(req)?;
    let Some(items) = req.params.get("students").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing students"));
    };
    if items.len() > ROSTER_IMPORT_MAX_STUDENTS {
        return Err(HandlerErr::bad_params("too many students").with_details(json!({
            "max": ROSTER_IMPORT_MAX_STUDENTS,
            "got": items.len()
        })));
    }

    // Accept plain names or {displayName} objects.
    let mut names = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let name = item
            .as_str()
            .or_else(|| item.get("displayName").and_then(|v| v.as_str()))
            .map(str::trim)
            .filter(|s| !s.is_empty());
        match name {
            Some(n) => names.push(n.to_string()),
            None => {
                return Err(HandlerErr::bad_params("student needs a displayName")
                    .with_details(json!({ "index": i })))
            }
        }
    }

    let ids = db::insert_students(conn, &course_id, &names).map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "students" }))
    })?;
    Ok(json!({ "courseId": course_id, "studentIds": ids }))
}

fn roster_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let Some(conn) = state.db.as_ref() else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };
    let course_id = course_id(req)?;
    let students = db::list_students(conn, &course_id)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok(json!({ "courseId": course_id, "students": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "roster.import" => roster_import(state, req),
        "roster.list" => roster_list(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
