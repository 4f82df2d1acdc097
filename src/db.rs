use crate::grades::{
    DeleteIntent, GradeContext, GradeSink, GradeSlot, SavePayload, Slot, Stage, StudentBatch,
    StudentGradeRow,
};
use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("gradebook.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            display_name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_course_sort ON students(course_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_records(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            academic_year INTEGER NOT NULL,
            stage INTEGER NOT NULL,
            slot_number INTEGER NOT NULL,
            value REAL,
            recorded_on TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(student_id, subject_id, academic_year, stage, slot_number)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_records_subject ON grade_records(subject_id, academic_year, stage)",
        [],
    )?;

    // Older workspaces stored grades without the subject-course link.
    ensure_grade_records_enrollment_id(&conn)?;

    Ok(conn)
}

fn ensure_grade_records_enrollment_id(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "grade_records", "enrollment_id")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE grade_records ADD COLUMN enrollment_id TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRecord {
    pub id: String,
    pub display_name: String,
    pub sort_order: i64,
    pub active: bool,
}

pub fn insert_students(
    conn: &mut Connection,
    course_id: &str,
    display_names: &[String],
) -> anyhow::Result<Vec<String>> {
    let tx = conn.transaction()?;
    let next_order: i64 = tx.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE course_id = ?",
        [course_id],
        |r| r.get(0),
    )?;
    let mut ids = Vec::with_capacity(display_names.len());
    for (i, name) in display_names.iter().enumerate() {
        let id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO students(id, course_id, display_name, active, sort_order, updated_at)
             VALUES(?, ?, ?, 1, ?, datetime('now'))",
            (&id, course_id, name.trim(), next_order + i as i64),
        )?;
        ids.push(id);
    }
    tx.commit()?;
    Ok(ids)
}

pub fn list_students(conn: &Connection, course_id: &str) -> anyhow::Result<Vec<StudentRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, display_name, sort_order, active FROM students
         WHERE course_id = ? ORDER BY sort_order",
    )?;
    let rows = stmt
        .query_map([course_id], |r| {
            Ok(StudentRecord {
                id: r.get(0)?,
                display_name: r.get(1)?,
                sort_order: r.get(2)?,
                active: r.get::<_, i64>(3)? != 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Active students of the course with their grades for the subject/year.
/// `stage = None` returns both stages.
pub fn load_grade_rows(
    conn: &Connection,
    subject_id: &str,
    course_id: &str,
    academic_year: i32,
    stage: Option<Stage>,
) -> anyhow::Result<Vec<StudentGradeRow>> {
    let mut stud_stmt = conn.prepare(
        "SELECT id, display_name FROM students
         WHERE course_id = ? AND active = 1 ORDER BY sort_order",
    )?;
    let mut rows = stud_stmt
        .query_map([course_id], |r| {
            Ok(StudentGradeRow {
                student_id: r.get(0)?,
                display_name: r.get(1)?,
                grades: Vec::new(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut grade_stmt = conn.prepare(
        "SELECT g.student_id, g.id, g.stage, g.slot_number, g.value
         FROM grade_records g
         JOIN students s ON s.id = g.student_id
         WHERE s.course_id = ? AND g.subject_id = ? AND g.academic_year = ?
           AND (? IS NULL OR g.stage = ?)
         ORDER BY g.stage, g.slot_number",
    )?;
    let stage_param = stage.map(|s| i64::from(s.number()));
    let raw = grade_stmt
        .query_map(
            (course_id, subject_id, academic_year, stage_param, stage_param),
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, Option<f64>>(4)?,
                ))
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;

    let mut by_student: HashMap<String, Vec<GradeSlot>> = HashMap::new();
    for (student_id, record_id, stage_no, slot_no, value) in raw {
        let grade = GradeSlot {
            slot: Slot::try_from(slot_no).with_context(|| format!("grade record {record_id}"))?,
            stage: Stage::try_from(stage_no)
                .with_context(|| format!("grade record {record_id}"))?,
            value,
            record_id: Some(record_id),
        };
        by_student.entry(student_id).or_default().push(grade);
    }
    for row in &mut rows {
        if let Some(grades) = by_student.remove(&row.student_id) {
            row.grades = grades;
        }
    }
    Ok(rows)
}

/// SQLite-backed save/delete collaborator.
pub struct SqliteGradeSink<'a> {
    conn: &'a mut Connection,
}

impl<'a> SqliteGradeSink<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }
}

impl GradeSink for SqliteGradeSink<'_> {
    fn apply_batch(&mut self, ctx: &GradeContext, batch: &StudentBatch) -> anyhow::Result<()> {
        let tx = self.conn.transaction()?;
        for payload in &batch.payloads {
            match payload {
                SavePayload::Create(p) => {
                    let existing: Option<String> = tx
                        .query_row(
                            "SELECT id FROM grade_records
                             WHERE student_id = ? AND subject_id = ? AND academic_year = ?
                               AND stage = ? AND slot_number = ?",
                            (
                                &p.student_id,
                                &p.subject_id,
                                ctx.academic_year,
                                p.stage.number(),
                                p.slot.number(),
                            ),
                            |r| r.get(0),
                        )
                        .optional()?;
                    if let Some(id) = existing {
                        anyhow::bail!("slot {} already graded (record {id})", p.slot);
                    }
                    tx.execute(
                        "INSERT INTO grade_records(
                            id, student_id, subject_id, enrollment_id, academic_year,
                            stage, slot_number, value, recorded_on)
                         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
                        (
                            Uuid::new_v4().to_string(),
                            &p.student_id,
                            &p.subject_id,
                            &p.enrollment_id,
                            ctx.academic_year,
                            p.stage.number(),
                            p.slot.number(),
                            p.value,
                            &p.fecha,
                        ),
                    )?;
                }
                SavePayload::Update(p) => {
                    let changed = tx.execute(
                        "UPDATE grade_records SET value = ?, recorded_on = ?
                         WHERE id = ? AND student_id = ? AND subject_id = ?",
                        (p.value, &p.fecha, &p.record_id, &p.student_id, &p.subject_id),
                    )?;
                    if changed == 0 {
                        anyhow::bail!("grade record {} not found", p.record_id);
                    }
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn apply_delete(&mut self, intent: &DeleteIntent) -> anyhow::Result<()> {
        let changed = self.conn.execute(
            "DELETE FROM grade_records WHERE id = ? AND student_id = ? AND slot_number = ?",
            (&intent.record_id, &intent.student_id, intent.slot.number()),
        )?;
        if changed == 0 {
            anyhow::bail!("grade record {} not found", intent.record_id);
        }
        Ok(())
    }
}
