use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const SLOTS_PER_STAGE: u8 = 4;
pub const MIN_GRADE: f64 = 1.0;
pub const MAX_GRADE: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GradeError {
    #[error("slot must be between 1 and 4, got {0}")]
    SlotOutOfRange(i64),
    #[error("stage must be 1 or 2, got {0}")]
    StageOutOfRange(i64),
    #[error("grade must be a number between 1 and 10, got {0:?}")]
    InvalidGrade(String),
}

/// Assessment position within a stage (`numeroNota`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct Slot(u8);

impl Slot {
    pub fn all() -> impl Iterator<Item = Slot> {
        (1..=SLOTS_PER_STAGE).map(Slot)
    }

    pub fn number(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Slot {
    type Error = GradeError;

    fn try_from(v: i64) -> Result<Self, Self::Error> {
        if (1..=i64::from(SLOTS_PER_STAGE)).contains(&v) {
            Ok(Slot(v as u8))
        } else {
            Err(GradeError::SlotOutOfRange(v))
        }
    }
}

impl From<Slot> for u8 {
    fn from(s: Slot) -> u8 {
        s.0
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Grading period (`etapa`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub enum Stage {
    First,
    Second,
}

impl Stage {
    pub fn number(self) -> u8 {
        match self {
            Stage::First => 1,
            Stage::Second => 2,
        }
    }
}

impl TryFrom<i64> for Stage {
    type Error = GradeError;

    fn try_from(v: i64) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Stage::First),
            2 => Ok(Stage::Second),
            other => Err(GradeError::StageOutOfRange(other)),
        }
    }
}

impl From<Stage> for u8 {
    fn from(s: Stage) -> u8 {
        s.number()
    }
}

/// Parses a grid keystroke value. `Ok(None)` means the cell was cleared.
pub fn parse_grade(raw: &str) -> Result<Option<f64>, GradeError> {
    let t = raw.trim();
    if t.is_empty() {
        return Ok(None);
    }
    match t.parse::<f64>() {
        Ok(v) if v.is_finite() && (MIN_GRADE..=MAX_GRADE).contains(&v) => Ok(Some(v)),
        _ => Err(GradeError::InvalidGrade(raw.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeSlot {
    #[serde(rename = "numeroNota")]
    pub slot: Slot,
    #[serde(rename = "etapa")]
    pub stage: Stage,
    #[serde(rename = "nota")]
    pub value: Option<f64>,
    #[serde(rename = "califId", default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentGradeRow {
    pub student_id: String,
    pub display_name: String,
    #[serde(rename = "calificaciones", default)]
    pub grades: Vec<GradeSlot>,
}

impl StudentGradeRow {
    pub fn persisted(&self, stage: Stage, slot: Slot) -> Option<&GradeSlot> {
        self.grades
            .iter()
            .find(|g| g.stage == stage && g.slot == slot)
    }

    /// Average of the persisted values only.
    pub fn average(&self) -> Average {
        Average::of(self.grades.iter().filter_map(|g| g.value))
    }
}

/// Mean grade rounded to two decimals, or missing when nothing is numeric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Average {
    Mean(f64),
    Missing,
}

impl Average {
    pub fn of<I>(values: I) -> Average
    where
        I: IntoIterator<Item = f64>,
    {
        let mut sum = 0.0;
        let mut count = 0usize;
        for v in values {
            sum += v;
            count += 1;
        }
        if count == 0 {
            return Average::Missing;
        }
        Average::Mean(round_2_decimals(sum / count as f64))
    }
}

impl fmt::Display for Average {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Average::Mean(v) => write!(f, "{v:.2}"),
            Average::Missing => f.write_str("-"),
        }
    }
}

impl Serialize for Average {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

pub fn round_2_decimals(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// PG: mean over every persisted grade of a student, across both stages.
pub fn general_average(grades: &[GradeSlot]) -> Average {
    Average::of(grades.iter().filter_map(|g| g.value))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradeContext {
    pub subject_id: String,
    pub course_id: String,
    pub enrollment_id: Option<String>,
    pub stage: Stage,
    pub academic_year: i32,
}

impl GradeContext {
    pub fn cache_key(&self) -> String {
        format!(
            "grades:{}:{}:{}:{}",
            self.subject_id,
            self.course_id,
            self.stage.number(),
            self.academic_year
        )
    }
}

pub fn format_fecha(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatePayload {
    #[serde(rename = "alumnoId")]
    pub student_id: String,
    #[serde(rename = "materiaId")]
    pub subject_id: String,
    #[serde(rename = "materiaCursoId", default, skip_serializing_if = "Option::is_none")]
    pub enrollment_id: Option<String>,
    #[serde(rename = "nota")]
    pub value: f64,
    #[serde(rename = "etapa")]
    pub stage: Stage,
    #[serde(rename = "numeroNota")]
    pub slot: Slot,
    pub fecha: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePayload {
    #[serde(rename = "alumnoId")]
    pub student_id: String,
    #[serde(rename = "materiaId")]
    pub subject_id: String,
    #[serde(rename = "califId")]
    pub record_id: String,
    #[serde(rename = "nota")]
    pub value: f64,
    pub fecha: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SavePayload {
    Create(CreatePayload),
    Update(UpdatePayload),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentBatch {
    pub student_id: String,
    pub payloads: Vec<SavePayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteIntent {
    #[serde(rename = "alumnoId")]
    pub student_id: String,
    #[serde(rename = "numeroNota")]
    pub slot: Slot,
    #[serde(rename = "califId")]
    pub record_id: String,
}

/// Persistence collaborator for save payloads and delete intents.
pub trait GradeSink {
    fn apply_batch(&mut self, ctx: &GradeContext, batch: &StudentBatch) -> anyhow::Result<()>;
    fn apply_delete(&mut self, intent: &DeleteIntent) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub student_id: String,
    pub ok: bool,
    pub saved: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Applies every batch independently; one student's failure does not stop
/// the others.
pub fn save_batches<S: GradeSink>(
    sink: &mut S,
    ctx: &GradeContext,
    batches: &[StudentBatch],
) -> Vec<BatchOutcome> {
    batches
        .iter()
        .map(|batch| match sink.apply_batch(ctx, batch) {
            Ok(()) => BatchOutcome {
                student_id: batch.student_id.clone(),
                ok: true,
                saved: batch.payloads.len(),
                error: None,
            },
            Err(e) => {
                tracing::warn!(student_id = %batch.student_id, error = %e, "grade batch failed");
                BatchOutcome {
                    student_id: batch.student_id.clone(),
                    ok: false,
                    saved: 0,
                    error: Some(format!("{e:#}")),
                }
            }
        })
        .collect()
}
