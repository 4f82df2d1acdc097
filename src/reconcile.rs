//! Unsaved grade edits layered over the persisted baseline.
//!
//! Lookups go overlay first, then baseline. The baseline is never mutated by
//! edits; a refresh replaces it wholesale and drops the overlay.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use chrono::{Local, NaiveDate};

use crate::grades::{
    format_fecha, parse_grade, Average, CreatePayload, DeleteIntent, GradeContext, SavePayload,
    Slot, StudentBatch, StudentGradeRow, UpdatePayload,
};

/// Cells unlocked while edit mode is on. Owned by the caller; the reconciler
/// only ever adds to it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnlockSet(HashSet<(String, Slot)>);

impl UnlockSet {
    pub fn contains(&self, student_id: &str, slot: Slot) -> bool {
        self.0.contains(&(student_id.to_string(), slot))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    fn insert(&mut self, student_id: &str, slot: Slot) {
        self.0.insert((student_id.to_string(), slot));
    }
}

/// A column with no persisted values is always open; otherwise a cell opens
/// only in edit mode and only once it has been unlocked.
pub fn lock_state(column_empty: bool, edit_mode: bool, unlocked: bool) -> bool {
    if column_empty {
        return false;
    }
    !(edit_mode && unlocked)
}

#[derive(Debug, Clone, PartialEq)]
pub enum EffectiveValue {
    Edited(String),
    Saved(f64),
    Empty,
}

impl EffectiveValue {
    pub fn number(&self) -> Option<f64> {
        match self {
            EffectiveValue::Edited(raw) => parse_grade(raw).ok().flatten(),
            EffectiveValue::Saved(v) => Some(*v),
            EffectiveValue::Empty => None,
        }
    }
}

impl fmt::Display for EffectiveValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EffectiveValue::Edited(raw) => f.write_str(raw),
            EffectiveValue::Saved(v) => write!(f, "{v}"),
            EffectiveValue::Empty => Ok(()),
        }
    }
}

pub struct GradeReconciler {
    context: GradeContext,
    baseline: Vec<StudentGradeRow>,
    overlay: HashMap<String, BTreeMap<Slot, String>>,
    edit_mode: bool,
}

impl GradeReconciler {
    pub fn new(context: GradeContext, baseline: Vec<StudentGradeRow>) -> Self {
        Self {
            context,
            baseline,
            overlay: HashMap::new(),
            edit_mode: false,
        }
    }

    pub fn context(&self) -> &GradeContext {
        &self.context
    }

    pub fn rows(&self) -> &[StudentGradeRow] {
        &self.baseline
    }

    pub fn edit_mode(&self) -> bool {
        self.edit_mode
    }

    pub fn set_edit_mode(&mut self, enabled: bool) {
        self.edit_mode = enabled;
    }

    pub fn replace_baseline(&mut self, rows: Vec<StudentGradeRow>) {
        self.baseline = rows;
        self.overlay.clear();
    }

    pub fn has_pending(&self, student_id: &str) -> bool {
        self.overlay.get(student_id).is_some_and(|m| !m.is_empty())
    }

    pub fn pending_edits(&self, student_id: &str) -> Vec<(Slot, String)> {
        self.overlay
            .get(student_id)
            .map(|m| m.iter().map(|(slot, raw)| (*slot, raw.clone())).collect())
            .unwrap_or_default()
    }

    pub fn discard_row(&mut self, student_id: &str) {
        self.overlay.remove(student_id);
    }

    pub fn discard_all(&mut self) {
        self.overlay.clear();
    }

    fn row(&self, student_id: &str) -> Option<&StudentGradeRow> {
        self.baseline.iter().find(|r| r.student_id == student_id)
    }

    /// Returns false (and leaves state untouched) for out-of-range or
    /// non-numeric input and for students outside the baseline. Accepted
    /// values are stored in canonical form (`"010"` becomes `"10"`).
    pub fn set_cell_value(&mut self, student_id: &str, slot: Slot, raw: &str) -> bool {
        if self.row(student_id).is_none() {
            return false;
        }
        let canonical = match parse_grade(raw) {
            Ok(Some(v)) => v.to_string(),
            Ok(None) => String::new(),
            Err(_) => return false,
        };
        self.overlay
            .entry(student_id.to_string())
            .or_default()
            .insert(slot, canonical);
        true
    }

    pub fn effective_value(&self, student_id: &str, slot: Slot) -> EffectiveValue {
        if let Some(raw) = self.overlay.get(student_id).and_then(|m| m.get(&slot)) {
            return EffectiveValue::Edited(raw.clone());
        }
        self.row(student_id)
            .and_then(|r| r.persisted(self.context.stage, slot))
            .and_then(|g| g.value)
            .map_or(EffectiveValue::Empty, EffectiveValue::Saved)
    }

    pub fn average(&self, student_id: &str) -> Average {
        Average::of(
            Slot::all().filter_map(|slot| self.effective_value(student_id, slot).number()),
        )
    }

    pub fn is_column_empty(&self, slot: Slot) -> bool {
        !self.baseline.iter().any(|r| {
            r.persisted(self.context.stage, slot)
                .is_some_and(|g| g.value.is_some())
        })
    }

    pub fn is_locked(&self, student_id: &str, slot: Slot, unlocked: &UnlockSet) -> bool {
        lock_state(
            self.is_column_empty(slot),
            self.edit_mode,
            unlocked.contains(student_id, slot),
        )
    }

    pub fn unlock_cell(&self, student_id: &str, slot: Slot, unlocked: &mut UnlockSet) {
        unlocked.insert(student_id, slot);
    }

    pub fn unlock_row(&self, student_id: &str, unlocked: &mut UnlockSet) {
        for slot in Slot::all() {
            unlocked.insert(student_id, slot);
        }
    }

    pub fn unlock_column(&self, slot: Slot, unlocked: &mut UnlockSet) {
        for row in &self.baseline {
            unlocked.insert(&row.student_id, slot);
        }
    }

    pub fn build_payloads(&self, student_id: &str) -> Vec<SavePayload> {
        self.build_payloads_on(student_id, Local::now().date_naive())
    }

    pub fn build_payloads_on(&self, student_id: &str, date: NaiveDate) -> Vec<SavePayload> {
        let Some(edits) = self.overlay.get(student_id) else {
            return Vec::new();
        };
        let row = self.row(student_id);
        let fecha = format_fecha(date);
        let ctx = &self.context;

        let mut out = Vec::new();
        for (slot, raw) in edits {
            let Ok(Some(value)) = parse_grade(raw) else {
                continue;
            };
            let record_id = row
                .and_then(|r| r.persisted(ctx.stage, *slot))
                .and_then(|g| g.record_id.clone());
            let payload = match record_id {
                Some(record_id) => SavePayload::Update(UpdatePayload {
                    student_id: student_id.to_string(),
                    subject_id: ctx.subject_id.clone(),
                    record_id,
                    value,
                    fecha: fecha.clone(),
                }),
                None => SavePayload::Create(CreatePayload {
                    student_id: student_id.to_string(),
                    subject_id: ctx.subject_id.clone(),
                    enrollment_id: ctx.enrollment_id.clone(),
                    value,
                    stage: ctx.stage,
                    slot: *slot,
                    fecha: fecha.clone(),
                }),
            };
            out.push(payload);
        }
        out
    }

    pub fn build_all_payloads(&self) -> Vec<StudentBatch> {
        self.build_all_payloads_on(Local::now().date_naive())
    }

    pub fn build_all_payloads_on(&self, date: NaiveDate) -> Vec<StudentBatch> {
        self.baseline
            .iter()
            .filter(|r| self.has_pending(&r.student_id))
            .map(|r| StudentBatch {
                student_id: r.student_id.clone(),
                payloads: self.build_payloads_on(&r.student_id, date),
            })
            .filter(|b| !b.payloads.is_empty())
            .collect()
    }

    /// Builds the delete intent and hands it to `confirm`; the intent is only
    /// returned when confirmed. The caller dispatches it and re-fetches.
    pub fn confirm_delete<F>(
        &self,
        student_id: &str,
        slot: Slot,
        record_id: &str,
        confirm: F,
    ) -> Option<DeleteIntent>
    where
        F: FnOnce(&DeleteIntent) -> bool,
    {
        let intent = DeleteIntent {
            student_id: student_id.to_string(),
            slot,
            record_id: record_id.to_string(),
        };
        confirm(&intent).then_some(intent)
    }
}
