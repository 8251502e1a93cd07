//! Field-level change tracking between a loaded snapshot and the in-memory record.

use crate::value::{Record, Value};
use std::collections::BTreeSet;

/// Original-vs-current view of one record. Built when a record is loaded for mutation and
/// reset after each successful save.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChangeSet {
    original: Record,
    current: Record,
}

impl ChangeSet {
    /// Snapshot of a persisted record; nothing is changed yet.
    pub fn loaded(record: Record) -> Self {
        ChangeSet {
            original: record.clone(),
            current: record,
        }
    }

    /// Record that does not exist yet: every present field counts as changed.
    pub fn created(record: Record) -> Self {
        ChangeSet {
            original: Record::new(),
            current: record,
        }
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.current.set(field, value);
    }

    /// Overlay every field of `changes` onto the current state.
    pub fn merge(&mut self, changes: Record) {
        for (field, value) in changes {
            self.current.set(field, value);
        }
    }

    pub fn current(&self) -> &Record {
        &self.current
    }

    pub fn original(&self) -> &Record {
        &self.original
    }

    /// Deep comparison; a field missing on one side and null on the other counts as unchanged.
    pub fn changed(&self, field: &str) -> bool {
        let before = self.original.get(field).unwrap_or(&Value::Null);
        let after = self.current.get(field).unwrap_or(&Value::Null);
        before != after
    }

    pub fn changed_fields(&self) -> Vec<String> {
        let names: BTreeSet<&str> = self.original.fields().chain(self.current.fields()).collect();
        names
            .into_iter()
            .filter(|f| self.changed(f))
            .map(String::from)
            .collect()
    }

    pub fn changed_to(&self, field: &str, value: &Value) -> bool {
        self.changed(field) && self.current.get(field).unwrap_or(&Value::Null) == value
    }

    pub fn changed_from(&self, field: &str, value: &Value) -> bool {
        self.changed(field) && self.original.get(field).unwrap_or(&Value::Null) == value
    }

    /// Snapshot value of a changed field. None when the field is unchanged.
    pub fn previous_value(&self, field: &str) -> Option<&Value> {
        if self.changed(field) {
            Some(self.original.get(field).unwrap_or(&Value::Null))
        } else {
            None
        }
    }

    /// Only the modified fields with their current values; what the write path sends.
    pub fn changed_data(&self) -> Record {
        self.changed_fields()
            .into_iter()
            .map(|f| {
                let v = self.current.get(&f).cloned().unwrap_or(Value::Null);
                (f, v)
            })
            .collect()
    }

    pub fn is_dirty(&self) -> bool {
        !self.changed_fields().is_empty()
    }

    /// Re-snapshot after a successful save. `persisted` replaces the current state when given.
    pub fn reset(&mut self, persisted: Option<Record>) {
        if let Some(r) = persisted {
            self.current = r;
        }
        self.original = self.current.clone();
    }

    pub fn into_current(self) -> Record {
        self.current
    }
}
