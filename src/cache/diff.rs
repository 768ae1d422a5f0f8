//! Selective diff between a cached record list and a freshly fetched one.
//!
//! Unchanged records keep their `Arc` so anything keyed on pointer identity
//! (memoized views, change detection) sees no change. Changed records are
//! rebuilt from the old fields overlaid with only the fields that differ.

use chrono::DateTime;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use super::record::{Record, RecordId};
use crate::error::DiffComputationError;

/// How string fields that look like timestamps are compared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampComparison {
  /// Compare as plain strings. `...00.000Z` and `...00Z` count as different.
  #[default]
  Lexical,
  /// Strings that both parse as RFC 3339 compare as instants.
  Parsed,
}

/// Result of diffing two record lists.
#[derive(Debug, Clone, Default)]
pub struct DiffOutcome {
  /// Old order for retained records (removed ones included), new records appended.
  pub merged: Vec<Arc<Record>>,
  pub changed_ids: Vec<RecordId>,
  pub new_ids: Vec<RecordId>,
  /// Present before, absent from the new list. Still in `merged`.
  pub removed_ids: Vec<RecordId>,
  pub changed_fields: BTreeMap<RecordId, Vec<String>>,
  pub skipped: Vec<DiffComputationError>,
  pub has_changes: bool,
}

impl DiffOutcome {
  /// The merged list with upstream deletions applied.
  pub fn without_removed(self) -> Vec<Arc<Record>> {
    if self.removed_ids.is_empty() {
      return self.merged;
    }
    let removed: HashSet<&RecordId> = self.removed_ids.iter().collect();
    self
      .merged
      .into_iter()
      .filter(|r| r.id().map_or(true, |id| !removed.contains(&id)))
      .collect()
  }
}

/// Field-level differ.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectiveDiff {
  timestamps: TimestampComparison,
}

impl SelectiveDiff {
  pub fn new(timestamps: TimestampComparison) -> Self {
    Self { timestamps }
  }

  pub fn diff(&self, old: &[Arc<Record>], new: Vec<Record>) -> DiffOutcome {
    let mut outcome = DiffOutcome::default();

    // Index the incoming records, keeping server order for appends
    let mut incoming: HashMap<RecordId, Record> = HashMap::with_capacity(new.len());
    let mut incoming_order: Vec<RecordId> = Vec::with_capacity(new.len());
    for (position, record) in new.into_iter().enumerate() {
      let Some(id) = record.id() else {
        tracing::warn!(position, "skipping fetched record without id");
        outcome
          .skipped
          .push(DiffComputationError::MissingId { position });
        continue;
      };
      if incoming.contains_key(&id) {
        tracing::warn!(%id, position, "skipping duplicate fetched record");
        outcome
          .skipped
          .push(DiffComputationError::DuplicateId { id, position });
        continue;
      }
      incoming_order.push(id.clone());
      incoming.insert(id, record);
    }

    let mut seen: HashSet<RecordId> = HashSet::with_capacity(old.len());
    for existing in old {
      let Some(id) = existing.id() else {
        continue;
      };
      seen.insert(id.clone());

      match incoming.get(&id) {
        Some(fresh) => {
          let changed = self.changed_fields(existing, fresh);
          if changed.is_empty() {
            outcome.merged.push(Arc::clone(existing));
          } else {
            tracing::debug!(%id, fields = ?changed, "record changed");
            let mut patch = Record::new();
            for field in &changed {
              if let Some(value) = fresh.get(field) {
                patch.set(field.clone(), value.clone());
              }
            }
            outcome.merged.push(Arc::new(existing.overlay(&patch)));
            outcome.changed_ids.push(id.clone());
            outcome.changed_fields.insert(id, changed);
          }
        }
        None => {
          outcome.merged.push(Arc::clone(existing));
          outcome.removed_ids.push(id);
        }
      }
    }

    for id in incoming_order {
      if seen.contains(&id) {
        continue;
      }
      if let Some(record) = incoming.remove(&id) {
        outcome.merged.push(Arc::new(record));
        outcome.new_ids.push(id);
      }
    }

    outcome.has_changes = !outcome.changed_ids.is_empty()
      || !outcome.new_ids.is_empty()
      || !outcome.removed_ids.is_empty();
    outcome
  }

  /// Names of fields in `fresh` whose value differs from `existing`.
  fn changed_fields(&self, existing: &Record, fresh: &Record) -> Vec<String> {
    fresh
      .fields()
      .iter()
      .filter(|(field, value)| match existing.get(field) {
        Some(current) => !self.values_equal(current, value),
        None => true,
      })
      .map(|(field, _)| field.clone())
      .collect()
  }

  fn values_equal(&self, a: &Value, b: &Value) -> bool {
    if a == b {
      return true;
    }
    match (self.timestamps, a, b) {
      (TimestampComparison::Parsed, Value::String(a), Value::String(b)) => {
        match (DateTime::parse_from_rfc3339(a), DateTime::parse_from_rfc3339(b)) {
          (Ok(a), Ok(b)) => a == b,
          _ => false,
        }
      }
      _ => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn record(value: Value) -> Record {
    Record::from_value(value).unwrap()
  }

  fn cached(values: Vec<Value>) -> Vec<Arc<Record>> {
    values.into_iter().map(|v| Arc::new(record(v))).collect()
  }

  #[test]
  fn test_identical_lists_reuse_every_record() {
    let old = cached(vec![
      json!({"id": "v1", "status": "Active", "meta": {"seats": 3}}),
      json!({"id": "v2", "status": "Maintenance"}),
    ]);
    let new = old.iter().map(|r| (**r).clone()).collect();

    let outcome = SelectiveDiff::default().diff(&old, new);

    assert!(!outcome.has_changes);
    assert_eq!(outcome.merged.len(), 2);
    for (before, after) in old.iter().zip(&outcome.merged) {
      assert!(Arc::ptr_eq(before, after));
    }
  }

  #[test]
  fn test_single_field_change_touches_only_that_record() {
    let old = cached(vec![
      json!({"id": "v1", "status": "Active"}),
      json!({"id": "v2", "status": "Active"}),
      json!({"id": "v3", "status": "Active"}),
    ]);
    let new = vec![
      record(json!({"id": "v1", "status": "Active"})),
      record(json!({"id": "v2", "status": "En Transit"})),
      record(json!({"id": "v3", "status": "Active"})),
    ];

    let outcome = SelectiveDiff::default().diff(&old, new);

    assert!(outcome.has_changes);
    assert_eq!(outcome.changed_ids, vec![RecordId::from("v2")]);
    assert_eq!(
      outcome.changed_fields[&RecordId::from("v2")],
      vec!["status".to_string()]
    );
    assert!(Arc::ptr_eq(&old[0], &outcome.merged[0]));
    assert!(!Arc::ptr_eq(&old[1], &outcome.merged[1]));
    assert!(Arc::ptr_eq(&old[2], &outcome.merged[2]));
    assert_eq!(outcome.merged[1].get_str("status"), Some("En Transit"));
  }

  #[test]
  fn test_changed_record_keeps_fields_missing_from_update() {
    let old = cached(vec![json!({"id": 1, "status": "active", "notes": "x"})]);
    let new = vec![record(json!({"id": 1, "status": "completed"}))];

    let outcome = SelectiveDiff::default().diff(&old, new);

    assert_eq!(outcome.merged[0].get_str("notes"), Some("x"));
    assert_eq!(outcome.merged[0].get_str("status"), Some("completed"));
  }

  #[test]
  fn test_new_records_are_appended_in_server_order() {
    let old = cached(vec![json!({"id": "a"})]);
    let new = vec![
      record(json!({"id": "c"})),
      record(json!({"id": "a"})),
      record(json!({"id": "b"})),
    ];

    let outcome = SelectiveDiff::default().diff(&old, new);

    let ids: Vec<_> = outcome.merged.iter().filter_map(|r| r.id()).collect();
    assert_eq!(
      ids,
      vec![RecordId::from("a"), RecordId::from("c"), RecordId::from("b")]
    );
    assert_eq!(outcome.new_ids, vec![RecordId::from("c"), RecordId::from("b")]);
  }

  #[test]
  fn test_removed_records_are_reported_not_dropped() {
    let old = cached(vec![json!({"id": "a"}), json!({"id": "b"})]);
    let new = vec![record(json!({"id": "a"}))];

    let outcome = SelectiveDiff::default().diff(&old, new);

    assert!(outcome.has_changes);
    assert_eq!(outcome.removed_ids, vec![RecordId::from("b")]);
    assert_eq!(outcome.merged.len(), 2);

    let applied = outcome.without_removed();
    assert_eq!(applied.len(), 1);
    assert!(Arc::ptr_eq(&applied[0], &old[0]));
  }

  #[test]
  fn test_malformed_records_are_skipped() {
    let old = cached(vec![json!({"id": "a"})]);
    let new = vec![
      record(json!({"name": "no id"})),
      record(json!({"id": "a"})),
      record(json!({"id": "b", "n": 1})),
      record(json!({"id": "b", "n": 2})),
    ];

    let outcome = SelectiveDiff::default().diff(&old, new);

    assert_eq!(
      outcome.skipped,
      vec![
        DiffComputationError::MissingId { position: 0 },
        DiffComputationError::DuplicateId {
          id: "b".into(),
          position: 3
        },
      ]
    );
    assert_eq!(outcome.new_ids, vec![RecordId::from("b")]);
    assert_eq!(outcome.merged[1].get("n"), Some(&json!(1)));
  }

  #[test]
  fn test_timestamp_serialization_counts_as_change_when_lexical() {
    let old = cached(vec![json!({"id": "t", "ended_at": "2024-05-01T10:00:00.000Z"})]);
    let new = vec![record(json!({"id": "t", "ended_at": "2024-05-01T10:00:00Z"}))];

    let lexical = SelectiveDiff::default().diff(&old, new.clone());
    assert!(lexical.has_changes);

    let parsed = SelectiveDiff::new(TimestampComparison::Parsed).diff(&old, new);
    assert!(!parsed.has_changes);
    assert!(Arc::ptr_eq(&old[0], &parsed.merged[0]));
  }

  #[test]
  fn test_nested_values_compare_structurally() {
    let old = cached(vec![json!({"id": "u", "roles": ["a", "b"]})]);
    let new = vec![record(json!({"id": "u", "roles": ["a", "c"]}))];

    let outcome = SelectiveDiff::default().diff(&old, new);
    assert_eq!(outcome.changed_ids, vec![RecordId::from("u")]);
  }
}
