//! Versioned migration of permission documents.
//!
//! v1 (no `schema_version`): a flat list of `"resource.action"` strings, either
//! bare or under a `permissions` key.
//!
//! v2: `{"schema_version": 2, "grants": {"vans": ["read", "update"]}}`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

pub const CURRENT_VERSION: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MigrationError {
  #[error("unsupported permission schema version {0}")]
  UnsupportedVersion(u64),

  #[error("malformed permission document (v{version}): {reason}")]
  Malformed { version: u64, reason: String },
}

/// A permission document at the current schema version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDocument {
  pub schema_version: u64,
  /// Resource name to granted actions
  pub grants: BTreeMap<String, Vec<String>>,
}

type Step = fn(Value) -> Result<Value, MigrationError>;

/// `(from_version, step)`: each step lifts a document by one version.
const STEPS: &[(u64, Step)] = &[(1, v1_to_v2)];

/// Schema version of a raw document. Missing means v1.
pub fn version_of(doc: &Value) -> u64 {
  doc
    .get("schema_version")
    .and_then(Value::as_u64)
    .unwrap_or(1)
}

/// Bring a raw document up to [`CURRENT_VERSION`].
pub fn migrate(doc: Value) -> Result<PermissionDocument, MigrationError> {
  let mut version = version_of(&doc);
  if version > CURRENT_VERSION || version == 0 {
    return Err(MigrationError::UnsupportedVersion(version));
  }

  let mut doc = doc;
  while version < CURRENT_VERSION {
    let step = STEPS
      .iter()
      .find(|(from, _)| *from == version)
      .map(|(_, step)| *step)
      .ok_or(MigrationError::UnsupportedVersion(version))?;
    doc = step(doc)?;
    tracing::debug!(from = version, to = version + 1, "migrated permission document");
    version += 1;
  }

  serde_json::from_value(doc).map_err(|e| MigrationError::Malformed {
    version,
    reason: e.to_string(),
  })
}

fn v1_to_v2(doc: Value) -> Result<Value, MigrationError> {
  let malformed = |reason: &str| MigrationError::Malformed {
    version: 1,
    reason: reason.to_string(),
  };

  let entries = match doc {
    Value::Array(entries) => entries,
    Value::Object(mut map) => match map.remove("permissions") {
      Some(Value::Array(entries)) => entries,
      _ => return Err(malformed("expected a `permissions` list")),
    },
    Value::Null => Vec::new(),
    _ => return Err(malformed("expected a list of permissions")),
  };

  let mut grants: BTreeMap<String, Vec<String>> = BTreeMap::new();
  for entry in entries {
    let Some(entry) = entry.as_str() else {
      return Err(malformed("permission entries must be strings"));
    };
    let Some((resource, action)) = entry.split_once('.') else {
      tracing::warn!(entry, "skipping permission without action");
      continue;
    };
    let actions = grants.entry(resource.to_string()).or_default();
    if !actions.iter().any(|a| a == action) {
      actions.push(action.to_string());
    }
  }

  let grants: Map<String, Value> = grants
    .into_iter()
    .map(|(resource, actions)| (resource, json!(actions)))
    .collect();
  Ok(json!({ "schema_version": 2, "grants": grants }))
}
