//! Records, record ids and named collections held by the entity store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::UnknownCollection;

/// Prefix marking ids generated locally for optimistic inserts.
pub const PLACEHOLDER_PREFIX: &str = "optimistic-";

/// Identifier of a record. Numeric server ids are kept as their decimal string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  /// Placeholder id for an optimistic insert, never produced by the server.
  pub fn placeholder(seq: u64) -> Self {
    Self(format!("{PLACEHOLDER_PREFIX}{seq}"))
  }

  pub fn is_placeholder(&self) -> bool {
    self.0.starts_with(PLACEHOLDER_PREFIX)
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Read an id out of a JSON value. Empty strings and non-scalar values are not ids.
  pub fn from_value(value: &Value) -> Option<Self> {
    match value {
      Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
      Value::Number(n) => Some(Self(n.to_string())),
      _ => None,
    }
  }
}

impl<'de> Deserialize<'de> for RecordId {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    let value = Value::deserialize(deserializer)?;
    RecordId::from_value(&value)
      .ok_or_else(|| serde::de::Error::custom(format!("invalid record id: {value}")))
  }
}

impl fmt::Display for RecordId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for RecordId {
  fn from(s: &str) -> Self {
    Self(s.to_string())
  }
}

impl From<String> for RecordId {
  fn from(s: String) -> Self {
    Self(s)
  }
}

impl From<u64> for RecordId {
  fn from(n: u64) -> Self {
    Self(n.to_string())
  }
}

/// A domain entity as plain structured data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
  pub fn new() -> Self {
    Self(Map::new())
  }

  /// Wrap a JSON value, which must be an object.
  pub fn from_value(value: Value) -> Option<Self> {
    match value {
      Value::Object(map) => Some(Self(map)),
      _ => None,
    }
  }

  pub fn id(&self) -> Option<RecordId> {
    self.0.get("id").and_then(RecordId::from_value)
  }

  pub fn get(&self, field: &str) -> Option<&Value> {
    self.0.get(field)
  }

  pub fn get_str(&self, field: &str) -> Option<&str> {
    self.0.get(field).and_then(Value::as_str)
  }

  pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
    self.0.insert(field.into(), value.into());
  }

  pub fn remove(&mut self, field: &str) -> Option<Value> {
    self.0.remove(field)
  }

  /// Builder-style [`Record::set`].
  pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
    self.set(field, value);
    self
  }

  pub fn with_id(self, id: &RecordId) -> Self {
    self.with("id", id.as_str())
  }

  pub fn fields(&self) -> &Map<String, Value> {
    &self.0
  }

  pub fn into_value(self) -> Value {
    Value::Object(self.0)
  }

  /// Copy of this record with every field of `patch` written over it.
  /// The id is never overwritten.
  pub fn overlay(&self, patch: &Record) -> Record {
    let mut fields = self.0.clone();
    for (key, value) in &patch.0 {
      if key != "id" {
        fields.insert(key.clone(), value.clone());
      }
    }
    Record(fields)
  }
}

impl From<Map<String, Value>> for Record {
  fn from(map: Map<String, Value>) -> Self {
    Self(map)
  }
}

/// Names of the collections the cache knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionName {
  Vans,
  Trips,
  Users,
  Companies,
  Branches,
  MissionRoles,
  UserGroups,
}

impl CollectionName {
  pub const ALL: [CollectionName; 7] = [
    CollectionName::Vans,
    CollectionName::Trips,
    CollectionName::Users,
    CollectionName::Companies,
    CollectionName::Branches,
    CollectionName::MissionRoles,
    CollectionName::UserGroups,
  ];

  /// Table name on the remote store.
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Vans => "vans",
      Self::Trips => "trips",
      Self::Users => "users",
      Self::Companies => "companies",
      Self::Branches => "branches",
      Self::MissionRoles => "mission_roles",
      Self::UserGroups => "user_groups",
    }
  }
}

impl fmt::Display for CollectionName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for CollectionName {
  type Err = UnknownCollection;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let normalized = s.trim().to_lowercase().replace('-', "_");
    Self::ALL
      .into_iter()
      .find(|name| name.as_str() == normalized)
      .ok_or_else(|| UnknownCollection(s.to_string()))
  }
}

/// A named, ordered set of records of one entity type.
///
/// Collections are published as `Arc<Collection>` and replaced wholesale on
/// every write, so a handle held by a reader never changes underneath it.
#[derive(Debug, Clone, PartialEq)]
pub struct Collection {
  name: CollectionName,
  records: Vec<Arc<Record>>,
  last_fetched_at: Option<DateTime<Utc>>,
  invalidated: bool,
}

impl Collection {
  pub fn empty(name: CollectionName) -> Self {
    Self {
      name,
      records: Vec::new(),
      last_fetched_at: None,
      invalidated: false,
    }
  }

  pub(crate) fn fetched(
    name: CollectionName,
    records: Vec<Arc<Record>>,
    fetched_at: DateTime<Utc>,
  ) -> Self {
    Self {
      name,
      records,
      last_fetched_at: Some(fetched_at),
      invalidated: false,
    }
  }

  pub fn name(&self) -> CollectionName {
    self.name
  }

  pub fn records(&self) -> &[Arc<Record>] {
    &self.records
  }

  /// Time of the last successful authoritative fetch.
  pub fn last_fetched_at(&self) -> Option<DateTime<Utc>> {
    self.last_fetched_at
  }

  pub fn is_invalidated(&self) -> bool {
    self.invalidated
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }

  pub fn get(&self, id: &RecordId) -> Option<&Arc<Record>> {
    self.records.iter().find(|r| r.id().as_ref() == Some(id))
  }

  pub fn position(&self, id: &RecordId) -> Option<usize> {
    self.records.iter().position(|r| r.id().as_ref() == Some(id))
  }

  pub fn ids(&self) -> impl Iterator<Item = RecordId> + '_ {
    self.records.iter().filter_map(|r| r.id())
  }

  /// Same collection metadata with a different record list.
  pub(crate) fn with_records(&self, records: Vec<Arc<Record>>) -> Self {
    Self {
      name: self.name,
      records,
      last_fetched_at: self.last_fetched_at,
      invalidated: self.invalidated,
    }
  }

  pub(crate) fn marked_invalidated(&self) -> Self {
    Self {
      invalidated: true,
      ..self.clone()
    }
  }

  pub(crate) fn touched(&self, fetched_at: DateTime<Utc>) -> Self {
    Self {
      last_fetched_at: Some(fetched_at),
      invalidated: false,
      ..self.clone()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_numeric_ids_normalize_to_strings() {
    let record = Record::from_value(json!({"id": 42, "name": "x"})).unwrap();
    assert_eq!(record.id(), Some(RecordId::from("42")));
  }

  #[test]
  fn test_missing_or_empty_id() {
    assert_eq!(Record::from_value(json!({"name": "x"})).unwrap().id(), None);
    assert_eq!(Record::from_value(json!({"id": ""})).unwrap().id(), None);
  }

  #[test]
  fn test_placeholder_ids_are_distinguishable() {
    assert!(RecordId::placeholder(3).is_placeholder());
    assert!(!RecordId::from("3").is_placeholder());
  }

  #[test]
  fn test_overlay_keeps_id() {
    let base = Record::new().with("id", "v1").with("status", "Active");
    let patch = Record::new().with("id", "other").with("status", "En Transit");
    let merged = base.overlay(&patch);
    assert_eq!(merged.id(), Some(RecordId::from("v1")));
    assert_eq!(merged.get_str("status"), Some("En Transit"));
  }

  #[test]
  fn test_collection_name_parsing() {
    assert_eq!("vans".parse::<CollectionName>().unwrap(), CollectionName::Vans);
    assert_eq!(
      "mission-roles".parse::<CollectionName>().unwrap(),
      CollectionName::MissionRoles
    );
    assert!("reports".parse::<CollectionName>().is_err());
  }

  #[test]
  fn test_record_id_deserializes_from_number_or_string() {
    let ids: Vec<RecordId> = serde_json::from_value(json!([7, "v1"])).unwrap();
    assert_eq!(ids, vec![RecordId::from("7"), RecordId::from("v1")]);
    assert!(serde_json::from_value::<RecordId>(json!(null)).is_err());
  }
}
