//! Typed views of fleet records.
//!
//! The cache stores plain records; these types are decoded on read and encoded
//! into mutation payloads.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::cache::{Record, RecordId};

/// Decode a record into a typed view.
pub fn decode<T: DeserializeOwned>(record: &Record) -> serde_json::Result<T> {
  serde_json::from_value(record.clone().into_value())
}

/// Encode a typed payload into a record. Fields set to `None` are left out.
pub fn encode(value: &impl Serialize) -> Record {
  match serde_json::to_value(value) {
    Ok(Value::Object(map)) => map
      .into_iter()
      .filter(|(_, v)| !v.is_null())
      .collect::<serde_json::Map<_, _>>()
      .into(),
    _ => Record::new(),
  }
}

// ============================================================================
// Vans
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum VanStatus {
  #[default]
  Active,
  EnTransit,
  Maintenance,
  Inactive,
  Other(String),
}

impl VanStatus {
  pub fn as_str(&self) -> &str {
    match self {
      Self::Active => "Active",
      Self::EnTransit => "En Transit",
      Self::Maintenance => "Maintenance",
      Self::Inactive => "Inactive",
      Self::Other(s) => s,
    }
  }
}

impl From<String> for VanStatus {
  fn from(s: String) -> Self {
    match s.as_str() {
      "Active" => Self::Active,
      "En Transit" => Self::EnTransit,
      "Maintenance" => Self::Maintenance,
      "Inactive" => Self::Inactive,
      _ => Self::Other(s),
    }
  }
}

impl From<VanStatus> for String {
  fn from(status: VanStatus) -> Self {
    status.as_str().to_string()
  }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Van {
  pub id: RecordId,
  pub plate_number: Option<String>,
  pub model: Option<String>,
  #[serde(default)]
  pub status: VanStatus,
  pub company_id: Option<RecordId>,
  pub current_km: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NewVan {
  pub plate_number: String,
  pub model: Option<String>,
  pub company_id: Option<RecordId>,
  pub status: Option<VanStatus>,
}

// ============================================================================
// Trips
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum TripStatus {
  #[default]
  Active,
  Completed,
  Cancelled,
  Other(String),
}

impl TripStatus {
  pub fn as_str(&self) -> &str {
    match self {
      Self::Active => "active",
      Self::Completed => "completed",
      Self::Cancelled => "cancelled",
      Self::Other(s) => s,
    }
  }
}

impl From<String> for TripStatus {
  fn from(s: String) -> Self {
    match s.as_str() {
      "active" => Self::Active,
      "completed" => Self::Completed,
      "cancelled" => Self::Cancelled,
      _ => Self::Other(s),
    }
  }
}

impl From<TripStatus> for String {
  fn from(status: TripStatus) -> Self {
    status.as_str().to_string()
  }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Trip {
  pub id: RecordId,
  pub van_id: Option<RecordId>,
  pub user_id: Option<RecordId>,
  pub company_id: Option<RecordId>,
  #[serde(default)]
  pub status: TripStatus,
  pub destination: Option<String>,
  pub start_km: Option<f64>,
  pub end_km: Option<f64>,
  pub started_at: Option<String>,
  pub ended_at: Option<String>,
}

impl Trip {
  pub fn is_active(&self) -> bool {
    self.status == TripStatus::Active
  }

  /// Distance driven, once the trip has both odometer readings.
  pub fn distance_km(&self) -> Option<f64> {
    Some(self.end_km? - self.start_km?)
  }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NewTrip {
  pub van_id: RecordId,
  pub user_id: Option<RecordId>,
  pub company_id: Option<RecordId>,
  pub destination: Option<String>,
  pub start_km: Option<f64>,
}

/// Flatten an embedded `van` (object or bare id) into `van_id`.
pub fn normalize_trip(mut trip: Record) -> Record {
  let van_id = match trip.get("van") {
    Some(Value::Object(van)) => van.get("id").and_then(RecordId::from_value),
    Some(other) => RecordId::from_value(other),
    None => None,
  };
  if let Some(van_id) = van_id {
    trip.remove("van");
    if trip.get("van_id").is_none() {
      trip.set("van_id", van_id.as_str());
    }
  }
  trip
}

// ============================================================================
// People and organisations
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct User {
  pub id: RecordId,
  #[serde(alias = "full_name")]
  pub name: Option<String>,
  pub email: Option<String>,
  pub company_id: Option<RecordId>,
  pub user_group_id: Option<RecordId>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Company {
  pub id: RecordId,
  #[serde(default)]
  pub name: String,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_decode_van_with_unknown_status() {
    let record = Record::from_value(json!({"id": 4, "status": "Scrapped", "plate_number": "AB-12"})).unwrap();
    let van: Van = decode(&record).unwrap();
    assert_eq!(van.id, RecordId::from("4"));
    assert_eq!(van.status, VanStatus::Other("Scrapped".into()));
    assert_eq!(van.company_id, None);
  }

  #[test]
  fn test_encode_skips_missing_fields() {
    let payload = encode(&NewTrip {
      van_id: "v1".into(),
      start_km: Some(120.0),
      ..Default::default()
    });
    assert_eq!(payload.get_str("van_id"), Some("v1"));
    assert_eq!(payload.get("start_km"), Some(&json!(120.0)));
    assert!(payload.get("destination").is_none());
  }

  #[test]
  fn test_normalize_embedded_van() {
    let trip = Record::from_value(json!({"id": 1, "van": {"id": "v1", "status": "En Transit"}})).unwrap();
    let trip = normalize_trip(trip);
    assert_eq!(trip.get_str("van_id"), Some("v1"));
    assert!(trip.get("van").is_none());

    let bare = normalize_trip(Record::from_value(json!({"id": 2, "van": 7})).unwrap());
    assert_eq!(bare.get_str("van_id"), Some("7"));
  }

  #[test]
  fn test_trip_distance() {
    let record = Record::from_value(json!({"id": 1, "status": "completed", "start_km": 100, "end_km": 500})).unwrap();
    let trip: Trip = decode(&record).unwrap();
    assert!(!trip.is_active());
    assert_eq!(trip.distance_km(), Some(400.0));
  }
}
