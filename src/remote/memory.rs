//! In-memory remote store.
//!
//! Keeps one table per collection and applies writes the way the server does,
//! including the van status the server derives from trip state. Tests can
//! hold, reject or fail individual calls.

use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;

use super::{BoxFuture, Filters, MutationOp, RemoteError, RemoteStore};
use crate::cache::{CollectionName, Record, RecordId};

const FIRST_SERVER_ID: u64 = 1000;

#[derive(Default)]
struct Tables {
  rows: HashMap<CollectionName, Vec<Record>>,
  fetch_counts: HashMap<CollectionName, usize>,
  failing: HashSet<CollectionName>,
  /// Closed gates let waiting mutations through
  gates: HashMap<String, Arc<Semaphore>>,
  rejecting: HashSet<String>,
  next_id: u64,
}

/// Remote store backed by process memory.
///
/// Cheap to clone; clones share the same tables.
#[derive(Clone, Default)]
pub struct InMemoryRemote {
  tables: Arc<Mutex<Tables>>,
}

impl InMemoryRemote {
  pub fn new() -> Self {
    Self::default()
  }

  /// Replace a table's rows. Values that are not objects are ignored.
  pub fn seed(&self, name: CollectionName, rows: Vec<Value>) {
    let rows = rows.into_iter().filter_map(Record::from_value).collect();
    self.lock().rows.insert(name, rows);
  }

  pub fn rows(&self, name: CollectionName) -> Vec<Record> {
    self.lock().rows.get(&name).cloned().unwrap_or_default()
  }

  /// Change a row behind the cache's back.
  pub fn patch_row(&self, name: CollectionName, id: &str, patch: Value) {
    let Some(patch) = Record::from_value(patch) else {
      return;
    };
    let mut tables = self.lock();
    if let Some(row) = find_mut(&mut tables, name, &RecordId::from(id)) {
      *row = row.overlay(&patch);
    }
  }

  pub fn remove_row(&self, name: CollectionName, id: &str) {
    let id = RecordId::from(id);
    if let Some(rows) = self.lock().rows.get_mut(&name) {
      rows.retain(|r| r.id().as_ref() != Some(&id));
    }
  }

  /// Number of `fetch_collection` calls made for `name`, failed ones included.
  pub fn fetch_count(&self, name: CollectionName) -> usize {
    self.lock().fetch_counts.get(&name).copied().unwrap_or(0)
  }

  pub fn fail_fetches(&self, name: CollectionName) {
    self.lock().failing.insert(name);
  }

  pub fn restore_fetches(&self, name: CollectionName) {
    self.lock().failing.remove(&name);
  }

  /// Hold mutations submitted from now on until released.
  ///
  /// `key` is the target record id for updates and deletes, the table name for
  /// creates.
  pub fn hold_mutations_for(&self, key: &str) {
    self
      .lock()
      .gates
      .insert(key.to_string(), Arc::new(Semaphore::new(0)));
  }

  pub fn release_mutations_for(&self, key: &str) {
    if let Some(gate) = self.lock().gates.remove(key) {
      gate.close();
    }
  }

  /// Fail mutations submitted from now on with a network error.
  pub fn reject_mutations_for(&self, key: &str) {
    self.lock().rejecting.insert(key.to_string());
  }

  pub fn accept_mutations_for(&self, key: &str) {
    self.lock().rejecting.remove(key);
  }

  fn lock(&self) -> MutexGuard<'_, Tables> {
    self.tables.lock().unwrap_or_else(|e| e.into_inner())
  }
}

impl RemoteStore for InMemoryRemote {
  fn fetch_collection(&self, name: CollectionName, filters: &Filters) -> BoxFuture<Vec<Record>> {
    *self.lock().fetch_counts.entry(name).or_insert(0) += 1;
    let tables = Arc::clone(&self.tables);
    let filters = filters.clone();

    Box::pin(async move {
      tokio::task::yield_now().await;
      let tables = tables.lock().unwrap_or_else(|e| e.into_inner());
      if tables.failing.contains(&name) {
        return Err(RemoteError::Network(format!("{name}: connection refused")));
      }
      Ok(
        tables
          .rows
          .get(&name)
          .map(|rows| rows.iter().filter(|r| filters.matches(r)).cloned().collect())
          .unwrap_or_default(),
      )
    })
  }

  fn submit_mutation(&self, name: CollectionName, op: MutationOp) -> BoxFuture<Record> {
    // Gate and rejection are decided when the call is made
    let key = op
      .target()
      .map(|id| id.to_string())
      .unwrap_or_else(|| name.as_str().to_string());
    let (gate, reject) = {
      let tables = self.lock();
      (tables.gates.get(&key).cloned(), tables.rejecting.contains(&key))
    };
    let tables = Arc::clone(&self.tables);

    Box::pin(async move {
      if let Some(gate) = gate {
        // Errors once the gate is closed
        let _ = gate.acquire().await;
      }
      tokio::task::yield_now().await;
      if reject {
        return Err(RemoteError::Network(format!(
          "{} {name}: connection reset",
          op.verb()
        )));
      }
      let mut tables = tables.lock().unwrap_or_else(|e| e.into_inner());
      apply(&mut tables, name, op)
    })
  }
}

fn apply(tables: &mut Tables, name: CollectionName, op: MutationOp) -> Result<Record, RemoteError> {
  match op {
    MutationOp::Create { payload } => {
      let mut record = payload;
      if record.id().is_none() {
        tables.next_id += 1;
        record.set("id", FIRST_SERVER_ID + tables.next_id);
      }
      if record.get("created_at").is_none() {
        record.set("created_at", Utc::now().to_rfc3339());
      }
      if name == CollectionName::Trips {
        if record.get("status").is_none() {
          record.set("status", "active");
        }
        if record.get_str("status") == Some("active") {
          set_van_status(tables, &record, "En Transit");
        }
      }
      tables.rows.entry(name).or_default().push(record.clone());
      Ok(record)
    }
    MutationOp::Update { id, patch } => {
      let row = find_mut(tables, name, &id).ok_or_else(|| RemoteError::NotFound {
        collection: name,
        id: id.clone(),
      })?;
      let was_active = row.get_str("status") == Some("active");
      *row = row.overlay(&patch);
      let record = row.clone();
      if name == CollectionName::Trips && was_active && record.get_str("status") == Some("completed") {
        set_van_status(tables, &record, "Active");
      }
      Ok(record)
    }
    MutationOp::Delete { id } => {
      let rows = tables.rows.entry(name).or_default();
      let index = rows
        .iter()
        .position(|r| r.id().as_ref() == Some(&id))
        .ok_or_else(|| RemoteError::NotFound {
          collection: name,
          id: id.clone(),
        })?;
      let record = rows.remove(index);
      if name == CollectionName::Trips && record.get_str("status") == Some("active") {
        set_van_status(tables, &record, "Active");
      }
      Ok(record)
    }
  }
}

fn find_mut<'a>(tables: &'a mut Tables, name: CollectionName, id: &RecordId) -> Option<&'a mut Record> {
  tables
    .rows
    .get_mut(&name)?
    .iter_mut()
    .find(|r| r.id().as_ref() == Some(id))
}

/// The van a trip runs on: `van_id`, or a bare `van` id.
fn trip_van(trip: &Record) -> Option<RecordId> {
  trip
    .get("van_id")
    .or_else(|| trip.get("van"))
    .and_then(RecordId::from_value)
}

fn set_van_status(tables: &mut Tables, trip: &Record, status: &str) {
  let Some(van_id) = trip_van(trip) else {
    return;
  };
  if let Some(van) = find_mut(tables, CollectionName::Vans, &van_id) {
    van.set("status", status);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn remote() -> InMemoryRemote {
    let remote = InMemoryRemote::new();
    remote.seed(CollectionName::Vans, vec![json!({"id": "v1", "status": "Active"})]);
    remote
  }

  fn van_status(remote: &InMemoryRemote) -> Option<String> {
    remote.rows(CollectionName::Vans)[0]
      .get_str("status")
      .map(str::to_string)
  }

  #[tokio::test]
  async fn test_trip_lifecycle_drives_van_status() {
    let remote = remote();

    let trip = remote
      .submit_mutation(
        CollectionName::Trips,
        MutationOp::Create {
          payload: Record::new().with("van_id", "v1"),
        },
      )
      .await
      .unwrap();
    assert_eq!(trip.get_str("status"), Some("active"));
    assert!(trip.get("created_at").is_some());
    assert_eq!(van_status(&remote).as_deref(), Some("En Transit"));

    let id = trip.id().unwrap();
    remote
      .submit_mutation(
        CollectionName::Trips,
        MutationOp::Update {
          id,
          patch: Record::new().with("status", "completed").with("end_km", 500),
        },
      )
      .await
      .unwrap();
    assert_eq!(van_status(&remote).as_deref(), Some("Active"));
  }

  #[tokio::test]
  async fn test_deleting_active_trip_reverts_van() {
    let remote = remote();
    remote.patch_row(CollectionName::Vans, "v1", json!({"status": "En Transit"}));
    remote.seed(
      CollectionName::Trips,
      vec![json!({"id": 5, "van": "v1", "status": "active"})],
    );

    remote
      .submit_mutation(CollectionName::Trips, MutationOp::Delete { id: 5.into() })
      .await
      .unwrap();

    assert!(remote.rows(CollectionName::Trips).is_empty());
    assert_eq!(van_status(&remote).as_deref(), Some("Active"));
  }

  #[tokio::test]
  async fn test_missing_record_is_not_found() {
    let err = remote()
      .submit_mutation(CollectionName::Vans, MutationOp::Delete { id: "nope".into() })
      .await
      .unwrap_err();
    assert!(matches!(err, RemoteError::NotFound { .. }));
  }

  #[tokio::test]
  async fn test_filters_and_fetch_failures() {
    let remote = remote();
    remote.seed(
      CollectionName::Users,
      vec![
        json!({"id": 1, "company_id": 7}),
        json!({"id": 2, "company_id": 8}),
      ],
    );

    let scoped = remote
      .fetch_collection(CollectionName::Users, &Filters::new().eq("company_id", "7"))
      .await
      .unwrap();
    assert_eq!(scoped.len(), 1);

    remote.fail_fetches(CollectionName::Users);
    assert!(remote
      .fetch_collection(CollectionName::Users, &Filters::new())
      .await
      .is_err());
    assert_eq!(remote.fetch_count(CollectionName::Users), 2);
  }

  #[tokio::test]
  async fn test_rejection_is_decided_at_submit_time() {
    let remote = remote();
    remote.reject_mutations_for("v1");
    let rejected = remote.submit_mutation(
      CollectionName::Vans,
      MutationOp::Update {
        id: "v1".into(),
        patch: Record::new().with("status", "Maintenance"),
      },
    );
    remote.accept_mutations_for("v1");

    assert!(matches!(rejected.await, Err(RemoteError::Network(_))));
    assert_eq!(van_status(&remote).as_deref(), Some("Active"));
  }
}
