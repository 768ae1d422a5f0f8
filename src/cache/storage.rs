//! Snapshot storage trait and SQLite implementation.
//!
//! Keeps the last authoritative copy of each collection so a new process can
//! start warm. Optimistic state is never written here.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use super::record::{CollectionName, Record};
use crate::error::CacheError;
use crate::remote::Filters;

/// Storage key for one collection under one set of scope filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionKey {
  pub name: CollectionName,
  pub filters: Filters,
}

impl CollectionKey {
  pub fn new(name: CollectionName, filters: Filters) -> Self {
    Self { name, filters }
  }

  /// Stable, fixed-length hash of name and filters.
  pub fn cache_hash(&self) -> String {
    let mut input = self.name.as_str().to_string();
    for (field, value) in self.filters.iter() {
      input.push_str(&format!("|{field}={value}"));
    }

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A collection as it was persisted.
#[derive(Debug, Clone)]
pub struct StoredCollection {
  /// Records in server order
  pub records: Vec<Record>,
  pub fetched_at: DateTime<Utc>,
}

/// Trait for snapshot storage backends.
pub trait SnapshotStorage: Send + Sync {
  /// Replace the stored copy of a collection.
  fn save(
    &self,
    key: &CollectionKey,
    records: &[Arc<Record>],
    fetched_at: DateTime<Utc>,
  ) -> Result<(), CacheError>;

  fn load(&self, key: &CollectionKey) -> Result<Option<StoredCollection>, CacheError>;

  fn remove(&self, key: &CollectionKey) -> Result<(), CacheError>;
}

/// Storage that keeps nothing. Used when persistence is disabled.
pub struct NoopStorage;

impl SnapshotStorage for NoopStorage {
  fn save(
    &self,
    _key: &CollectionKey,
    _records: &[Arc<Record>],
    _fetched_at: DateTime<Utc>,
  ) -> Result<(), CacheError> {
    Ok(()) // Discard
  }

  fn load(&self, _key: &CollectionKey) -> Result<Option<StoredCollection>, CacheError> {
    Ok(None) // Always miss
  }

  fn remove(&self, _key: &CollectionKey) -> Result<(), CacheError> {
    Ok(())
  }
}

/// SQLite-based snapshot storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the database at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self, CacheError> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| storage_err("Failed to create cache directory", e))?;
    }

    let conn = Connection::open(&path).map_err(|e| {
      CacheError::Storage(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;
    Self::from_connection(conn)
  }

  /// Private in-memory database.
  pub fn open_in_memory() -> Result<Self, CacheError> {
    let conn = Connection::open_in_memory()
      .map_err(|e| storage_err("Failed to open in-memory cache", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self, CacheError> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf, CacheError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| CacheError::Storage("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("fleetcache").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<(), CacheError> {
    self
      .conn()?
      .execute_batch(SNAPSHOT_SCHEMA)
      .map_err(|e| storage_err("Failed to run cache migrations", e))
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>, CacheError> {
    self.conn.lock().map_err(|_| CacheError::LockPoisoned)
  }
}

/// Schema for snapshot tables.
const SNAPSHOT_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS collection_cache (
    query_hash TEXT PRIMARY KEY,
    collection TEXT NOT NULL,
    fetched_at TEXT NOT NULL,
    record_count INTEGER NOT NULL
);

-- Records of a cached collection (preserves order)
CREATE TABLE IF NOT EXISTS collection_records (
    query_hash TEXT NOT NULL,
    position INTEGER NOT NULL,
    record_id TEXT NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (query_hash, position),
    FOREIGN KEY (query_hash) REFERENCES collection_cache(query_hash) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_collection_records_hash ON collection_records(query_hash);
"#;

impl SnapshotStorage for SqliteStorage {
  fn save(
    &self,
    key: &CollectionKey,
    records: &[Arc<Record>],
    fetched_at: DateTime<Utc>,
  ) -> Result<(), CacheError> {
    let mut conn = self.conn()?;
    let hash = key.cache_hash();

    let tx = conn
      .transaction()
      .map_err(|e| storage_err("Failed to begin transaction", e))?;

    tx.execute(
      "DELETE FROM collection_records WHERE query_hash = ?",
      params![hash],
    )
    .map_err(|e| storage_err("Failed to delete old records", e))?;

    tx.execute(
      "INSERT OR REPLACE INTO collection_cache (query_hash, collection, fetched_at, record_count)
       VALUES (?, ?, ?, ?)",
      params![hash, key.name.as_str(), fetched_at.to_rfc3339(), records.len()],
    )
    .map_err(|e| storage_err("Failed to update collection cache", e))?;

    for (position, record) in records.iter().enumerate() {
      let record_id = record.id().map(|id| id.to_string()).unwrap_or_default();
      let data = serde_json::to_vec(record.as_ref())
        .map_err(|e| storage_err("Failed to serialize record", e))?;

      tx.execute(
        "INSERT INTO collection_records (query_hash, position, record_id, data)
         VALUES (?, ?, ?, ?)",
        params![hash, position, record_id, data],
      )
      .map_err(|e| storage_err("Failed to store record", e))?;
    }

    tx.commit()
      .map_err(|e| storage_err("Failed to commit transaction", e))
  }

  fn load(&self, key: &CollectionKey) -> Result<Option<StoredCollection>, CacheError> {
    let conn = self.conn()?;
    let hash = key.cache_hash();

    let fetched_at: Option<String> = conn
      .query_row(
        "SELECT fetched_at FROM collection_cache WHERE query_hash = ?",
        params![hash],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| storage_err("Failed to read collection cache", e))?;

    let Some(fetched_at) = fetched_at else {
      return Ok(None);
    };
    let fetched_at = DateTime::parse_from_rfc3339(&fetched_at)
      .map_err(|e| storage_err("Failed to parse fetched_at", e))?
      .with_timezone(&Utc);

    let mut stmt = conn
      .prepare(
        "SELECT data FROM collection_records
         WHERE query_hash = ?
         ORDER BY position",
      )
      .map_err(|e| storage_err("Failed to prepare record query", e))?;

    let records: Vec<Record> = stmt
      .query_map(params![hash], |row| row.get::<_, Vec<u8>>(0))
      .map_err(|e| storage_err("Failed to query records", e))?
      .filter_map(|r| r.ok())
      .filter_map(|data| match serde_json::from_slice(&data) {
        Ok(record) => Some(record),
        Err(e) => {
          tracing::warn!(error = %e, "skipping unreadable cached record");
          None
        }
      })
      .collect();

    Ok(Some(StoredCollection {
      records,
      fetched_at,
    }))
  }

  fn remove(&self, key: &CollectionKey) -> Result<(), CacheError> {
    self
      .conn()?
      .execute(
        "DELETE FROM collection_cache WHERE query_hash = ?",
        params![key.cache_hash()],
      )
      .map_err(|e| storage_err("Failed to remove collection", e))?;
    Ok(())
  }
}

fn storage_err(context: &str, e: impl std::fmt::Display) -> CacheError {
  CacheError::Storage(format!("{context}: {e}"))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn records() -> Vec<Arc<Record>> {
    vec![
      Arc::new(Record::from_value(json!({"id": "v2", "status": "Active"})).unwrap()),
      Arc::new(Record::from_value(json!({"id": 7, "status": "En Transit"})).unwrap()),
    ]
  }

  #[test]
  fn test_round_trip_keeps_order_and_timestamp() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let key = CollectionKey::new(CollectionName::Vans, Filters::new());
    let fetched_at = Utc::now();

    storage.save(&key, &records(), fetched_at).unwrap();
    let stored = storage.load(&key).unwrap().unwrap();

    assert_eq!(stored.records.len(), 2);
    assert_eq!(stored.records[0].get_str("id"), Some("v2"));
    assert_eq!(stored.records[1].get("id"), Some(&json!(7)));
    assert_eq!(stored.fetched_at.timestamp_micros(), fetched_at.timestamp_micros());
  }

  #[test]
  fn test_save_replaces_previous_copy() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let key = CollectionKey::new(CollectionName::Vans, Filters::new());

    storage.save(&key, &records(), Utc::now()).unwrap();
    storage.save(&key, &records()[..1], Utc::now()).unwrap();

    assert_eq!(storage.load(&key).unwrap().unwrap().records.len(), 1);
  }

  #[test]
  fn test_filters_partition_snapshots() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let all = CollectionKey::new(CollectionName::Vans, Filters::new());
    let scoped = CollectionKey::new(
      CollectionName::Vans,
      Filters::new().eq("company_id", "c1"),
    );
    assert_ne!(all.cache_hash(), scoped.cache_hash());

    storage.save(&scoped, &records(), Utc::now()).unwrap();
    assert!(storage.load(&all).unwrap().is_none());
    assert!(storage.load(&scoped).unwrap().is_some());
  }

  #[test]
  fn test_remove() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let key = CollectionKey::new(CollectionName::Trips, Filters::new());

    storage.save(&key, &records(), Utc::now()).unwrap();
    storage.remove(&key).unwrap();

    assert!(storage.load(&key).unwrap().is_none());
  }

  #[test]
  fn test_noop_storage_always_misses() {
    let key = CollectionKey::new(CollectionName::Trips, Filters::new());
    NoopStorage.save(&key, &records(), Utc::now()).unwrap();
    assert!(NoopStorage.load(&key).unwrap().is_none());
  }
}
