//! Boundary to the remote relational store.
//!
//! The cache only talks to the store through [`RemoteStore`]: one call to read
//! a whole collection, one to submit a write and get the authoritative record
//! back. [`RestStore`] speaks the PostgREST dialect over HTTP;
//! [`InMemoryRemote`] keeps tables in memory and derives van status from trip
//! state the way the server does.

mod memory;
mod rest;

pub use memory::InMemoryRemote;
pub use rest::RestStore;

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

use crate::cache::{CollectionName, Record, RecordId};

/// A boxed, sendable future resolving to a remote result.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, RemoteError>> + Send>>;

/// Failures reported by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
  #[error("network error: {0}")]
  Network(String),

  #[error("request rejected ({status}): {message}")]
  Rejected { status: u16, message: String },

  #[error("{collection} record {id} not found")]
  NotFound {
    collection: CollectionName,
    id: RecordId,
  },

  #[error("malformed response: {0}")]
  Decode(String),
}

/// Equality filters applied to a collection fetch (`field = value`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Filters(Vec<(String, String)>);

impl Filters {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn eq(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
    self.0.push((field.into(), value.into()));
    self
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(f, v)| (f.as_str(), v.as_str()))
  }

  /// True when `record` satisfies every filter.
  pub fn matches(&self, record: &Record) -> bool {
    self.iter().all(|(field, value)| {
      record
        .get(field)
        .and_then(RecordId::from_value)
        .is_some_and(|actual| actual.as_str() == value)
    })
  }
}

/// A write submitted to the remote store.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOp {
  Create { payload: Record },
  Update { id: RecordId, patch: Record },
  Delete { id: RecordId },
}

impl MutationOp {
  pub fn verb(&self) -> &'static str {
    match self {
      Self::Create { .. } => "create",
      Self::Update { .. } => "update",
      Self::Delete { .. } => "delete",
    }
  }

  /// The record an update or delete targets.
  pub fn target(&self) -> Option<&RecordId> {
    match self {
      Self::Create { .. } => None,
      Self::Update { id, .. } | Self::Delete { id } => Some(id),
    }
  }
}

/// Client for the remote store. Implementations return authoritative,
/// fully-populated records.
pub trait RemoteStore: Send + Sync {
  fn fetch_collection(&self, name: CollectionName, filters: &Filters) -> BoxFuture<Vec<Record>>;

  fn submit_mutation(&self, name: CollectionName, op: MutationOp) -> BoxFuture<Record>;
}
