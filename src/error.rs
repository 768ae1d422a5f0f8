//! Error types shared by the cache, the coordinator and the fleet client.

use thiserror::Error;

use crate::cache::{CollectionName, RecordId};
use crate::permissions::Permission;
use crate::remote::RemoteError;

/// Errors surfaced to callers of the cache and of the mutation coordinator.
///
/// Cloneable so a single fetch result can be shared by every caller that
/// joined the same in-flight request.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
  /// The remote store rejected a read. The previous collection is kept.
  #[error("failed to fetch {collection}: {source}")]
  Fetch {
    collection: CollectionName,
    #[source]
    source: RemoteError,
  },

  /// The remote store rejected a write. The optimistic change was rolled back.
  #[error("{op} on {collection} was rejected: {source}")]
  MutationRejected {
    collection: CollectionName,
    op: &'static str,
    #[source]
    source: RemoteError,
  },

  /// The permission oracle refused the mutation before anything was applied.
  #[error("permission denied: {0}")]
  PermissionDenied(Permission),

  #[error("cache state lock poisoned")]
  LockPoisoned,

  #[error("cache storage error: {0}")]
  Storage(String),

  /// The task driving a mutation panicked or was aborted by the runtime.
  #[error("mutation task failed: {0}")]
  TaskFailed(String),
}

/// A single record the diff could not process. Recovered locally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiffComputationError {
  #[error("record at position {position} has no id")]
  MissingId { position: usize },

  #[error("duplicate id {id} at position {position}")]
  DuplicateId { id: RecordId, position: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown collection: {0}")]
pub struct UnknownCollection(pub String);
