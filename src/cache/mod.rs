//! Collection cache with optimistic mutations.
//!
//! This module provides:
//! - An entity store of named collections with per-collection TTLs
//! - Deduplicated fetches (concurrent readers share one request)
//! - A selective diff that only replaces records whose fields changed
//! - Optimistic create/update/delete with reconcile and three-way rollback
//! - Cross-entity invalidation rules applied after confirmed writes
//! - Optional SQLite snapshots so a new process starts warm

mod clock;
mod diff;
mod invalidation;
mod manager;
mod optimistic;
mod record;
mod staleness;
mod storage;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use diff::{DiffOutcome, SelectiveDiff, TimestampComparison};
pub use invalidation::{EntityKind, InvalidationRules, MutationEvent, RuleTable, Transition};
pub use manager::{CacheManager, CacheManagerBuilder};
pub use optimistic::{
  EventSelector, MutationCoordinator, MutationId, MutationReceipt, MutationSpec, MutationState,
  PendingMutation, RecordProjection,
};
pub use record::{Collection, CollectionName, Record, RecordId, PLACEHOLDER_PREFIX};
pub use staleness::StalenessPolicy;
pub use storage::{CollectionKey, NoopStorage, SnapshotStorage, SqliteStorage, StoredCollection};
pub use store::CacheStats;
