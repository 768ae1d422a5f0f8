//! In-memory entity store.
//!
//! Owns every cached collection, the map of in-flight fetches used to
//! coalesce concurrent readers, and the overlays of optimistic mutations that
//! are still waiting on the server. Only the manager's fetch path and the
//! mutation coordinator write to it.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::sync::Arc;

use super::optimistic::{MutationId, Overlay};
use super::record::{Collection, CollectionName, Record};
use super::staleness::StalenessPolicy;
use crate::error::CacheError;

/// A fetch that several callers can await; all of them observe the same result.
pub(crate) type SharedFetch = Shared<BoxFuture<'static, Result<Arc<Collection>, CacheError>>>;

struct InFlight {
  generation: u64,
  fetch: SharedFetch,
}

/// Diagnostic counters. Never drive behaviour off these.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  /// Collections that may be served without a fetch
  pub valid: usize,
  /// Collections present but past their TTL or invalidated
  pub expired: usize,
  /// Fetches currently in flight
  pub in_flight: usize,
  /// Optimistic mutations waiting on the server
  pub optimistic: usize,
}

#[derive(Default)]
pub(crate) struct EntityStore {
  collections: HashMap<CollectionName, Arc<Collection>>,
  in_flight: HashMap<CollectionName, InFlight>,
  /// Generation of the newest fetch committed per collection
  committed: HashMap<CollectionName, u64>,
  next_generation: u64,
  next_mutation: u64,
  overlays: HashMap<CollectionName, Vec<Overlay>>,
  /// Newest server copy of each collection, without overlays
  authoritative: HashMap<CollectionName, Arc<Collection>>,
}

impl EntityStore {
  /// Current state of a collection, empty if it was never loaded.
  pub fn get(&self, name: CollectionName) -> Arc<Collection> {
    self
      .collections
      .get(&name)
      .cloned()
      .unwrap_or_else(|| Arc::new(Collection::empty(name)))
  }

  pub fn is_fresh(&self, name: CollectionName, policy: &StalenessPolicy, now: DateTime<Utc>) -> bool {
    self
      .collections
      .get(&name)
      .is_some_and(|c| policy.is_fresh(c, now))
  }

  /// True while a fetch for `name` is in flight.
  pub fn should_dedupe_fetch(&self, name: CollectionName) -> bool {
    self.in_flight.contains_key(&name)
  }

  pub fn in_flight(&self, name: CollectionName) -> Option<SharedFetch> {
    self.in_flight.get(&name).map(|f| f.fetch.clone())
  }

  pub fn next_generation(&mut self) -> u64 {
    self.next_generation += 1;
    self.next_generation
  }

  /// Ids are unique per store, so placeholders never collide across coordinators.
  pub fn next_mutation_id(&mut self) -> MutationId {
    self.next_mutation += 1;
    MutationId::new(self.next_mutation)
  }

  pub fn track_fetch(&mut self, name: CollectionName, generation: u64, fetch: SharedFetch) {
    self.in_flight.insert(name, InFlight { generation, fetch });
  }

  /// Clear the in-flight marker, unless a newer fetch has taken its place.
  pub fn finish_fetch(&mut self, name: CollectionName, generation: u64) {
    if self
      .in_flight
      .get(&name)
      .is_some_and(|f| f.generation == generation)
    {
      self.in_flight.remove(&name);
    }
  }

  /// True when a fetch started after `generation` has already committed.
  pub fn is_superseded(&self, name: CollectionName, generation: u64) -> bool {
    self
      .committed
      .get(&name)
      .is_some_and(|&committed| committed > generation)
  }

  /// Replace the records of a collection with authoritative data.
  pub fn commit(
    &mut self,
    name: CollectionName,
    generation: u64,
    records: Vec<Arc<Record>>,
    fetched_at: DateTime<Utc>,
  ) -> Arc<Collection> {
    self.committed.insert(name, generation);
    let collection = Arc::new(Collection::fetched(name, records, fetched_at));
    self.collections.insert(name, Arc::clone(&collection));
    collection
  }

  /// Remember what the server last sent, so a rollback can fall back to it.
  pub fn set_authoritative(
    &mut self,
    name: CollectionName,
    records: Vec<Arc<Record>>,
    fetched_at: DateTime<Utc>,
  ) {
    let collection = Collection::fetched(name, records, fetched_at);
    self.authoritative.insert(name, Arc::new(collection));
  }

  pub fn authoritative(&self, name: CollectionName) -> Option<Arc<Collection>> {
    self.authoritative.get(&name).cloned()
  }

  /// Record a fetch that produced no changes: only the timestamp moves.
  pub fn touch(
    &mut self,
    name: CollectionName,
    generation: u64,
    fetched_at: DateTime<Utc>,
  ) -> Arc<Collection> {
    self.committed.insert(name, generation);
    let collection = Arc::new(self.get(name).touched(fetched_at));
    self.collections.insert(name, Arc::clone(&collection));
    collection
  }

  /// Local write that keeps the fetch metadata (optimistic apply, reconcile, rollback).
  pub fn replace_records(&mut self, name: CollectionName, records: Vec<Arc<Record>>) -> Arc<Collection> {
    let collection = Arc::new(self.get(name).with_records(records));
    self.collections.insert(name, Arc::clone(&collection));
    collection
  }

  pub fn invalidate(&mut self, name: CollectionName) {
    if let Some(current) = self.collections.get(&name) {
      let invalidated = Arc::new(current.marked_invalidated());
      self.collections.insert(name, invalidated);
    }
  }

  /// Forget the cached records. Pending overlays survive and are re-applied on the next fetch.
  pub fn clear(&mut self, name: CollectionName) {
    self.collections.remove(&name);
  }

  /// Seed a collection from persisted state.
  pub fn hydrate(&mut self, collection: Collection) {
    let collection = Arc::new(collection);
    self
      .authoritative
      .insert(collection.name(), Arc::clone(&collection));
    self.collections.insert(collection.name(), collection);
  }

  pub fn overlays(&self, name: CollectionName) -> &[Overlay] {
    self.overlays.get(&name).map(Vec::as_slice).unwrap_or(&[])
  }

  pub fn push_overlay(&mut self, name: CollectionName, overlay: Overlay) {
    self.overlays.entry(name).or_default().push(overlay);
  }

  pub fn remove_overlay(&mut self, name: CollectionName, mutation: MutationId) {
    if let Some(overlays) = self.overlays.get_mut(&name) {
      overlays.retain(|o| o.mutation != mutation);
      if overlays.is_empty() {
        self.overlays.remove(&name);
      }
    }
  }

  pub fn stats(&self, policy: &StalenessPolicy, now: DateTime<Utc>) -> CacheStats {
    let valid = self
      .collections
      .values()
      .filter(|c| policy.is_fresh(c, now))
      .count();
    CacheStats {
      valid,
      expired: self.collections.len() - valid,
      in_flight: self.in_flight.len(),
      optimistic: self.overlays.values().map(Vec::len).sum(),
    }
  }
}
