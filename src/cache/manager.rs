//! Cache manager that ties the store, staleness policy, diff and remote together.

use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture, FutureExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

use super::clock::{Clock, SystemClock};
use super::diff::SelectiveDiff;
use super::optimistic;
use super::record::{Collection, CollectionName, Record};
use super::staleness::StalenessPolicy;
use super::storage::{CollectionKey, NoopStorage, SnapshotStorage};
use super::store::{CacheStats, EntityStore, SharedFetch};
use crate::error::CacheError;
use crate::remote::{Filters, RemoteError, RemoteStore};

/// Builder for [`CacheManager`].
pub struct CacheManagerBuilder {
  remote: Arc<dyn RemoteStore>,
  policy: StalenessPolicy,
  diff: SelectiveDiff,
  clock: Arc<dyn Clock>,
  storage: Arc<dyn SnapshotStorage>,
  filters: HashMap<CollectionName, Filters>,
}

impl CacheManagerBuilder {
  pub fn policy(mut self, policy: StalenessPolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn diff(mut self, diff: SelectiveDiff) -> Self {
    self.diff = diff;
    self
  }

  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn storage(mut self, storage: Arc<dyn SnapshotStorage>) -> Self {
    self.storage = storage;
    self
  }

  /// Scope every fetch of `name` with `filters`.
  pub fn filters(mut self, name: CollectionName, filters: Filters) -> Self {
    self.filters.insert(name, filters);
    self
  }

  /// Build the manager, seeding it from snapshot storage.
  pub fn build(self) -> CacheManager {
    let mut store = EntityStore::default();

    for name in CollectionName::ALL {
      let key = CollectionKey::new(name, self.filters.get(&name).cloned().unwrap_or_default());
      match self.storage.load(&key) {
        Ok(Some(stored)) => {
          let records: Vec<Arc<Record>> = stored
            .records
            .into_iter()
            .filter(|r| r.id().is_some_and(|id| !id.is_placeholder()))
            .map(Arc::new)
            .collect();
          debug!(collection = %name, records = records.len(), "hydrated from snapshot");
          store.hydrate(Collection::fetched(name, records, stored.fetched_at));
        }
        Ok(None) => {}
        Err(e) => warn!(collection = %name, error = %e, "failed to load snapshot"),
      }
    }

    CacheManager {
      inner: Arc::new(Inner {
        state: Mutex::new(store),
        remote: self.remote,
        policy: self.policy,
        diff: self.diff,
        clock: self.clock,
        storage: self.storage,
        filters: self.filters,
      }),
    }
  }
}

struct Inner {
  state: Mutex<EntityStore>,
  remote: Arc<dyn RemoteStore>,
  policy: StalenessPolicy,
  diff: SelectiveDiff,
  clock: Arc<dyn Clock>,
  storage: Arc<dyn SnapshotStorage>,
  filters: HashMap<CollectionName, Filters>,
}

enum Lookup {
  Fresh(Arc<Collection>),
  Fetching(SharedFetch),
}

/// Handle to the collection cache.
///
/// Cheap to clone; clones share the same store. Construct one per session and
/// pass it to whoever needs it.
#[derive(Clone)]
pub struct CacheManager {
  inner: Arc<Inner>,
}

impl CacheManager {
  pub fn builder(remote: Arc<dyn RemoteStore>) -> CacheManagerBuilder {
    CacheManagerBuilder {
      remote,
      policy: StalenessPolicy::default(),
      diff: SelectiveDiff::default(),
      clock: Arc::new(SystemClock),
      storage: Arc::new(NoopStorage),
      filters: HashMap::new(),
    }
  }

  /// Manager with default policy, system clock and no persistence.
  pub fn new(remote: Arc<dyn RemoteStore>) -> Self {
    Self::builder(remote).build()
  }

  /// Fetch a collection with cache-first strategy.
  ///
  /// 1. Fresh cache is returned immediately
  /// 2. A fetch already in flight is joined rather than repeated
  /// 3. Otherwise the collection is fetched, diffed against the cache and committed
  ///
  /// On fetch failure the previous collection stays in place and the error is returned.
  pub async fn get(&self, name: CollectionName) -> Result<Arc<Collection>, CacheError> {
    match self.lookup(name)? {
      Lookup::Fresh(collection) => Ok(collection),
      Lookup::Fetching(fetch) => fetch.await,
    }
  }

  /// Current in-memory state, without fetching.
  pub fn peek(&self, name: CollectionName) -> Result<Arc<Collection>, CacheError> {
    Ok(self.store()?.get(name))
  }

  pub fn is_fresh(&self, name: CollectionName) -> Result<bool, CacheError> {
    let now = self.inner.clock.now();
    Ok(self.store()?.is_fresh(name, &self.inner.policy, now))
  }

  /// True while a fetch for `name` is in flight.
  pub fn should_dedupe_fetch(&self, name: CollectionName) -> Result<bool, CacheError> {
    Ok(self.store()?.should_dedupe_fetch(name))
  }

  /// Mark collections stale without fetching. The next `get` refetches.
  pub fn invalidate(&self, names: &[CollectionName]) -> Result<(), CacheError> {
    let mut store = self.store()?;
    for &name in names {
      debug!(collection = %name, "invalidating");
      store.invalidate(name);
    }
    Ok(())
  }

  /// Refetch now, regardless of staleness, and diff into the cache.
  ///
  /// Never joins a fetch that started earlier, since that fetch may predate
  /// the change that prompted the refresh.
  pub async fn refresh(&self, names: &[CollectionName]) -> Result<Vec<Arc<Collection>>, CacheError> {
    let fetches: Vec<SharedFetch> = {
      let mut store = self.store()?;
      names
        .iter()
        .map(|&name| self.start_fetch(&mut store, name))
        .collect()
    };
    future::try_join_all(fetches).await
  }

  /// Drop cached state (memory and snapshot) and refetch unconditionally.
  pub async fn full_refresh(
    &self,
    names: &[CollectionName],
  ) -> Result<Vec<Arc<Collection>>, CacheError> {
    {
      let mut store = self.store()?;
      for &name in names {
        store.clear(name);
      }
    }
    for &name in names {
      self.inner.storage.remove(&self.key(name))?;
    }
    info!(collections = ?names, "cleared cached collections");
    self.refresh(names).await
  }

  pub fn stats(&self) -> Result<CacheStats, CacheError> {
    let now = self.inner.clock.now();
    Ok(self.store()?.stats(&self.inner.policy, now))
  }

  pub fn policy(&self) -> &StalenessPolicy {
    &self.inner.policy
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.inner.clock.now()
  }

  pub(crate) fn remote(&self) -> &Arc<dyn RemoteStore> {
    &self.inner.remote
  }

  /// Run `f` with exclusive access to the store. Never held across an await.
  pub(crate) fn with_store<R>(&self, f: impl FnOnce(&mut EntityStore) -> R) -> Result<R, CacheError> {
    let mut store = self.store()?;
    Ok(f(&mut store))
  }

  fn store(&self) -> Result<MutexGuard<'_, EntityStore>, CacheError> {
    self.inner.state.lock().map_err(|_| CacheError::LockPoisoned)
  }

  fn key(&self, name: CollectionName) -> CollectionKey {
    CollectionKey::new(name, self.inner.filters.get(&name).cloned().unwrap_or_default())
  }

  fn lookup(&self, name: CollectionName) -> Result<Lookup, CacheError> {
    let mut store = self.store()?;
    let now = self.inner.clock.now();

    if store.is_fresh(name, &self.inner.policy, now) {
      trace!(collection = %name, "serving cached collection");
      return Ok(Lookup::Fresh(store.get(name)));
    }

    if let Some(fetch) = store.in_flight(name) {
      debug!(collection = %name, "joining in-flight fetch");
      return Ok(Lookup::Fetching(fetch));
    }

    Ok(Lookup::Fetching(self.start_fetch(&mut store, name)))
  }

  fn start_fetch(&self, store: &mut EntityStore, name: CollectionName) -> SharedFetch {
    let generation = store.next_generation();
    let manager = self.clone();
    let fetch: BoxFuture<'static, Result<Arc<Collection>, CacheError>> =
      Box::pin(async move { manager.run_fetch(name, generation).await });
    let fetch = fetch.shared();
    store.track_fetch(name, generation, fetch.clone());
    fetch
  }

  async fn run_fetch(
    &self,
    name: CollectionName,
    generation: u64,
  ) -> Result<Arc<Collection>, CacheError> {
    let filters = self.inner.filters.get(&name).cloned().unwrap_or_default();
    debug!(collection = %name, generation, "fetching collection");
    let result = self.inner.remote.fetch_collection(name, &filters).await;
    let (collection, fetched) = self.commit_fetched(name, generation, result)?;
    if let Some(fetched) = fetched {
      self.persist(name, fetched).await;
    }
    Ok(collection)
  }

  /// Write the server's copy to snapshot storage off the runtime threads.
  async fn persist(&self, name: CollectionName, fetched: Fetched) {
    let storage = Arc::clone(&self.inner.storage);
    let key = self.key(name);
    let saved = tokio::task::spawn_blocking(move || {
      storage.save(&key, &fetched.records, fetched.fetched_at)
    })
    .await;
    match saved {
      Ok(Ok(())) => {}
      Ok(Err(e)) => warn!(collection = %name, error = %e, "failed to persist snapshot"),
      Err(e) => warn!(collection = %name, error = %e, "snapshot task failed"),
    }
  }

  /// Commit a fetch result. Returns the authoritative records to persist,
  /// or `None` when the fetch was superseded.
  fn commit_fetched(
    &self,
    name: CollectionName,
    generation: u64,
    result: Result<Vec<Record>, RemoteError>,
  ) -> Result<(Arc<Collection>, Option<Fetched>), CacheError> {
    let mut store = self.store()?;
    store.finish_fetch(name, generation);

    let fetched = match result {
      Ok(records) => records,
      Err(source) => {
        warn!(collection = %name, error = %source, "fetch failed, keeping previous collection");
        return Err(CacheError::Fetch {
          collection: name,
          source,
        });
      }
    };

    if store.is_superseded(name, generation) {
      debug!(collection = %name, generation, "discarding superseded fetch");
      return Ok((store.get(name), None));
    }

    let fetched_at = self.inner.clock.now();
    let current = store.get(name);
    let outcome = self.inner.diff.diff(current.records(), fetched);
    let has_changes = outcome.has_changes;
    let (changed, added, removed, skipped) = (
      outcome.changed_ids.len(),
      outcome.new_ids.len(),
      outcome.removed_ids.len(),
      outcome.skipped.len(),
    );

    // A full-collection fetch is authoritative: absence means deletion
    let authoritative = outcome.without_removed();
    store.set_authoritative(name, authoritative.clone(), fetched_at);
    let collection = if has_changes {
      let records = optimistic::reapply(authoritative.clone(), store.overlays(name));
      store.commit(name, generation, records, fetched_at)
    } else {
      store.touch(name, generation, fetched_at)
    };
    drop(store);

    info!(
      collection = %name,
      changed,
      added,
      removed,
      skipped,
      "collection fetched"
    );
    let fetched = Fetched {
      records: authoritative,
      fetched_at,
    };
    Ok((collection, Some(fetched)))
  }
}

/// Server copy of a collection as of one fetch.
struct Fetched {
  records: Vec<Arc<Record>>,
  fetched_at: DateTime<Utc>,
}
