//! Per-collection time-to-live policy.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use super::record::{Collection, CollectionName};

/// Decides whether a cached collection may be served as-is.
#[derive(Debug, Clone)]
pub struct StalenessPolicy {
  ttls: HashMap<CollectionName, Duration>,
}

impl Default for StalenessPolicy {
  /// Van status is volatile, trips and people change often, reference data
  /// (companies, branches, roles) rarely.
  fn default() -> Self {
    let ttls = HashMap::from([
      (CollectionName::Vans, Duration::seconds(30)),
      (CollectionName::Trips, Duration::minutes(2)),
      (CollectionName::Users, Duration::minutes(5)),
      (CollectionName::UserGroups, Duration::minutes(5)),
      (CollectionName::Companies, Duration::minutes(10)),
      (CollectionName::Branches, Duration::minutes(10)),
      (CollectionName::MissionRoles, Duration::minutes(10)),
    ]);
    Self { ttls }
  }
}

impl StalenessPolicy {
  /// Override the TTL for one collection.
  pub fn with_ttl(mut self, name: CollectionName, ttl: Duration) -> Self {
    self.ttls.insert(name, ttl);
    self
  }

  pub fn ttl(&self, name: CollectionName) -> Duration {
    self
      .ttls
      .get(&name)
      .copied()
      .unwrap_or_else(|| Duration::minutes(5))
  }

  /// `now - last_fetched_at < ttl`. Never-fetched and invalidated collections are stale.
  pub fn is_fresh(&self, collection: &Collection, now: DateTime<Utc>) -> bool {
    if collection.is_invalidated() {
      return false;
    }
    match collection.last_fetched_at() {
      Some(fetched_at) => now - fetched_at < self.ttl(collection.name()),
      None => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_never_fetched_is_stale() {
    let policy = StalenessPolicy::default();
    let collection = Collection::empty(CollectionName::Companies);
    assert!(!policy.is_fresh(&collection, Utc::now()));
  }

  #[test]
  fn test_fresh_until_ttl_elapses() {
    let policy = StalenessPolicy::default();
    let fetched_at = Utc::now();
    let collection = Collection::fetched(CollectionName::Vans, Vec::new(), fetched_at);

    assert!(policy.is_fresh(&collection, fetched_at + Duration::seconds(29)));
    assert!(!policy.is_fresh(&collection, fetched_at + Duration::seconds(30)));
  }

  #[test]
  fn test_ttls_differ_per_collection() {
    let policy = StalenessPolicy::default();
    assert!(policy.ttl(CollectionName::Vans) < policy.ttl(CollectionName::Trips));
    assert!(policy.ttl(CollectionName::Trips) < policy.ttl(CollectionName::Companies));
  }

  #[test]
  fn test_invalidated_is_stale() {
    let policy = StalenessPolicy::default();
    let fetched_at = Utc::now();
    let collection =
      Collection::fetched(CollectionName::Companies, Vec::new(), fetched_at).marked_invalidated();
    assert!(!policy.is_fresh(&collection, fetched_at));
  }

  #[test]
  fn test_override() {
    let policy = StalenessPolicy::default().with_ttl(CollectionName::Vans, Duration::zero());
    let now = Utc::now();
    let collection = Collection::fetched(CollectionName::Vans, Vec::new(), now);
    assert!(!policy.is_fresh(&collection, now));
  }
}
