//! Cross-entity invalidation rules.
//!
//! Some server-side state is derived from other tables: a van's status follows
//! the state of its trips. After a mutation succeeds, the collections that
//! depend on it are refetched so they show the server's derived values.

use std::fmt;

use super::manager::CacheManager;
use super::record::CollectionName;
use crate::error::CacheError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
  Van,
  Trip,
  User,
  Company,
}

impl EntityKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Van => "van",
      Self::Trip => "trip",
      Self::User => "user",
      Self::Company => "company",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
  Created,
  Updated,
  Completed,
  Deleted,
  /// Deleted while still in progress (an active trip)
  DeletedActive,
}

impl Transition {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Created => "created",
      Self::Updated => "updated",
      Self::Completed => "completed",
      Self::Deleted => "deleted",
      Self::DeletedActive => "deleted_active",
    }
  }
}

/// What a mutation did, e.g. `trip.completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MutationEvent {
  pub entity: EntityKind,
  pub transition: Transition,
}

impl MutationEvent {
  pub const fn new(entity: EntityKind, transition: Transition) -> Self {
    Self { entity, transition }
  }

  pub const TRIP_CREATED: Self = Self::new(EntityKind::Trip, Transition::Created);
  pub const TRIP_COMPLETED: Self = Self::new(EntityKind::Trip, Transition::Completed);
  pub const TRIP_DELETED: Self = Self::new(EntityKind::Trip, Transition::Deleted);
  pub const TRIP_DELETED_ACTIVE: Self = Self::new(EntityKind::Trip, Transition::DeletedActive);
  pub const VAN_CREATED: Self = Self::new(EntityKind::Van, Transition::Created);
  pub const VAN_UPDATED: Self = Self::new(EntityKind::Van, Transition::Updated);
  pub const VAN_DELETED: Self = Self::new(EntityKind::Van, Transition::Deleted);
  pub const USER_DELETED: Self = Self::new(EntityKind::User, Transition::Deleted);
  pub const COMPANY_DELETED: Self = Self::new(EntityKind::Company, Transition::Deleted);
}

impl fmt::Display for MutationEvent {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}", self.entity.as_str(), self.transition.as_str())
  }
}

pub type RuleTable = &'static [(MutationEvent, &'static [CollectionName])];

const FLEET_RULES: RuleTable = &[
  (MutationEvent::TRIP_CREATED, &[CollectionName::Vans]),
  (MutationEvent::TRIP_COMPLETED, &[CollectionName::Vans]),
  (MutationEvent::TRIP_DELETED_ACTIVE, &[CollectionName::Vans]),
  (MutationEvent::VAN_DELETED, &[CollectionName::Trips]),
  (MutationEvent::USER_DELETED, &[CollectionName::Trips]),
  (
    MutationEvent::COMPANY_DELETED,
    &[
      CollectionName::Vans,
      CollectionName::Users,
      CollectionName::Branches,
    ],
  ),
];

/// Static table from mutation event to the collections it makes stale.
#[derive(Debug, Clone, Copy)]
pub struct InvalidationRules {
  table: RuleTable,
}

impl Default for InvalidationRules {
  fn default() -> Self {
    Self { table: FLEET_RULES }
  }
}

impl InvalidationRules {
  pub const fn new(table: RuleTable) -> Self {
    Self { table }
  }

  /// Collections that depend on `event`. Empty when no rule matches.
  pub fn dependents(&self, event: MutationEvent) -> &'static [CollectionName] {
    self
      .table
      .iter()
      .find(|(e, _)| *e == event)
      .map(|(_, names)| *names)
      .unwrap_or(&[])
  }

  /// Force-refetch every collection depending on `event`.
  ///
  /// Only call this once the triggering write is confirmed by the server.
  pub async fn apply(
    &self,
    cache: &CacheManager,
    event: MutationEvent,
  ) -> Result<&'static [CollectionName], CacheError> {
    let names = self.dependents(event);
    if names.is_empty() {
      return Ok(names);
    }
    tracing::debug!(%event, collections = ?names, "refreshing dependent collections");
    cache.refresh(names).await?;
    Ok(names)
  }
}
