//! Fleet operations on top of the cache and the mutation coordinator.

use serde::de::DeserializeOwned;

use super::types::{decode, encode, normalize_trip, Company, NewTrip, NewVan, Trip, User, Van};
use crate::cache::{
  CacheManager, Collection, CollectionName, MutationCoordinator, MutationEvent, MutationSpec,
  PendingMutation, Record, RecordId,
};
use crate::error::CacheError;

/// Typed fleet client.
///
/// Reads go through the cache; writes are optimistic and refresh the
/// collections whose server-side state depends on them.
#[derive(Clone)]
pub struct FleetClient {
  coordinator: MutationCoordinator,
}

impl FleetClient {
  pub fn new(coordinator: MutationCoordinator) -> Self {
    Self { coordinator }
  }

  pub fn cache(&self) -> &CacheManager {
    self.coordinator.cache()
  }

  pub async fn vans(&self) -> Result<Vec<Van>, CacheError> {
    self.read(CollectionName::Vans).await
  }

  pub async fn trips(&self) -> Result<Vec<Trip>, CacheError> {
    let collection = self.cache().get(CollectionName::Trips).await?;
    Ok(
      collection
        .records()
        .iter()
        .filter_map(|record| decode_logged(&collection, &normalize_trip((**record).clone())))
        .collect(),
    )
  }

  pub async fn users(&self) -> Result<Vec<User>, CacheError> {
    self.read(CollectionName::Users).await
  }

  pub async fn companies(&self) -> Result<Vec<Company>, CacheError> {
    self.read(CollectionName::Companies).await
  }

  /// Trips still in progress on `van_id`.
  pub async fn active_trips_for(&self, van_id: &RecordId) -> Result<Vec<Trip>, CacheError> {
    let trips = self.trips().await?;
    Ok(
      trips
        .into_iter()
        .filter(|t| t.is_active() && t.van_id.as_ref() == Some(van_id))
        .collect(),
    )
  }

  /// Start a trip. The trip shows as active right away; the server puts the
  /// van in transit and the vans are refreshed once it confirms.
  pub fn create_trip(&self, trip: NewTrip) -> Result<PendingMutation, CacheError> {
    let started_at = self.cache().now().to_rfc3339();
    let spec = MutationSpec::create(CollectionName::Trips, encode(&trip))
      .project(move |payload| {
        let mut trip = payload.with("status", "active");
        if trip.get("started_at").is_none() {
          trip.set("started_at", started_at.clone());
        }
        trip
      })
      .reconcile(normalize_trip)
      .emits(MutationEvent::TRIP_CREATED)
      .label("create trip");
    self.coordinator.execute(spec)
  }

  /// Close a trip with its final odometer reading.
  pub fn complete_trip(&self, id: RecordId, end_km: f64) -> Result<PendingMutation, CacheError> {
    let patch = Record::new()
      .with("status", "completed")
      .with("end_km", end_km)
      .with("ended_at", self.cache().now().to_rfc3339());
    let spec = MutationSpec::update(CollectionName::Trips, id, patch)
      .reconcile(normalize_trip)
      .emits(MutationEvent::TRIP_COMPLETED)
      .label("complete trip");
    self.coordinator.execute(spec)
  }

  /// Delete a trip. Deleting an active trip releases its van.
  pub fn delete_trip(&self, id: RecordId) -> Result<PendingMutation, CacheError> {
    let cached = self
      .cache()
      .peek(CollectionName::Trips)?
      .get(&id)
      .map(|t| t.get_str("status") == Some("active"));

    // The deleted row decides, then the cached copy. Unknown counts as active.
    let spec = MutationSpec::delete(CollectionName::Trips, id)
      .emits_from(move |server| {
        let active = match server.get_str("status") {
          Some(status) => status == "active",
          None => cached.unwrap_or(true),
        };
        if active {
          MutationEvent::TRIP_DELETED_ACTIVE
        } else {
          MutationEvent::TRIP_DELETED
        }
      })
      .label("delete trip");
    self.coordinator.execute(spec)
  }

  pub fn create_van(&self, van: NewVan) -> Result<PendingMutation, CacheError> {
    let spec = MutationSpec::create(CollectionName::Vans, encode(&van))
      .project(|payload| {
        if payload.get("status").is_some() {
          payload
        } else {
          payload.with("status", "Active")
        }
      })
      .emits(MutationEvent::VAN_CREATED)
      .label("create van");
    self.coordinator.execute(spec)
  }

  pub fn update_van(&self, id: RecordId, patch: Record) -> Result<PendingMutation, CacheError> {
    let spec = MutationSpec::update(CollectionName::Vans, id, patch)
      .emits(MutationEvent::VAN_UPDATED)
      .label("update van");
    self.coordinator.execute(spec)
  }

  pub fn delete_van(&self, id: RecordId) -> Result<PendingMutation, CacheError> {
    let spec = MutationSpec::delete(CollectionName::Vans, id)
      .emits(MutationEvent::VAN_DELETED)
      .label("delete van");
    self.coordinator.execute(spec)
  }

  pub fn delete_user(&self, id: RecordId) -> Result<PendingMutation, CacheError> {
    let spec = MutationSpec::delete(CollectionName::Users, id)
      .emits(MutationEvent::USER_DELETED)
      .label("delete user");
    self.coordinator.execute(spec)
  }

  pub fn delete_company(&self, id: RecordId) -> Result<PendingMutation, CacheError> {
    let spec = MutationSpec::delete(CollectionName::Companies, id)
      .emits(MutationEvent::COMPANY_DELETED)
      .label("delete company");
    self.coordinator.execute(spec)
  }

  async fn read<T: DeserializeOwned>(&self, name: CollectionName) -> Result<Vec<T>, CacheError> {
    let collection = self.cache().get(name).await?;
    Ok(decode_all(&collection))
  }
}

/// Decode every record, skipping the ones that do not fit the type.
fn decode_all<T: DeserializeOwned>(collection: &Collection) -> Vec<T> {
  collection
    .records()
    .iter()
    .filter_map(|record| decode_logged(collection, record))
    .collect()
}

fn decode_logged<T: DeserializeOwned>(collection: &Collection, record: &Record) -> Option<T> {
  match decode(record) {
    Ok(item) => Some(item),
    Err(e) => {
      tracing::warn!(
        collection = %collection.name(),
        id = ?record.id(),
        error = %e,
        "skipping undecodable record"
      );
      None
    }
  }
}
