//! Fleet domain: typed records and the operations the admin app performs.

mod client;
mod types;

pub use client::FleetClient;
pub use types::{
  decode, encode, normalize_trip, Company, NewTrip, NewVan, Trip, TripStatus, User, Van, VanStatus,
};
