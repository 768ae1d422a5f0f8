//! Client-side cache and synchronization layer for a fleet management backend.
//!
//! The crate keeps vans, trips, users and companies consistent between a
//! remote relational store and local callers:
//! - a query cache with per-collection staleness
//! - optimistic mutations reconciled with (or rolled back from) server results
//! - cross-entity invalidation (completing a trip refreshes the vans)
//! - a selective diff that keeps unchanged records pointer-identical

pub mod cache;
pub mod config;
pub mod error;
pub mod fleet;
pub mod logging;
pub mod notify;
pub mod permissions;
pub mod remote;

pub use cache::{CacheManager, Collection, CollectionName, MutationCoordinator, Record, RecordId};
pub use error::CacheError;
