//! # enx-storage
//!
//! Storage abstraction layer for the ENX key server.
//!
//! This crate defines the traits every storage backend must implement; it
//! contains no database code. The PostgreSQL backend lives in
//! `enx-db-postgres`, and [`memory`] provides in-process implementations for
//! tests.
//!
//! ## Overview
//!
//! - [`HealthAuthorityStore`] — health authorities and their signing keys
//! - [`FederationAuthorizationStore`] — federation peer authorizations
//! - [`ExposureStore`] — resumable iteration over exposure keys
//! - [`LockManager`] — whole-fleet-exclusive named leases

pub mod cursor;
pub mod error;
pub mod memory;
mod traits;

pub use cursor::{decode_cursor, encode_cursor};
pub use error::StorageError;
pub use traits::{
    ExposureStore, FederationAuthorizationStore, HealthAuthorityStore, IterateCriteria,
    LockManager, Unlocker, Visit,
};
