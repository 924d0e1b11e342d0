//! # enx-db-postgres
//!
//! PostgreSQL storage backend for the ENX key server.
//!
//! Implements the `enx-storage` traits on top of `sqlx-postgres`:
//!
//! - [`PgHealthAuthorityStore`] — authorities and signing keys, with
//!   serializable mutations retried on conflict
//! - [`PgFederationAuthorizationStore`] — federation peer authorizations
//! - [`PgExposureStore`] — resumable keyset iteration over exposures
//! - [`PgLockManager`] — TTL leases in the `lock` table

mod config;
mod error;
mod exposure;
mod federation;
mod health_authority;
mod lock;
mod pool;
mod schema;

pub use config::PostgresConfig;
pub use error::{PostgresError, Result};
pub use exposure::PgExposureStore;
pub use federation::PgFederationAuthorizationStore;
pub use health_authority::PgHealthAuthorityStore;
pub use lock::PgLockManager;
pub use pool::create_pool;
pub use schema::ensure_schema;

/// Re-exported pool type used by all stores in this crate.
pub use sqlx_postgres::PgPool;
