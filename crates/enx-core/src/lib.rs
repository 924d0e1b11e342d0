//! # enx-core
//!
//! Core domain types for the ENX key server: health authorities and their
//! signing keys, stored exposure keys, federation authorizations and fetch
//! cursors, and the time arithmetic shared by the publish and federation
//! pipelines.
//!
//! This crate holds no I/O. Storage backends live in `enx-db-postgres`
//! behind the traits in `enx-storage`; token and JWKS handling live in
//! `enx-auth`.

pub mod app;
pub mod authority;
pub mod error;
pub mod exposure;
pub mod federation;
pub mod time;

pub use app::AuthorizedApp;
pub use authority::{HealthAuthority, HealthAuthorityKey, pem_body};
pub use error::{CoreError, Result};
pub use exposure::{Exposure, KEY_LENGTH, ReportType, normalize_region, normalize_regions};
pub use federation::{Cursor, FederationOutAuthorization, FetchState, VerifiedClaims};
pub use time::{interval_number, interval_start, now_utc, truncate_window};
