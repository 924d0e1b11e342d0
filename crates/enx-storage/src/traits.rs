//! Storage contracts implemented by database backends.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use enx_core::{Exposure, FederationOutAuthorization, HealthAuthority, HealthAuthorityKey};

use crate::error::StorageError;

/// Persistence for health authorities and their signing keys.
///
/// Mutating operations run in serializable transactions and must tolerate
/// retryable conflicts; a mutation matching zero rows surfaces as
/// [`StorageError::Conflict`].
#[async_trait]
pub trait HealthAuthorityStore: Send + Sync {
    /// Inserts a new authority and assigns its id. The authority must carry
    /// no keys; keys are attached afterwards via [`Self::add_key`].
    async fn add(&self, ha: &mut HealthAuthority) -> Result<(), StorageError>;

    /// Overwrites issuer, audience, name, JWKS URI and the stats-API flag
    /// for the authority with `ha.id`.
    async fn update(&self, ha: &HealthAuthority) -> Result<(), StorageError>;

    /// Returns the authority with the given issuer, keys attached in
    /// insertion order. Unknown issuers fail with the distinguished
    /// [`StorageError::NotFound`].
    async fn get_by_issuer(&self, issuer: &str) -> Result<HealthAuthority, StorageError>;

    /// Returns the authority with the given id, keys attached.
    async fn get_by_id(&self, id: i64) -> Result<HealthAuthority, StorageError>;

    /// Returns all authorities sorted by issuer ascending. Keys are not
    /// loaded.
    async fn list_all(&self) -> Result<Vec<HealthAuthority>, StorageError>;

    /// Inserts one signing key for the authority.
    async fn add_key(
        &self,
        ha: &HealthAuthority,
        key: &HealthAuthorityKey,
    ) -> Result<(), StorageError>;

    /// Updates `from`, `thru` and the PEM for the `(authority_id, version)`
    /// pair.
    async fn update_key(&self, key: &HealthAuthorityKey) -> Result<(), StorageError>;

    /// Deletes keys whose `thru` is set and precedes `before`. Returns the
    /// number of keys removed.
    async fn purge_keys(&self, ha_id: i64, before: OffsetDateTime) -> Result<u64, StorageError>;

    /// Returns the authority's keys in insertion order.
    async fn get_keys(&self, ha_id: i64) -> Result<Vec<HealthAuthorityKey>, StorageError>;
}

/// Persistence for federation peer authorizations.
#[async_trait]
pub trait FederationAuthorizationStore: Send + Sync {
    /// Looks up the authorization for an `(issuer, subject)` pair. Unknown
    /// pairs fail with the distinguished [`StorageError::NotFound`].
    async fn get(
        &self,
        issuer: &str,
        subject: &str,
    ) -> Result<FederationOutAuthorization, StorageError>;

    /// Inserts or replaces an authorization.
    async fn upsert(&self, auth: &FederationOutAuthorization) -> Result<(), StorageError>;

    /// Removes an authorization.
    async fn delete(&self, issuer: &str, subject: &str) -> Result<(), StorageError>;
}

/// Filter criteria for iterating stored exposures.
///
/// The same criteria drive the federation-out stream and the batch export
/// pipeline; both classes of keys (primary and revised) use one shape, with
/// `only_revised` switching the timestamp column the window applies to.
#[derive(Debug, Clone, Default)]
pub struct IterateCriteria {
    /// Regions the exposure must be reportable in (any-of). Empty means no
    /// region constraint.
    pub include_regions: Vec<String>,
    /// Regions that disqualify an exposure entirely.
    pub exclude_regions: Vec<String>,
    /// Exclusive lower bound on `created_at` (or `revised_at`).
    pub since: Option<OffsetDateTime>,
    /// Inclusive upper bound on `created_at` (or `revised_at`).
    pub until: Option<OffsetDateTime>,
    /// Opaque continuation from a previous interrupted iteration; empty
    /// means start from `since`. When set it takes precedence over `since`.
    pub last_cursor: String,
    /// Iterate revised keys (window applies to `revised_at`, which must be
    /// set) instead of primary keys.
    pub only_revised: bool,
    /// Only exposures flagged as traveler keys.
    pub only_travelers: bool,
    /// Only exposures published directly to this server.
    pub only_local_provenance: bool,
}

/// Visitor verdict for one iterated row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// The row was consumed; keep iterating.
    Continue,
    /// Stop without consuming this row. The returned continuation points at
    /// this row so the next iteration resumes with it.
    StopBefore,
}

/// Resumable iteration over stored exposures.
#[async_trait]
pub trait ExposureStore: Send + Sync {
    /// Iterates exposures matching `criteria` in ascending timestamp order,
    /// invoking `visit` per row.
    ///
    /// Returns the opaque continuation cursor: empty when the iteration ran
    /// to completion, otherwise positioned so the next call resumes at the
    /// first unconsumed row.
    async fn iterate(
        &self,
        criteria: &IterateCriteria,
        visit: &mut (dyn FnMut(Exposure) -> Visit + Send),
    ) -> Result<String, StorageError>;

    /// Inserts an exposure, returning its assigned id.
    async fn insert(&self, exposure: &Exposure) -> Result<i64, StorageError>;
}

/// An owned handle releasing a held lease.
pub struct Unlocker {
    release: Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send>>,
}

impl Unlocker {
    /// Wraps a release future.
    pub fn new(release: impl Future<Output = Result<(), StorageError>> + Send + 'static) -> Self {
        Self {
            release: Box::pin(release),
        }
    }

    /// Releases the lease.
    pub async fn unlock(self) -> Result<(), StorageError> {
        self.release.await
    }
}

impl std::fmt::Debug for Unlocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unlocker").finish_non_exhaustive()
    }
}

/// Cross-process named leases gating whole-fleet-exclusive operations.
///
/// A granted lease expires after `ttl` even if the holder dies; release
/// early via the returned [`Unlocker`]. A held lock reports
/// [`StorageError::AlreadyLocked`].
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Acquires one named lease.
    async fn lock(&self, lock_id: &str, ttl: Duration) -> Result<Unlocker, StorageError>;

    /// Acquires a set of named leases atomically. The ids are sorted
    /// deterministically before acquisition so concurrent workers cannot
    /// deadlock; if any lease is held, none are taken.
    async fn multi_lock(&self, lock_ids: &[&str], ttl: Duration)
    -> Result<Unlocker, StorageError>;
}
