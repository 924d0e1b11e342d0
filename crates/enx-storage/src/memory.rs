//! In-memory storage backends.
//!
//! These implementations back unit and integration tests for the cache,
//! verifier, JWKS manager and federation server without a live database.
//! They honor the same contracts as the PostgreSQL backend, including the
//! distinguished `NotFound` / `AlreadyLocked` outcomes and opaque exposure
//! continuation cursors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};

use enx_core::{Exposure, FederationOutAuthorization, HealthAuthority, HealthAuthorityKey};

use crate::cursor::{decode_cursor, encode_cursor};
use crate::error::StorageError;
use crate::traits::{
    ExposureStore, FederationAuthorizationStore, HealthAuthorityStore, IterateCriteria,
    LockManager, Unlocker, Visit,
};

/// In-memory [`HealthAuthorityStore`].
#[derive(Default)]
pub struct MemoryHealthAuthorityStore {
    inner: RwLock<AuthorityInner>,
}

#[derive(Default)]
struct AuthorityInner {
    next_id: i64,
    authorities: HashMap<i64, HealthAuthority>,
}

impl MemoryHealthAuthorityStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HealthAuthorityStore for MemoryHealthAuthorityStore {
    async fn add(&self, ha: &mut HealthAuthority) -> Result<(), StorageError> {
        ha.validate_new()?;
        let mut inner = self.inner.write().await;
        if inner.authorities.values().any(|a| a.issuer == ha.issuer) {
            return Err(StorageError::conflict(format!(
                "issuer already exists: {}",
                ha.issuer
            )));
        }
        inner.next_id += 1;
        ha.id = inner.next_id;
        inner.authorities.insert(ha.id, ha.clone());
        Ok(())
    }

    async fn update(&self, ha: &HealthAuthority) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let existing = inner
            .authorities
            .get_mut(&ha.id)
            .ok_or_else(|| StorageError::conflict(format!("no authority with id {}", ha.id)))?;
        existing.issuer = ha.issuer.clone();
        existing.audience = ha.audience.clone();
        existing.name = ha.name.clone();
        existing.jwks_uri = ha.jwks_uri.clone();
        existing.enable_stats_api = ha.enable_stats_api;
        Ok(())
    }

    async fn get_by_issuer(&self, issuer: &str) -> Result<HealthAuthority, StorageError> {
        let inner = self.inner.read().await;
        inner
            .authorities
            .values()
            .find(|a| a.issuer == issuer)
            .cloned()
            .ok_or_else(|| StorageError::not_found("health authority", issuer))
    }

    async fn get_by_id(&self, id: i64) -> Result<HealthAuthority, StorageError> {
        let inner = self.inner.read().await;
        inner
            .authorities
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("health authority", id.to_string()))
    }

    async fn list_all(&self) -> Result<Vec<HealthAuthority>, StorageError> {
        let inner = self.inner.read().await;
        let mut all: Vec<HealthAuthority> = inner
            .authorities
            .values()
            .map(|a| {
                let mut a = a.clone();
                a.keys.clear();
                a
            })
            .collect();
        all.sort_by(|a, b| a.issuer.cmp(&b.issuer));
        Ok(all)
    }

    async fn add_key(
        &self,
        ha: &HealthAuthority,
        key: &HealthAuthorityKey,
    ) -> Result<(), StorageError> {
        if ha.id == 0 {
            return Err(StorageError::conflict("authority id is zero"));
        }
        key.validate()?;
        let mut inner = self.inner.write().await;
        let authority = inner
            .authorities
            .get_mut(&ha.id)
            .ok_or_else(|| StorageError::conflict(format!("no authority with id {}", ha.id)))?;
        if authority.keys.iter().any(|k| k.version == key.version) {
            return Err(StorageError::conflict(format!(
                "key version already exists: {}",
                key.version
            )));
        }
        let mut key = key.clone();
        key.authority_id = ha.id;
        authority.keys.push(key);
        Ok(())
    }

    async fn update_key(&self, key: &HealthAuthorityKey) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let authority = inner.authorities.get_mut(&key.authority_id).ok_or_else(|| {
            StorageError::conflict(format!("no authority with id {}", key.authority_id))
        })?;
        let existing = authority
            .keys
            .iter_mut()
            .find(|k| k.version == key.version)
            .ok_or_else(|| {
                StorageError::conflict(format!("no key with version {}", key.version))
            })?;
        existing.from = key.from;
        existing.thru = key.thru;
        existing.public_key_pem = key.public_key_pem.clone();
        Ok(())
    }

    async fn purge_keys(&self, ha_id: i64, before: OffsetDateTime) -> Result<u64, StorageError> {
        let mut inner = self.inner.write().await;
        let authority = inner
            .authorities
            .get_mut(&ha_id)
            .ok_or_else(|| StorageError::conflict(format!("no authority with id {ha_id}")))?;
        let original = authority.keys.len();
        authority
            .keys
            .retain(|k| k.thru.is_none_or(|thru| thru >= before));
        Ok((original - authority.keys.len()) as u64)
    }

    async fn get_keys(&self, ha_id: i64) -> Result<Vec<HealthAuthorityKey>, StorageError> {
        let inner = self.inner.read().await;
        inner
            .authorities
            .get(&ha_id)
            .map(|a| a.keys.clone())
            .ok_or_else(|| StorageError::not_found("health authority", ha_id.to_string()))
    }
}

/// In-memory [`FederationAuthorizationStore`].
#[derive(Default)]
pub struct MemoryFederationAuthorizationStore {
    inner: RwLock<HashMap<(String, String), FederationOutAuthorization>>,
}

impl MemoryFederationAuthorizationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FederationAuthorizationStore for MemoryFederationAuthorizationStore {
    async fn get(
        &self,
        issuer: &str,
        subject: &str,
    ) -> Result<FederationOutAuthorization, StorageError> {
        let inner = self.inner.read().await;
        inner
            .get(&(issuer.to_string(), subject.to_string()))
            .cloned()
            .ok_or_else(|| {
                StorageError::not_found("federation authorization", format!("{issuer}/{subject}"))
            })
    }

    async fn upsert(&self, auth: &FederationOutAuthorization) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        inner.insert(
            (auth.issuer.clone(), auth.subject.clone()),
            auth.clone(),
        );
        Ok(())
    }

    async fn delete(&self, issuer: &str, subject: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        inner
            .remove(&(issuer.to_string(), subject.to_string()))
            .map(|_| ())
            .ok_or_else(|| {
                StorageError::not_found("federation authorization", format!("{issuer}/{subject}"))
            })
    }
}

/// In-memory [`ExposureStore`] with optional per-row yield delays so tests
/// can exercise mid-stream deadlines deterministically.
#[derive(Default)]
pub struct MemoryExposureStore {
    rows: RwLock<Vec<Exposure>>,
    next_id: Mutex<i64>,
    /// Sleep this long before yielding the row with the given id.
    delays: Mutex<HashMap<i64, Duration>>,
}

impl MemoryExposureStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a delay before the row with `id` is yielded.
    pub async fn delay_before(&self, id: i64, delay: Duration) {
        self.delays.lock().await.insert(id, delay);
    }

    fn sort_key(exposure: &Exposure, only_revised: bool) -> (i64, i64) {
        let ts = if only_revised {
            exposure
                .revised_at
                .map(|t| t.unix_timestamp())
                .unwrap_or(i64::MIN)
        } else {
            exposure.created_at.unix_timestamp()
        };
        (ts, exposure.id)
    }

    fn matches(exposure: &Exposure, criteria: &IterateCriteria) -> bool {
        if criteria.only_revised && exposure.revised_at.is_none() {
            return false;
        }
        if criteria.only_travelers && !exposure.traveler {
            return false;
        }
        if criteria.only_local_provenance && !exposure.local_provenance {
            return false;
        }
        if !criteria.include_regions.is_empty()
            && !exposure
                .regions
                .iter()
                .any(|r| criteria.include_regions.contains(r))
        {
            return false;
        }
        // Rows with every region excluded never contribute output.
        if !criteria.exclude_regions.is_empty()
            && exposure
                .regions
                .iter()
                .all(|r| criteria.exclude_regions.contains(r))
        {
            return false;
        }
        true
    }
}

#[async_trait]
impl ExposureStore for MemoryExposureStore {
    async fn iterate(
        &self,
        criteria: &IterateCriteria,
        visit: &mut (dyn FnMut(Exposure) -> Visit + Send),
    ) -> Result<String, StorageError> {
        let mut rows: Vec<Exposure> = {
            let guard = self.rows.read().await;
            guard
                .iter()
                .filter(|e| Self::matches(e, criteria))
                .cloned()
                .collect()
        };
        rows.sort_by_key(|e| Self::sort_key(e, criteria.only_revised));

        // A continuation is strictly more precise than `since`; without one,
        // the exclusive `since` bound becomes the floor position.
        let floor = if criteria.last_cursor.is_empty() {
            (
                criteria
                    .since
                    .map_or(i64::MIN, OffsetDateTime::unix_timestamp),
                i64::MAX,
            )
        } else {
            decode_cursor(&criteria.last_cursor)?
        };

        let mut last_consumed = floor;
        for exposure in rows {
            let (ts, id) = Self::sort_key(&exposure, criteria.only_revised);
            if (ts, id) <= floor {
                continue;
            }
            if let Some(until) = criteria.until
                && ts > until.unix_timestamp()
            {
                continue;
            }

            let delay = self.delays.lock().await.get(&exposure.id).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            match visit(exposure) {
                Visit::Continue => last_consumed = (ts, id),
                Visit::StopBefore => {
                    let (ts, id) = last_consumed;
                    return Ok(encode_cursor(ts, id));
                }
            }
        }
        Ok(String::new())
    }

    async fn insert(&self, exposure: &Exposure) -> Result<i64, StorageError> {
        let mut next_id = self.next_id.lock().await;
        *next_id += 1;
        let mut exposure = exposure.clone();
        exposure.id = *next_id;
        self.rows.write().await.push(exposure);
        Ok(*next_id)
    }
}

/// In-memory [`LockManager`] with real TTL expiry.
#[derive(Default)]
pub struct MemoryLockManager {
    leases: Arc<Mutex<HashMap<String, OffsetDateTime>>>,
}

impl MemoryLockManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn acquire(
        leases: &Arc<Mutex<HashMap<String, OffsetDateTime>>>,
        lock_ids: &[String],
        ttl: Duration,
    ) -> Result<(), StorageError> {
        let now = OffsetDateTime::now_utc();
        let mut guard = leases.lock().await;
        for id in lock_ids {
            if let Some(expires) = guard.get(id)
                && *expires > now
            {
                return Err(StorageError::already_locked(id.clone()));
            }
        }
        for id in lock_ids {
            guard.insert(id.clone(), now + ttl);
        }
        Ok(())
    }

    fn unlocker(leases: Arc<Mutex<HashMap<String, OffsetDateTime>>>, ids: Vec<String>) -> Unlocker {
        Unlocker::new(async move {
            let mut guard = leases.lock().await;
            for id in &ids {
                guard.remove(id);
            }
            Ok(())
        })
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn lock(&self, lock_id: &str, ttl: Duration) -> Result<Unlocker, StorageError> {
        let ids = vec![lock_id.to_string()];
        Self::acquire(&self.leases, &ids, ttl).await?;
        Ok(Self::unlocker(Arc::clone(&self.leases), ids))
    }

    async fn multi_lock(
        &self,
        lock_ids: &[&str],
        ttl: Duration,
    ) -> Result<Unlocker, StorageError> {
        let mut ids: Vec<String> = lock_ids.iter().map(|s| s.to_string()).collect();
        ids.sort();
        ids.dedup();
        Self::acquire(&self.leases, &ids, ttl).await?;
        Ok(Self::unlocker(Arc::clone(&self.leases), ids))
    }
}
