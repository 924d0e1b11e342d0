//! Cross-process named leases backed by the `lock` table.
//!
//! A lease is a row `(lock_id, expires)`. Acquisition upserts the row,
//! succeeding only when it is absent or its lease has lapsed, so a holder
//! that dies without unlocking blocks peers for at most the TTL.

use std::time::Duration;

use async_trait::async_trait;
use sqlx_core::query::query;
use sqlx_postgres::PgPool;
use time::OffsetDateTime;
use tracing::{debug, instrument, warn};

use enx_storage::{LockManager, StorageError, Unlocker};

use crate::error::storage_err;

const ACQUIRE_SQL: &str = r#"
INSERT INTO lock (lock_id, expires) VALUES ($1, $2)
ON CONFLICT (lock_id) DO UPDATE SET expires = EXCLUDED.expires
WHERE lock.expires < now()
"#;

/// PostgreSQL [`LockManager`].
pub struct PgLockManager {
    pool: PgPool,
}

impl PgLockManager {
    /// Creates a lock manager over the shared pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn unlocker(pool: PgPool, ids: Vec<String>) -> Unlocker {
        Unlocker::new(async move {
            let result = query("DELETE FROM lock WHERE lock_id = ANY($1)")
                .bind(&ids)
                .execute(&pool)
                .await
                .map_err(storage_err)?;
            if result.rows_affected() != ids.len() as u64 {
                warn!(?ids, "some leases had already expired at unlock");
            }
            Ok(())
        })
    }
}

#[async_trait]
impl LockManager for PgLockManager {
    #[instrument(skip(self))]
    async fn lock(&self, lock_id: &str, ttl: Duration) -> Result<Unlocker, StorageError> {
        let expires = OffsetDateTime::now_utc() + ttl;
        let result = query(ACQUIRE_SQL)
            .bind(lock_id)
            .bind(expires)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::already_locked(lock_id));
        }
        debug!(lock_id, ?ttl, "lease granted");
        Ok(Self::unlocker(self.pool.clone(), vec![lock_id.to_string()]))
    }

    #[instrument(skip(self))]
    async fn multi_lock(
        &self,
        lock_ids: &[&str],
        ttl: Duration,
    ) -> Result<Unlocker, StorageError> {
        let mut ids: Vec<String> = lock_ids.iter().map(|s| s.to_string()).collect();
        ids.sort();
        ids.dedup();

        let expires = OffsetDateTime::now_utc() + ttl;
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for id in &ids {
            let result = query(ACQUIRE_SQL)
                .bind(id)
                .bind(expires)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
            if result.rows_affected() == 0 {
                // Rolls back every lease taken so far.
                tx.rollback().await.map_err(storage_err)?;
                return Err(StorageError::already_locked(id.clone()));
            }
        }
        tx.commit().await.map_err(storage_err)?;
        debug!(?ids, ?ttl, "leases granted");
        Ok(Self::unlocker(self.pool.clone(), ids))
    }
}
