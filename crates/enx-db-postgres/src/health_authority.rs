//! Health authority and signing-key storage.

use async_trait::async_trait;
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use sqlx_postgres::PgPool;
use time::OffsetDateTime;
use tracing::{debug, instrument};

use enx_core::{HealthAuthority, HealthAuthorityKey};
use enx_storage::{HealthAuthorityStore, StorageError};

use crate::error::{PostgresError, storage_err};

/// Attempts per serializable mutation before surfacing the conflict.
const SERIALIZATION_RETRIES: u32 = 3;

type AuthorityRow = (i64, String, String, String, Option<String>, bool);
type KeyRow = (i64, String, OffsetDateTime, Option<OffsetDateTime>, String);

fn authority_from_row(row: AuthorityRow) -> HealthAuthority {
    HealthAuthority {
        id: row.0,
        issuer: row.1,
        audience: row.2,
        name: row.3,
        jwks_uri: row.4,
        enable_stats_api: row.5,
        keys: vec![],
    }
}

fn key_from_row(row: KeyRow) -> HealthAuthorityKey {
    HealthAuthorityKey {
        authority_id: row.0,
        version: row.1,
        from: row.2,
        thru: row.3,
        public_key_pem: row.4,
    }
}

/// PostgreSQL [`HealthAuthorityStore`].
///
/// Mutations run in serializable transactions; SQLSTATE 40001 conflicts are
/// retried a bounded number of times before surfacing.
pub struct PgHealthAuthorityStore {
    pool: PgPool,
}

impl PgHealthAuthorityStore {
    /// Creates a store over the shared pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn try_add(&self, ha: &HealthAuthority) -> Result<i64, PostgresError> {
        let mut tx = self.pool.begin().await?;
        query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        let (id,): (i64,) = query_as(
            r#"
            INSERT INTO health_authority (iss, aud, name, jwks_uri, enable_stats_api)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&ha.issuer)
        .bind(&ha.audience)
        .bind(&ha.name)
        .bind(&ha.jwks_uri)
        .bind(ha.enable_stats_api)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn try_update(&self, ha: &HealthAuthority) -> Result<u64, PostgresError> {
        let mut tx = self.pool.begin().await?;
        query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        let result = query(
            r#"
            UPDATE health_authority
            SET iss = $1, aud = $2, name = $3, jwks_uri = $4, enable_stats_api = $5
            WHERE id = $6
            "#,
        )
        .bind(&ha.issuer)
        .bind(&ha.audience)
        .bind(&ha.name)
        .bind(&ha.jwks_uri)
        .bind(ha.enable_stats_api)
        .bind(ha.id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn try_add_key(&self, key: &HealthAuthorityKey) -> Result<(), PostgresError> {
        let mut tx = self.pool.begin().await?;
        query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        query(
            r#"
            INSERT INTO health_authority_key
                (health_authority_id, version, from_timestamp, thru_timestamp, public_key)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(key.authority_id)
        .bind(&key.version)
        .bind(key.from)
        .bind(key.thru)
        .bind(&key.public_key_pem)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn try_update_key(&self, key: &HealthAuthorityKey) -> Result<u64, PostgresError> {
        let mut tx = self.pool.begin().await?;
        query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        let result = query(
            r#"
            UPDATE health_authority_key
            SET from_timestamp = $1, thru_timestamp = $2, public_key = $3
            WHERE health_authority_id = $4 AND version = $5
            "#,
        )
        .bind(key.from)
        .bind(key.thru)
        .bind(&key.public_key_pem)
        .bind(key.authority_id)
        .bind(&key.version)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn load_authority(&self, row: AuthorityRow) -> Result<HealthAuthority, StorageError> {
        let mut authority = authority_from_row(row);
        authority.keys = self.get_keys(authority.id).await?;
        Ok(authority)
    }
}

macro_rules! retry_serializable {
    ($attempt_expr:expr) => {{
        let mut attempt = 0;
        loop {
            match $attempt_expr {
                Err(e) if e.is_serialization_failure() && attempt < SERIALIZATION_RETRIES => {
                    attempt += 1;
                    debug!(attempt, "retrying serializable transaction after conflict");
                }
                other => break other,
            }
        }
    }};
}

#[async_trait]
impl HealthAuthorityStore for PgHealthAuthorityStore {
    #[instrument(skip(self, ha), fields(issuer = %ha.issuer))]
    async fn add(&self, ha: &mut HealthAuthority) -> Result<(), StorageError> {
        ha.validate_new()?;
        let id = retry_serializable!(self.try_add(ha).await)?;
        ha.id = id;
        Ok(())
    }

    #[instrument(skip(self, ha), fields(id = ha.id))]
    async fn update(&self, ha: &HealthAuthority) -> Result<(), StorageError> {
        let rows = retry_serializable!(self.try_update(ha).await)?;
        if rows == 0 {
            return Err(StorageError::conflict(format!(
                "no health authority with id {}",
                ha.id
            )));
        }
        Ok(())
    }

    async fn get_by_issuer(&self, issuer: &str) -> Result<HealthAuthority, StorageError> {
        let row: Option<AuthorityRow> = query_as(
            r#"
            SELECT id, iss, aud, name, jwks_uri, enable_stats_api
            FROM health_authority
            WHERE iss = $1
            "#,
        )
        .bind(issuer)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        match row {
            Some(row) => self.load_authority(row).await,
            None => Err(StorageError::not_found("health authority", issuer)),
        }
    }

    async fn get_by_id(&self, id: i64) -> Result<HealthAuthority, StorageError> {
        let row: Option<AuthorityRow> = query_as(
            r#"
            SELECT id, iss, aud, name, jwks_uri, enable_stats_api
            FROM health_authority
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        match row {
            Some(row) => self.load_authority(row).await,
            None => Err(StorageError::not_found("health authority", id.to_string())),
        }
    }

    async fn list_all(&self) -> Result<Vec<HealthAuthority>, StorageError> {
        let rows: Vec<AuthorityRow> = query_as(
            r#"
            SELECT id, iss, aud, name, jwks_uri, enable_stats_api
            FROM health_authority
            ORDER BY iss ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(rows.into_iter().map(authority_from_row).collect())
    }

    #[instrument(skip(self, ha, key), fields(authority_id = ha.id, version = %key.version))]
    async fn add_key(
        &self,
        ha: &HealthAuthority,
        key: &HealthAuthorityKey,
    ) -> Result<(), StorageError> {
        if ha.id == 0 {
            return Err(StorageError::conflict(
                "authority must be persisted before keys are attached",
            ));
        }
        key.validate()?;
        let mut key = key.clone();
        key.authority_id = ha.id;
        retry_serializable!(self.try_add_key(&key).await)?;
        Ok(())
    }

    #[instrument(skip(self, key), fields(authority_id = key.authority_id, version = %key.version))]
    async fn update_key(&self, key: &HealthAuthorityKey) -> Result<(), StorageError> {
        let rows = retry_serializable!(self.try_update_key(key).await)?;
        if rows == 0 {
            return Err(StorageError::conflict(format!(
                "no key {} for authority {}",
                key.version, key.authority_id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn purge_keys(&self, ha_id: i64, before: OffsetDateTime) -> Result<u64, StorageError> {
        let result = query(
            r#"
            DELETE FROM health_authority_key
            WHERE health_authority_id = $1
              AND thru_timestamp IS NOT NULL
              AND thru_timestamp < $2
            "#,
        )
        .bind(ha_id)
        .bind(before)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(result.rows_affected())
    }

    async fn get_keys(&self, ha_id: i64) -> Result<Vec<HealthAuthorityKey>, StorageError> {
        let rows: Vec<KeyRow> = query_as(
            r#"
            SELECT health_authority_id, version, from_timestamp, thru_timestamp, public_key
            FROM health_authority_key
            WHERE health_authority_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(ha_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(rows.into_iter().map(key_from_row).collect())
    }
}
