//! Federation peer authorization storage.

use std::collections::BTreeSet;

use async_trait::async_trait;
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use sqlx_postgres::PgPool;
use tracing::instrument;

use enx_core::FederationOutAuthorization;
use enx_storage::{FederationAuthorizationStore, StorageError};

use crate::error::storage_err;

type AuthorizationRow = (
    String,
    String,
    Option<String>,
    Vec<String>,
    Vec<String>,
    String,
);

fn authorization_from_row(row: AuthorizationRow) -> FederationOutAuthorization {
    FederationOutAuthorization {
        issuer: row.0,
        subject: row.1,
        audience: row.2,
        include_regions: row.3.into_iter().collect::<BTreeSet<_>>(),
        exclude_regions: row.4.into_iter().collect::<BTreeSet<_>>(),
        note: row.5,
    }
}

/// PostgreSQL [`FederationAuthorizationStore`].
pub struct PgFederationAuthorizationStore {
    pool: PgPool,
}

impl PgFederationAuthorizationStore {
    /// Creates a store over the shared pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FederationAuthorizationStore for PgFederationAuthorizationStore {
    async fn get(
        &self,
        issuer: &str,
        subject: &str,
    ) -> Result<FederationOutAuthorization, StorageError> {
        let row: Option<AuthorizationRow> = query_as(
            r#"
            SELECT issuer, subject, audience, include_regions, exclude_regions, note
            FROM federation_out_authorization
            WHERE issuer = $1 AND subject = $2
            "#,
        )
        .bind(issuer)
        .bind(subject)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.map(authorization_from_row).ok_or_else(|| {
            StorageError::not_found("federation authorization", format!("{issuer}/{subject}"))
        })
    }

    #[instrument(skip(self, auth), fields(issuer = %auth.issuer, subject = %auth.subject))]
    async fn upsert(&self, auth: &FederationOutAuthorization) -> Result<(), StorageError> {
        let include: Vec<String> = auth.include_regions.iter().cloned().collect();
        let exclude: Vec<String> = auth.exclude_regions.iter().cloned().collect();
        query(
            r#"
            INSERT INTO federation_out_authorization
                (issuer, subject, audience, include_regions, exclude_regions, note)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (issuer, subject) DO UPDATE
            SET audience = EXCLUDED.audience,
                include_regions = EXCLUDED.include_regions,
                exclude_regions = EXCLUDED.exclude_regions,
                note = EXCLUDED.note
            "#,
        )
        .bind(&auth.issuer)
        .bind(&auth.subject)
        .bind(&auth.audience)
        .bind(&include)
        .bind(&exclude)
        .bind(&auth.note)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, issuer: &str, subject: &str) -> Result<(), StorageError> {
        let result = query(
            "DELETE FROM federation_out_authorization WHERE issuer = $1 AND subject = $2",
        )
        .bind(issuer)
        .bind(subject)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::not_found(
                "federation authorization",
                format!("{issuer}/{subject}"),
            ));
        }
        Ok(())
    }
}
