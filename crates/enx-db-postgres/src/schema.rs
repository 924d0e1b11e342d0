//! Schema bootstrap for the ENX tables.

use sqlx_core::query::query;
use sqlx_postgres::PgPool;
use tracing::{debug, instrument};

use crate::error::Result;

/// DDL statements, applied in order. Each is idempotent.
const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS health_authority (
        id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
        iss TEXT NOT NULL UNIQUE,
        aud TEXT NOT NULL,
        name TEXT NOT NULL,
        jwks_uri TEXT,
        enable_stats_api BOOLEAN NOT NULL DEFAULT FALSE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS health_authority_key (
        health_authority_id BIGINT NOT NULL REFERENCES health_authority (id) ON DELETE CASCADE,
        version TEXT NOT NULL,
        seq BIGINT GENERATED ALWAYS AS IDENTITY,
        from_timestamp TIMESTAMPTZ NOT NULL,
        thru_timestamp TIMESTAMPTZ,
        public_key TEXT NOT NULL,
        PRIMARY KEY (health_authority_id, version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS federation_out_authorization (
        issuer TEXT NOT NULL,
        subject TEXT NOT NULL,
        audience TEXT,
        include_regions TEXT[] NOT NULL DEFAULT '{}',
        exclude_regions TEXT[] NOT NULL DEFAULT '{}',
        note TEXT NOT NULL DEFAULT '',
        PRIMARY KEY (issuer, subject)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS lock (
        lock_id TEXT PRIMARY KEY,
        expires TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS exposure (
        id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
        exposure_key BYTEA NOT NULL,
        transmission_risk INT NOT NULL DEFAULT 0,
        regions TEXT[] NOT NULL DEFAULT '{}',
        interval_number INT NOT NULL,
        interval_count INT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        local_provenance BOOLEAN NOT NULL DEFAULT TRUE,
        traveler BOOLEAN NOT NULL DEFAULT FALSE,
        report_type TEXT NOT NULL DEFAULT '',
        days_since_symptom_onset INT,
        revised_report_type TEXT,
        revised_at TIMESTAMPTZ,
        revised_transmission_risk INT,
        revised_days_since_symptom_onset INT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS exposure_created_at_idx ON exposure (created_at, id)",
    "CREATE INDEX IF NOT EXISTS exposure_revised_at_idx ON exposure (revised_at, id) WHERE revised_at IS NOT NULL",
];

/// Creates the ENX tables if they do not exist.
#[instrument(skip(pool))]
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for statement in STATEMENTS {
        query(statement).execute(pool).await?;
    }
    debug!("Schema is up to date");
    Ok(())
}
