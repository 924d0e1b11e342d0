//! Resumable exposure iteration.
//!
//! Iteration is keyset-paginated over `(created_at, id)` (or
//! `(revised_at, id)` for revised keys). The continuation handed back to
//! callers encodes that position; see `enx_storage::cursor`.

use async_trait::async_trait;
use futures_util::TryStreamExt;
use sqlx_core::query_as::query_as;
use sqlx_postgres::PgPool;
use time::OffsetDateTime;

use enx_core::Exposure;
use enx_storage::{ExposureStore, IterateCriteria, StorageError, Visit, decode_cursor, encode_cursor};

use crate::error::storage_err;

const COLUMNS: &str = "id, exposure_key, transmission_risk, regions, interval_number, \
     interval_count, created_at, local_provenance, traveler, report_type, \
     days_since_symptom_onset, revised_report_type, revised_at, revised_transmission_risk, \
     revised_days_since_symptom_onset";

type ExposureRow = (
    i64,
    Vec<u8>,
    i32,
    Vec<String>,
    i32,
    i32,
    OffsetDateTime,
    bool,
    bool,
    String,
    Option<i32>,
    Option<String>,
    Option<OffsetDateTime>,
    Option<i32>,
    Option<i32>,
);

fn exposure_from_row(row: ExposureRow) -> Exposure {
    Exposure {
        id: row.0,
        exposure_key: row.1,
        transmission_risk: row.2,
        regions: row.3,
        interval_number: row.4,
        interval_count: row.5,
        created_at: row.6,
        local_provenance: row.7,
        traveler: row.8,
        report_type: row.9,
        days_since_symptom_onset: row.10,
        revised_report_type: row.11,
        revised_at: row.12,
        revised_transmission_risk: row.13,
        revised_days_since_symptom_onset: row.14,
    }
}

/// Bind values collected while assembling the dynamic WHERE clause, applied
/// in clause order.
enum Bind {
    Timestamp(OffsetDateTime),
    Id(i64),
    Regions(Vec<String>),
}

/// PostgreSQL [`ExposureStore`].
pub struct PgExposureStore {
    pool: PgPool,
}

impl PgExposureStore {
    /// Creates a store over the shared pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn build_query(criteria: &IterateCriteria) -> Result<(String, Vec<Bind>), StorageError> {
        let ts_column = if criteria.only_revised {
            "revised_at"
        } else {
            "created_at"
        };

        let mut clauses: Vec<String> = Vec::new();
        let mut binds: Vec<Bind> = Vec::new();
        let mut arg = 0usize;
        let mut placeholder = move || {
            arg += 1;
            format!("${arg}")
        };

        if criteria.only_revised {
            clauses.push("revised_at IS NOT NULL".to_string());
        }

        // A continuation is strictly more precise than `since`.
        if !criteria.last_cursor.is_empty() {
            let (ts, id) = decode_cursor(&criteria.last_cursor)?;
            let since = OffsetDateTime::from_unix_timestamp(ts)
                .map_err(|e| StorageError::internal(format!("malformed cursor: {e}")))?;
            clauses.push(format!(
                "({ts_column}, id) > ({}, {})",
                placeholder(),
                placeholder()
            ));
            binds.push(Bind::Timestamp(since));
            binds.push(Bind::Id(id));
        } else if let Some(since) = criteria.since {
            clauses.push(format!("{ts_column} > {}", placeholder()));
            binds.push(Bind::Timestamp(since));
        }

        if let Some(until) = criteria.until {
            clauses.push(format!("{ts_column} <= {}", placeholder()));
            binds.push(Bind::Timestamp(until));
        }
        if !criteria.include_regions.is_empty() {
            clauses.push(format!("regions && {}", placeholder()));
            binds.push(Bind::Regions(criteria.include_regions.clone()));
        }
        if !criteria.exclude_regions.is_empty() {
            // Rows with every region excluded never contribute output.
            clauses.push(format!("NOT (regions <@ {})", placeholder()));
            binds.push(Bind::Regions(criteria.exclude_regions.clone()));
        }
        if criteria.only_travelers {
            clauses.push("traveler".to_string());
        }
        if criteria.only_local_provenance {
            clauses.push("local_provenance".to_string());
        }

        let mut sql = format!("SELECT {COLUMNS} FROM exposure");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY {ts_column} ASC, id ASC"));

        Ok((sql, binds))
    }
}

#[async_trait]
impl ExposureStore for PgExposureStore {
    async fn iterate(
        &self,
        criteria: &IterateCriteria,
        visit: &mut (dyn FnMut(Exposure) -> Visit + Send),
    ) -> Result<String, StorageError> {
        let (sql, binds) = Self::build_query(criteria)?;

        let mut q = query_as::<_, ExposureRow>(&sql);
        for bind in binds {
            q = match bind {
                Bind::Timestamp(ts) => q.bind(ts),
                Bind::Id(id) => q.bind(id),
                Bind::Regions(regions) => q.bind(regions),
            };
        }

        // Floor the continuation at the starting position so an immediate
        // stop resumes from exactly where this call began.
        let mut last_consumed = if criteria.last_cursor.is_empty() {
            (
                criteria
                    .since
                    .map_or(i64::MIN, OffsetDateTime::unix_timestamp),
                i64::MAX,
            )
        } else {
            decode_cursor(&criteria.last_cursor)?
        };

        let mut rows = q.fetch(&self.pool);
        while let Some(row) = rows.try_next().await.map_err(storage_err)? {
            let exposure = exposure_from_row(row);
            let ts = if criteria.only_revised {
                exposure
                    .revised_at
                    .map_or(i64::MIN, |t| t.unix_timestamp())
            } else {
                exposure.created_at.unix_timestamp()
            };
            let id = exposure.id;
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
        let (id,): (i64,) = query_as(
            r#"
            INSERT INTO exposure
                (exposure_key, transmission_risk, regions, interval_number, interval_count,
                 created_at, local_provenance, traveler, report_type, days_since_symptom_onset,
                 revised_report_type, revised_at, revised_transmission_risk,
                 revised_days_since_symptom_onset)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING id
            "#,
        )
        .bind(&exposure.exposure_key)
        .bind(exposure.transmission_risk)
        .bind(&exposure.regions)
        .bind(exposure.interval_number)
        .bind(exposure.interval_count)
        .bind(exposure.created_at)
        .bind(exposure.local_provenance)
        .bind(exposure.traveler)
        .bind(&exposure.report_type)
        .bind(exposure.days_since_symptom_onset)
        .bind(&exposure.revised_report_type)
        .bind(exposure.revised_at)
        .bind(exposure.revised_transmission_risk)
        .bind(exposure.revised_days_since_symptom_onset)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(id)
    }
}
