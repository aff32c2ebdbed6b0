//! Vessel store: one row per vessel, latest state only.

mod memory;
mod models;

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool, Postgres, QueryBuilder,
};
use tracing::{debug, info};

use crate::{
    config::DatabaseConfig,
    errors::{AppError, StoreError},
    models::{BoundingBox, VesselState},
};
use models::VesselRow;

pub use memory::MemoryStore;

/// Rows per INSERT statement, keeps bind parameters well under the
/// Postgres limit of 65535.
const UPSERT_CHUNK: usize = 1000;

/// Spatially and temporally scoped read.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewportQuery {
    /// Bucket geohashes intersecting `bbox`; `None` scans by rectangle only
    pub buckets: Option<Vec<String>>,
    /// Exact rectangle filter
    pub bbox: BoundingBox,
    /// Only rows with `last_updated` strictly after this
    pub fresh_after: DateTime<Utc>,
    /// Delta cursor, only rows with `last_updated` strictly after this
    pub since: Option<DateTime<Utc>>,
}

impl ViewportQuery {
    /// Row-level predicate shared by every store implementation.
    pub fn matches(&self, vessel: &VesselState) -> bool {
        vessel.last_updated > self.fresh_after
            && self.since.map_or(true, |since| vessel.last_updated > since)
            && self.bbox.contains(vessel.latitude, vessel.longitude)
            && self
                .buckets
                .as_ref()
                .map_or(true, |buckets| buckets.iter().any(|b| *b == vessel.geohash_bucket))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VesselCounts {
    pub total: i64,
    pub fresh: i64,
}

/// Storage operations used by the writer, the reaper and the query service.
#[async_trait]
pub trait VesselStore: Send + Sync {
    /// Conditionally upsert `batch`, which holds at most one entry per MMSI.
    ///
    /// A row is inserted when absent and overwritten only when the incoming
    /// `last_updated` is not older than the stored one. Returns the number of
    /// rows inserted or updated.
    async fn upsert_batch(&self, batch: &[VesselState]) -> Result<u64, StoreError>;

    /// Vessels matching `query`, most recently updated first.
    async fn query_viewport(&self, query: &ViewportQuery) -> Result<Vec<VesselState>, StoreError>;

    /// Delete every vessel with `last_updated` before `cutoff`. Returns the
    /// number of rows removed.
    async fn delete_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Total and fresh vessel counts, doubles as a liveness check.
    async fn counts(&self) -> Result<VesselCounts, StoreError>;
}

/// PostgreSQL / PostGIS backed vessel store
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Wrap an existing pool and bring the schema up to date.
    pub async fn new(pool: PgPool) -> Result<Self, AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Connect using `config` and run migrations.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let options = PgConnectOptions::from_str(&config.url)
            .map_err(|e| AppError::DatabaseConnectionError(e.to_string()))?
            .options([(
                "statement_timeout",
                config.statement_timeout.as_millis().to_string(),
            )]);

        info!(
            "Connecting to database: max_connections={}, statement_timeout={:?}",
            config.max_connections, config.statement_timeout
        );
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(|e| AppError::DatabaseConnectionError(e.to_string()))?;

        Self::new(pool).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn upsert_statement(chunk: &[VesselState]) -> QueryBuilder<'_, Postgres> {
        let mut qb = QueryBuilder::new(
            "INSERT INTO vessels (
                mmsi, latitude, longitude, location, course, speed,
                ship_type, geohash, geohash_5, last_updated, received_at
            ) ",
        );
        qb.push_values(chunk, |mut row, v| {
            row.push_bind(v.mmsi.value() as i32)
                .push_bind(v.latitude)
                .push_bind(v.longitude)
                .push("ST_SetSRID(ST_MakePoint(")
                .push_bind_unseparated(v.longitude)
                .push_unseparated(", ")
                .push_bind_unseparated(v.latitude)
                .push_unseparated("), 4326)::geography")
                .push_bind(v.course)
                .push_bind(v.speed)
                .push_bind(v.ship_type.map(i16::from))
                .push_bind(&v.geohash)
                .push_bind(&v.geohash_bucket)
                .push_bind(v.last_updated)
                .push_bind(v.received_at);
        });
        qb.push(
            " ON CONFLICT (mmsi) DO UPDATE SET
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude,
                location = EXCLUDED.location,
                course = EXCLUDED.course,
                speed = EXCLUDED.speed,
                ship_type = EXCLUDED.ship_type,
                geohash = EXCLUDED.geohash,
                geohash_5 = EXCLUDED.geohash_5,
                last_updated = EXCLUDED.last_updated,
                received_at = EXCLUDED.received_at
            WHERE vessels.last_updated <= EXCLUDED.last_updated",
        );
        qb
    }
}

const QUERY_VIEWPORT: &str = "
    SELECT mmsi, latitude, longitude, course, speed, ship_type,
           geohash, geohash_5, last_updated, received_at
    FROM vessels
    WHERE ($1::text[] IS NULL OR geohash_5 = ANY($1))
      AND latitude BETWEEN $2 AND $3
      AND longitude BETWEEN $4 AND $5
      AND last_updated > $6
      AND ($7::timestamptz IS NULL OR last_updated > $7)
    ORDER BY last_updated DESC";

const DELETE_STALE: &str = "SELECT delete_stale_vessels($1)";

const COUNT_VESSELS: &str = "
    SELECT (SELECT COUNT(*) FROM vessels) AS total,
           (SELECT COUNT(*) FROM fresh_vessels) AS fresh";

#[async_trait]
impl VesselStore for Database {
    async fn upsert_batch(&self, batch: &[VesselState]) -> Result<u64, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut applied = 0;
        for chunk in batch.chunks(UPSERT_CHUNK) {
            let result = Self::upsert_statement(chunk).build().execute(&mut *tx).await?;
            applied += result.rows_affected();
        }
        tx.commit().await?;

        debug!("Upserted {} of {} vessels", applied, batch.len());
        Ok(applied)
    }

    async fn query_viewport(&self, query: &ViewportQuery) -> Result<Vec<VesselState>, StoreError> {
        let rows: Vec<VesselRow> = sqlx::query_as(QUERY_VIEWPORT)
            .bind(&query.buckets)
            .bind(query.bbox.min_lat)
            .bind(query.bbox.max_lat)
            .bind(query.bbox.min_lon)
            .bind(query.bbox.max_lon)
            .bind(query.fresh_after)
            .bind(query.since)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(VesselState::try_from).collect()
    }

    async fn delete_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let deleted: i64 = sqlx::query_scalar(DELETE_STALE)
            .bind(cutoff)
            .fetch_one(&self.pool)
            .await?;
        Ok(deleted.max(0) as u64)
    }

    async fn counts(&self) -> Result<VesselCounts, StoreError> {
        let (total, fresh): (i64, i64) = sqlx::query_as(COUNT_VESSELS)
            .fetch_one(&self.pool)
            .await?;
        Ok(VesselCounts { total, fresh })
    }
}
