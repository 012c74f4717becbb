//! Idempotent bulk persistence of validated departures.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use liveboard_core::{IngestionBatch, NaturalKey, StoreErrorKind, ValidatedRecord};
use sqlx::postgres::{PgConnection, PgPoolOptions};
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const DEFAULT_CHUNK_SIZE: usize = 500;
const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_MIN_CONNECTIONS: u32 = 0;
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 10;

// Relative to crates/liveboard-store/Cargo.toml.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

#[derive(Debug, Error)]
#[error("{}: {message}", .kind.as_str())]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let kind = match &err {
            sqlx::Error::PoolTimedOut => StoreErrorKind::Timeout,
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::Configuration(_) => StoreErrorKind::ConnectionFailed,
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // query_canceled, raised by statement_timeout
                Some("57014") => StoreErrorKind::Timeout,
                Some(code) if code.starts_with("23") => StoreErrorKind::ConstraintViolation,
                Some(code) if code.starts_with("08") => StoreErrorKind::ConnectionFailed,
                _ => StoreErrorKind::Backend,
            },
            _ => StoreErrorKind::Backend,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::new(StoreErrorKind::Backend, format!("migration failed: {err}"))
    }
}

/// Row counts from one committed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistOutcome {
    pub inserted: u64,
    pub updated: u64,
}

impl PersistOutcome {
    pub fn persisted(&self) -> u64 {
        self.inserted + self.updated
    }
}

/// Atomic upsert keyed by `(station_id, train_id, scheduled_time)`.
///
/// Either every record of the batch is visible after `persist` returns `Ok`,
/// or none is. Persisting the same batch twice leaves the same rows behind.
#[async_trait]
pub trait BulkStore: Send + Sync {
    async fn persist(&self, batch: &IngestionBatch) -> Result<PersistOutcome, StoreError>;

    /// Releases pooled connections. Further calls to `persist` fail.
    async fn close(&self) {}
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: DEFAULT_MIN_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgBulkStore {
    pool: PgPool,
    chunk_size: usize,
}

impl PgBulkStore {
    pub async fn connect(database_url: &str, config: PoolConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(database_url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies pending migrations and returns how many ran.
    pub async fn migrate(&self) -> Result<usize, StoreError> {
        let before = applied_migrations(&self.pool).await;
        MIGRATOR.run(&self.pool).await?;
        let after = applied_migrations(&self.pool).await;
        Ok(usize::try_from((after - before).max(0)).unwrap_or(0))
    }
}

async fn applied_migrations(pool: &PgPool) -> i64 {
    // The bookkeeping table is missing on a fresh database.
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM _sqlx_migrations WHERE success = true")
        .fetch_one(pool)
        .await
        .unwrap_or(0)
}

/// One record per natural key, the last occurrence winning, in the order the
/// survivors appeared. A single `ON CONFLICT DO UPDATE` statement may not touch
/// the same row twice.
pub fn collapse_duplicates(records: &[ValidatedRecord]) -> Vec<&ValidatedRecord> {
    let mut seen = HashSet::with_capacity(records.len());
    let mut kept = records
        .iter()
        .rev()
        .filter(|r| seen.insert(r.natural_key()))
        .collect::<Vec<_>>();
    kept.reverse();
    kept
}

/// Upserts one chunk; returns one flag per row, `true` when the row is new.
async fn upsert_chunk(conn: &mut PgConnection, records: &[&ValidatedRecord]) -> Result<Vec<bool>, sqlx::Error> {
    let mut station_ids: Vec<&str> = Vec::with_capacity(records.len());
    let mut train_ids: Vec<&str> = Vec::with_capacity(records.len());
    let mut scheduled: Vec<DateTime<Utc>> = Vec::with_capacity(records.len());
    let mut delays: Vec<i32> = Vec::with_capacity(records.len());
    let mut platforms: Vec<Option<&str>> = Vec::with_capacity(records.len());
    let mut destinations: Vec<&str> = Vec::with_capacity(records.len());
    let mut canceled: Vec<bool> = Vec::with_capacity(records.len());
    let mut collected: Vec<DateTime<Utc>> = Vec::with_capacity(records.len());

    for record in records {
        station_ids.push(&record.station_id);
        train_ids.push(&record.train_id);
        scheduled.push(record.scheduled_time);
        delays.push(record.delay_seconds);
        platforms.push(record.platform.as_deref());
        destinations.push(&record.destination);
        canceled.push(record.canceled);
        collected.push(record.collected_at);
    }

    sqlx::query_scalar::<_, bool>(
        "INSERT INTO train_departures \
             (station_id, train_id, scheduled_time, delay_seconds, platform, destination, \
              canceled, collected_at) \
         SELECT * FROM UNNEST(\
              $1::text[], $2::text[], $3::timestamptz[], $4::int4[], $5::text[], $6::text[], \
              $7::bool[], $8::timestamptz[]) \
         ON CONFLICT (station_id, train_id, scheduled_time) DO UPDATE SET \
             delay_seconds = EXCLUDED.delay_seconds, \
             platform      = EXCLUDED.platform, \
             destination   = EXCLUDED.destination, \
             canceled      = EXCLUDED.canceled, \
             collected_at  = EXCLUDED.collected_at, \
             updated_at    = NOW() \
         RETURNING (xmax = 0) AS is_new",
    )
    .bind(&station_ids)
    .bind(&train_ids)
    .bind(&scheduled)
    .bind(&delays)
    .bind(&platforms)
    .bind(&destinations)
    .bind(&canceled)
    .bind(&collected)
    .fetch_all(conn)
    .await
}

#[async_trait]
impl BulkStore for PgBulkStore {
    async fn persist(&self, batch: &IngestionBatch) -> Result<PersistOutcome, StoreError> {
        if batch.is_empty() {
            return Ok(PersistOutcome::default());
        }

        let records = collapse_duplicates(&batch.records);
        let mut tx = self.pool.begin().await?;
        let mut outcome = PersistOutcome::default();
        for chunk in records.chunks(self.chunk_size) {
            let flags = upsert_chunk(&mut tx, chunk).await?;
            let inserted = flags.iter().filter(|&&is_new| is_new).count() as u64;
            outcome.inserted += inserted;
            outcome.updated += flags.len() as u64 - inserted;
        }
        // Dropping `tx` on any early return above rolls the batch back.
        tx.commit().await?;

        debug!(
            station = %batch.station_id,
            inserted = outcome.inserted,
            updated = outcome.updated,
            "batch committed"
        );
        Ok(outcome)
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("database pool closed");
    }
}

/// In-process store with the same key and constraint rules as the
/// `train_departures` table. Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<NaturalKey, ValidatedRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn rows(&self) -> Vec<ValidatedRecord> {
        self.rows.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

#[async_trait]
impl BulkStore for MemoryStore {
    async fn persist(&self, batch: &IngestionBatch) -> Result<PersistOutcome, StoreError> {
        if let Some(bad) = batch.records.iter().find(|r| r.delay_seconds < 0) {
            return Err(StoreError::new(
                StoreErrorKind::ConstraintViolation,
                format!(
                    "delay_seconds must be non-negative (train {}, got {})",
                    bad.train_id, bad.delay_seconds
                ),
            ));
        }

        let mut rows = self.rows.lock().await;
        let mut outcome = PersistOutcome::default();
        for record in collapse_duplicates(&batch.records) {
            match rows.insert(record.natural_key(), record.clone()) {
                None => outcome.inserted += 1,
                Some(_) => outcome.updated += 1,
            }
        }
        Ok(outcome)
    }
}
