//! Core domain model for the liveboard ingestion pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// A configured station. Never persisted; immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Station {
    /// Identifier passed to the provider (e.g. `Brussels-Central`).
    pub id: String,
    /// Display name.
    pub name: String,
}

impl Station {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Case-insensitive match against either the id or the display name.
    pub fn matches(&self, query: &str) -> bool {
        let query = query.trim();
        self.id.eq_ignore_ascii_case(query) || self.name.eq_ignore_ascii_case(query)
    }
}

impl fmt::Display for Station {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// One departure entry exactly as the provider returned it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawDeparture(pub JsonValue);

impl RawDeparture {
    pub fn new(value: JsonValue) -> Self {
        Self(value)
    }

    /// Walks nested objects; `None` as soon as a segment is absent.
    pub fn lookup(&self, path: &[&str]) -> Option<&JsonValue> {
        let mut cur = &self.0;
        for segment in path {
            cur = cur.get(*segment)?;
        }
        Some(cur)
    }
}

/// `(station_id, train_id, scheduled_time)`: identity of a real-world departure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub station_id: String,
    pub train_id: String,
    pub scheduled_time: DateTime<Utc>,
}

/// Canonical departure record produced by validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedRecord {
    pub station_id: String,
    pub train_id: String,
    pub scheduled_time: DateTime<Utc>,
    pub delay_seconds: i32,
    pub platform: Option<String>,
    pub destination: String,
    pub canceled: bool,
    pub collected_at: DateTime<Utc>,
}

impl ValidatedRecord {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            station_id: self.station_id.clone(),
            train_id: self.train_id.clone(),
            scheduled_time: self.scheduled_time,
        }
    }
}

/// Why a raw entry was dropped during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    MalformedRecord,
    InvalidDelay,
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscardReason::MalformedRecord => f.write_str("malformed_record"),
            DiscardReason::InvalidDelay => f.write_str("invalid_delay"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscardSummary {
    pub malformed: usize,
    pub invalid_delay: usize,
}

impl DiscardSummary {
    pub fn record(&mut self, reason: DiscardReason) {
        match reason {
            DiscardReason::MalformedRecord => self.malformed += 1,
            DiscardReason::InvalidDelay => self.invalid_delay += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.malformed + self.invalid_delay
    }
}

/// Deduplicated records for one station from one fetch cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestionBatch {
    pub station_id: String,
    pub collected_at: DateTime<Utc>,
    pub records: Vec<ValidatedRecord>,
    pub discarded: DiscardSummary,
}

impl IngestionBatch {
    pub fn empty(station_id: impl Into<String>, collected_at: DateTime<Utc>) -> Self {
        Self {
            station_id: station_id.into(),
            collected_at,
            records: Vec::new(),
            discarded: DiscardSummary::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Timeout,
    HttpError,
    Unreachable,
    MalformedPayload,
}

impl ProviderErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderErrorKind::Timeout => "provider.timeout",
            ProviderErrorKind::HttpError => "provider.http_error",
            ProviderErrorKind::Unreachable => "provider.unreachable",
            ProviderErrorKind::MalformedPayload => "provider.malformed_payload",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    ConnectionFailed,
    ConstraintViolation,
    Timeout,
    Backend,
}

impl StoreErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreErrorKind::ConnectionFailed => "store.connection_failed",
            StoreErrorKind::ConstraintViolation => "store.constraint_violation",
            StoreErrorKind::Timeout => "store.timeout",
            StoreErrorKind::Backend => "store.backend",
        }
    }
}

/// Kind carried by a failed [`IngestionResult`] or an on-demand error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    UnknownStation,
    Provider(ProviderErrorKind),
    Store(StoreErrorKind),
    DeadlineExceeded,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::UnknownStation => "validation.unknown_station",
            FailureKind::Provider(kind) => kind.as_str(),
            FailureKind::Store(kind) => kind.as_str(),
            FailureKind::DeadlineExceeded => "pipeline.deadline_exceeded",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FailureKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestionFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Per-station outcome of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestionResult {
    pub station_id: String,
    pub fetched: usize,
    pub discarded: DiscardSummary,
    pub persisted: u64,
    pub inserted: u64,
    pub updated: u64,
    pub elapsed_ms: u64,
    pub failure: Option<IngestionFailure>,
}

impl IngestionResult {
    pub fn failed(station_id: impl Into<String>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            station_id: station_id.into(),
            fetched: 0,
            discarded: DiscardSummary::default(),
            persisted: 0,
            inserted: 0,
            updated: 0,
            elapsed_ms: 0,
            failure: Some(IngestionFailure {
                kind,
                message: message.into(),
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Aggregate of a scheduled run: one result per configured station.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<IngestionResult>,
}

impl CollectionReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    pub fn total_persisted(&self) -> u64 {
        self.results.iter().map(|r| r.persisted).sum()
    }

    pub fn result_for(&self, station_id: &str) -> Option<&IngestionResult> {
        self.results.iter().find(|r| r.station_id == station_id)
    }
}
