//! Upstream departure-board client: HTTP fetch, retry policy and payload unwrapping.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use liveboard_core::{ProviderErrorKind, RawDeparture, Station};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};

pub const DEFAULT_BASE_URL: &str = "https://api.irail.be";

#[derive(Debug, Error)]
#[error("{} ({url}): {message}", .kind.as_str())]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub url: String,
    pub status: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, url: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            status: None,
            message: message.into(),
        }
    }

    fn from_status(status: StatusCode, url: &str) -> Self {
        Self {
            kind: ProviderErrorKind::HttpError,
            url: url.to_string(),
            status: Some(status.as_u16()),
            message: format!("http status {}", status.as_u16()),
        }
    }

    fn from_reqwest(err: &reqwest::Error, url: &str) -> Self {
        let kind = if err.is_timeout() {
            ProviderErrorKind::Timeout
        } else if err.is_decode() {
            ProviderErrorKind::MalformedPayload
        } else {
            ProviderErrorKind::Unreachable
        };
        Self::new(kind, url, err.to_string())
    }
}

/// Fetches the current departure board for one station.
#[async_trait]
pub trait DepartureProvider: Send + Sync {
    async fn fetch(&self, station: &Station) -> Result<Vec<RawDeparture>, ProviderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Longest a fetch can take when every attempt runs to `per_attempt` and
    /// every retry sleeps its full backoff.
    pub fn worst_case(&self, per_attempt: Duration) -> Duration {
        let attempts = u32::try_from(self.max_retries.saturating_add(1)).unwrap_or(u32::MAX);
        (0..self.max_retries).fold(per_attempt.saturating_mul(attempts), |total, i| {
            total.saturating_add(self.delay_for_attempt(i))
        })
    }
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_concurrent: usize,
    pub backoff: BackoffPolicy,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(10),
            user_agent: None,
            max_concurrent: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// iRail `liveboard` client. Holds no state between calls besides the
/// connection pool inside `reqwest::Client` and the concurrency permit pool.
#[derive(Debug, Clone)]
pub struct IrailClient {
    client: reqwest::Client,
    base_url: String,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl IrailClient {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().map_err(|err| {
            ProviderError::new(
                ProviderErrorKind::Unreachable,
                &config.base_url,
                format!("building http client: {err}"),
            )
        })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            limit: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            backoff: config.backoff,
        })
    }

    pub fn liveboard_url(&self) -> String {
        format!("{}/liveboard/", self.base_url)
    }

    async fn fetch_body(&self, station: &Station) -> Result<Vec<u8>, ProviderError> {
        let url = self.liveboard_url();
        let _permit = self.limit.acquire().await.map_err(|_| {
            ProviderError::new(ProviderErrorKind::Unreachable, &url, "client is shutting down")
        })?;

        let mut attempt = 0usize;
        loop {
            let sent = self
                .client
                .get(&url)
                .query(&[("station", station.id.as_str()), ("format", "json"), ("lang", "en")])
                .send()
                .await;

            let (err, disposition) = match sent {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        match resp.bytes().await {
                            Ok(body) => return Ok(body.to_vec()),
                            Err(err) => {
                                let disposition = classify_reqwest_error(&err);
                                (ProviderError::from_reqwest(&err, &url), disposition)
                            }
                        }
                    } else {
                        (ProviderError::from_status(status, &url), classify_status(status))
                    }
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    (ProviderError::from_reqwest(&err, &url), disposition)
                }
            };

            if disposition == RetryDisposition::NonRetryable || attempt >= self.backoff.max_retries {
                return Err(err);
            }

            let delay = self.backoff.delay_for_attempt(attempt);
            warn!(
                attempt,
                max_retries = self.backoff.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient provider failure; retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl DepartureProvider for IrailClient {
    async fn fetch(&self, station: &Station) -> Result<Vec<RawDeparture>, ProviderError> {
        let span = info_span!("provider_fetch", station = %station.id);
        async {
            let body = self.fetch_body(station).await?;
            let departures = parse_liveboard(&body).map_err(|message| {
                ProviderError::new(ProviderErrorKind::MalformedPayload, self.liveboard_url(), message)
            })?;
            debug!(count = departures.len(), "fetched departures");
            Ok::<_, ProviderError>(departures)
        }
        .instrument(span)
        .await
    }
}

/// Extracts `departures.departure[]` from a liveboard document.
///
/// A board without a `departures` section is an empty timetable. A single
/// departure serialized as an object instead of a one-element array is
/// accepted as well.
pub fn parse_liveboard(body: &[u8]) -> Result<Vec<RawDeparture>, String> {
    let doc: JsonValue =
        serde_json::from_slice(body).map_err(|e| format!("invalid liveboard JSON: {e}"))?;
    if !doc.is_object() {
        return Err("liveboard document is not a JSON object".to_string());
    }

    let entries = match doc.get("departures").and_then(|d| d.get("departure")) {
        None | Some(JsonValue::Null) => return Ok(Vec::new()),
        Some(JsonValue::Array(items)) => items.clone(),
        Some(single @ JsonValue::Object(_)) => vec![single.clone()],
        Some(other) => {
            return Err(format!("unexpected departures.departure value: {other}"));
        }
    };

    Ok(entries.into_iter().map(RawDeparture::new).collect())
}
