//! Polled data sources.
//!
//! A [`DataSource`] owns the state of one polled feed: its fetcher, cadence,
//! and the status machine `Idle → Loading → (Ok | Error) → Loading → …`.
//! The scheduler drives the machine; presentation only ever sees the
//! published [`SourceSlice`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use beacon_core::{EngineError, Result, SourceConfig, SourceId, SourceKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::payload::SourcePayload;

/// Fetch status of a polled source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    /// Registered, never fetched.
    #[default]
    Idle,
    /// A fetch is outstanding.
    Loading,
    /// The last fetch succeeded.
    Ok,
    /// The last fetch failed; `data` still holds the last good payload.
    Error,
}

/// The published view of one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSlice {
    pub id: SourceId,
    pub kind: SourceKind,
    pub status: SourceStatus,
    /// Last successfully fetched payload, kept across failures.
    pub data: Option<SourcePayload>,
    pub last_error: Option<String>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Set once `consecutive_failures` reaches the configured threshold.
    pub degraded: bool,
}

impl SourceSlice {
    /// True when the slot shows stale data next to an error marker.
    pub fn is_stale(&self) -> bool {
        self.status == SourceStatus::Error && self.data.is_some()
    }
}

/// A request/response exchange returning a JSON payload.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetch the current payload.
    async fn fetch(&self) -> Result<Value>;
}

/// Fetches a source over HTTP GET.
pub struct HttpSourceFetcher {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpSourceFetcher {
    /// Create a fetcher for `endpoint` whose client gives up after `timeout`.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        })
    }

    /// Create a fetcher from a source's configuration.
    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        Self::new(config.endpoint.clone(), config.request_timeout())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl SourceFetcher for HttpSourceFetcher {
    async fn fetch(&self) -> Result<Value> {
        debug!(endpoint = %self.endpoint, "fetching source");

        let response = self
            .client
            .get(&self.endpoint)
            .header("accept", "application/json")
            .send()
            .await
            .map_err(|e| EngineError::from(e).with_timeout(self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::from_http_status(status.as_u16(), &body));
        }

        response
            .json()
            .await
            .map_err(|e| EngineError::from(e).with_timeout(self.timeout))
    }
}

/// Adapts an async closure into a [`SourceFetcher`].
pub struct FnFetcher<F> {
    f: F,
}

impl<F> FnFetcher<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> SourceFetcher for FnFetcher<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn fetch(&self) -> Result<Value> {
        (self.f)().await
    }
}

/// Wrap an async closure as a shareable fetcher.
pub fn fn_fetcher<F, Fut>(f: F) -> Arc<dyn SourceFetcher>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnFetcher::new(f))
}

/// One polled feed with its own cadence and error state.
pub struct DataSource {
    id: SourceId,
    kind: SourceKind,
    fetcher: Arc<dyn SourceFetcher>,
    interval: Duration,
    request_timeout: Duration,
    status: SourceStatus,
    last_data: Option<SourcePayload>,
    last_error: Option<String>,
    last_fetched_at: Option<DateTime<Utc>>,
    consecutive_failures: u32,
}

impl DataSource {
    pub fn new(
        id: SourceId,
        kind: SourceKind,
        fetcher: Arc<dyn SourceFetcher>,
        interval: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            id,
            kind,
            fetcher,
            interval,
            request_timeout,
            status: SourceStatus::Idle,
            last_data: None,
            last_error: None,
            last_fetched_at: None,
            consecutive_failures: 0,
        }
    }

    pub fn id(&self) -> &SourceId {
        &self.id
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn fetcher(&self) -> Arc<dyn SourceFetcher> {
        Arc::clone(&self.fetcher)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn status(&self) -> SourceStatus {
        self.status
    }

    pub fn last_data(&self) -> Option<&SourcePayload> {
        self.last_data.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Enter `Loading`. Returns false if a fetch is already outstanding.
    pub fn begin_fetch(&mut self) -> bool {
        if self.status == SourceStatus::Loading {
            return false;
        }
        self.status = SourceStatus::Loading;
        true
    }

    /// Apply a fetch result: validate the payload and settle the status.
    pub fn complete_fetch(&mut self, outcome: Result<Value>) {
        match outcome.and_then(|raw| SourcePayload::parse(self.kind, raw)) {
            Ok(payload) => {
                self.status = SourceStatus::Ok;
                self.last_data = Some(payload);
                self.last_error = None;
                self.last_fetched_at = Some(Utc::now());
                self.consecutive_failures = 0;
            }
            Err(err) => {
                self.status = SourceStatus::Error;
                self.last_error = Some(err.to_string());
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            }
        }
    }

    /// Return an interrupted fetch to a settled state.
    ///
    /// Used when `stop()` aborts an in-flight request so no source is left
    /// `Loading` forever.
    pub fn abort_fetch(&mut self) {
        if self.status != SourceStatus::Loading {
            return;
        }
        self.status = if self.last_fetched_at.is_none() && self.last_error.is_none() {
            SourceStatus::Idle
        } else if self.last_error.is_some() {
            SourceStatus::Error
        } else {
            SourceStatus::Ok
        };
    }

    /// Build the published view.
    pub fn slice(&self, degraded_after: u32) -> SourceSlice {
        SourceSlice {
            id: self.id.clone(),
            kind: self.kind,
            status: self.status,
            data: self.last_data.clone(),
            last_error: self.last_error.clone(),
            last_fetched_at: self.last_fetched_at,
            consecutive_failures: self.consecutive_failures,
            degraded: degraded_after > 0 && self.consecutive_failures >= degraded_after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source(kind: SourceKind) -> DataSource {
        let fetcher = fn_fetcher(|| async { Ok(json!({})) });
        DataSource::new(
            SourceId::new("revenue"),
            kind,
            fetcher,
            Duration::from_secs(5),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_status_sequence() {
        let mut src = source(SourceKind::Metrics);
        assert_eq!(src.status(), SourceStatus::Idle);

        assert!(src.begin_fetch());
        assert!(!src.begin_fetch(), "second fetch must be refused while loading");
        src.complete_fetch(Err(EngineError::from_http_status(500, "boom")));
        assert_eq!(src.status(), SourceStatus::Error);
        assert!(src.last_data().is_none());

        assert!(src.begin_fetch());
        src.complete_fetch(Ok(json!({"metrics": [{"name": "revenue", "value": 10.0}]})));
        assert_eq!(src.status(), SourceStatus::Ok);
        assert_eq!(src.last_data().unwrap().metrics()[0].value, 10.0);
        assert!(src.last_error().is_none());
    }

    #[test]
    fn test_failure_keeps_last_data() {
        let mut src = source(SourceKind::Metrics);
        src.begin_fetch();
        src.complete_fetch(Ok(json!({"metrics": [{"name": "revenue", "value": 42.0}]})));

        src.begin_fetch();
        src.complete_fetch(Err(EngineError::transport("connection reset")));

        let slice = src.slice(3);
        assert_eq!(slice.status, SourceStatus::Error);
        assert!(slice.is_stale());
        assert_eq!(slice.data.unwrap().metrics()[0].value, 42.0);
        assert!(slice.last_error.unwrap().contains("connection reset"));
    }

    #[test]
    fn test_schema_violation_is_failure() {
        let mut src = source(SourceKind::Insights);
        src.begin_fetch();
        src.complete_fetch(Ok(json!(["not", "an", "object"])));
        assert_eq!(src.status(), SourceStatus::Error);
        assert_eq!(src.consecutive_failures(), 1);
    }

    #[test]
    fn test_degraded_after_threshold() {
        let mut src = source(SourceKind::Records);
        for _ in 0..2 {
            src.begin_fetch();
            src.complete_fetch(Err(EngineError::transport("down")));
        }
        assert!(!src.slice(3).degraded);

        src.begin_fetch();
        src.complete_fetch(Err(EngineError::transport("down")));
        assert!(src.slice(3).degraded);

        src.begin_fetch();
        src.complete_fetch(Ok(json!([])));
        let slice = src.slice(3);
        assert!(!slice.degraded);
        assert_eq!(slice.consecutive_failures, 0);
    }

    #[test]
    fn test_abort_fetch_settles_status() {
        let mut src = source(SourceKind::Records);
        src.begin_fetch();
        src.abort_fetch();
        assert_eq!(src.status(), SourceStatus::Idle);

        src.begin_fetch();
        src.complete_fetch(Ok(json!([])));
        src.begin_fetch();
        src.abort_fetch();
        assert_eq!(src.status(), SourceStatus::Ok);
    }

    #[tokio::test]
    async fn test_fn_fetcher() {
        let fetcher = fn_fetcher(|| async { Ok(json!({"items": [1, 2, 3]})) });
        let value = fetcher.fetch().await.unwrap();
        assert_eq!(value["items"].as_array().unwrap().len(), 3);
    }
}
