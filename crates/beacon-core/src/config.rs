//! Engine configuration.
//!
//! The recognized options per source and controller are `endpoint`,
//! `interval_ms`, `debounce_ms`, and `request_timeout_ms`. Configuration is
//! usually embedded in the host's own YAML:
//!
//! ```yaml
//! sources:
//!   - id: revenue
//!     endpoint: https://bi.example.com/api/metrics/revenue
//!     interval_ms: 5000
//!     kind: metrics
//! search:
//!   endpoint: https://bi.example.com/api/search
//!   debounce_ms: 300
//! chat:
//!   endpoint: https://bi.example.com/api/chat/stream
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::types::{SourceId, SourceKind};

/// Default request timeout for polled sources.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Default quiet period before a search executes.
pub const DEFAULT_DEBOUNCE_MS: u64 = 300;

/// Default consecutive failures before a source is marked degraded.
pub const DEFAULT_DEGRADED_AFTER: u32 = 3;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Polled sources, registered in order at engine start.
    pub sources: Vec<SourceConfig>,

    /// Search controller configuration.
    pub search: SearchConfig,

    /// Streaming assistant configuration.
    pub chat: StreamConfig,

    /// Consecutive failures after which a source is flagged degraded.
    pub degraded_after: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            search: SearchConfig::default(),
            chat: StreamConfig::default(),
            degraded_after: DEFAULT_DEGRADED_AFTER,
        }
    }
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

impl EngineConfig {
    /// Parse configuration from a YAML string and validate it.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::config(format!("invalid YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file and validate it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::io("reading config", path, e))?;
        Self::from_yaml_str(&content)
    }

    /// Add a polled source.
    pub fn with_source(mut self, source: SourceConfig) -> Self {
        self.sources.push(source);
        self
    }

    /// Replace the search configuration.
    pub fn with_search(mut self, search: SearchConfig) -> Self {
        self.search = search;
        self
    }

    /// Replace the streaming configuration.
    pub fn with_chat(mut self, chat: StreamConfig) -> Self {
        self.chat = chat;
        self
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.id.as_str().trim().is_empty() {
                return Err(EngineError::config("source id must not be empty"));
            }
            if !seen.insert(source.id.clone()) {
                return Err(EngineError::config(format!("duplicate source id: {}", source.id)));
            }
            if source.endpoint.trim().is_empty() {
                return Err(EngineError::config(format!("source {} has no endpoint", source.id)));
            }
            if source.interval_ms == 0 {
                return Err(EngineError::config(format!(
                    "source {} interval_ms must be positive",
                    source.id
                )));
            }
            if source.request_timeout_ms == 0 {
                return Err(EngineError::config(format!(
                    "source {} request_timeout_ms must be positive",
                    source.id
                )));
            }
        }

        if self.search.request_timeout_ms == 0 {
            return Err(EngineError::config("search request_timeout_ms must be positive"));
        }
        if self.chat.request_timeout_ms == 0 || self.chat.idle_timeout_ms == 0 {
            return Err(EngineError::config("chat timeouts must be positive"));
        }

        Ok(())
    }
}

/// Configuration for one polled source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Unique source id.
    pub id: SourceId,

    /// URL fetched on every tick.
    pub endpoint: String,

    /// Polling cadence.
    pub interval_ms: u64,

    /// Bound on a single fetch.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Payload schema.
    #[serde(default)]
    pub kind: SourceKind,
}

impl SourceConfig {
    /// Create a source config with the default timeout and `Records` schema.
    pub fn new(id: impl Into<SourceId>, endpoint: impl Into<String>, interval_ms: u64) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            interval_ms,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            kind: SourceKind::Records,
        }
    }

    /// Set the payload schema.
    pub fn with_kind(mut self, kind: SourceKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the request timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = timeout_ms;
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Search controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Search endpoint (POST).
    pub endpoint: String,

    /// Quiet period with no further edits before a request is sent.
    pub debounce_ms: u64,

    /// Bounded wait before the fallback set is shown.
    pub request_timeout_ms: u64,

    /// Local results offered when live search fails.
    pub fallback: Vec<FallbackEntry>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            request_timeout_ms: 5_000,
            fallback: Vec::new(),
        }
    }
}

impl SearchConfig {
    /// Set the endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Set the debounce period.
    pub fn with_debounce_ms(mut self, debounce_ms: u64) -> Self {
        self.debounce_ms = debounce_ms;
        self
    }

    /// Set the request timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = timeout_ms;
        self
    }

    /// Add a local fallback entry.
    pub fn with_fallback(mut self, entry: FallbackEntry) -> Self {
        self.fallback.push(entry);
        self
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// A locally configured search result used on the fallback path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FallbackEntry {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl FallbackEntry {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            metadata: serde_json::Value::Null,
        }
    }
}

/// Streaming assistant configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Streaming endpoint (POST, `text/event-stream` response).
    pub endpoint: String,

    /// Bound on opening the stream.
    pub request_timeout_ms: u64,

    /// Longest silence tolerated between two events.
    pub idle_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            request_timeout_ms: 30_000,
            idle_timeout_ms: 60_000,
        }
    }
}

impl StreamConfig {
    /// Set the endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Set both timeouts.
    pub fn with_timeouts_ms(mut self, request_timeout_ms: u64, idle_timeout_ms: u64) -> Self {
        self.request_timeout_ms = request_timeout_ms;
        self.idle_timeout_ms = idle_timeout_ms;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}
