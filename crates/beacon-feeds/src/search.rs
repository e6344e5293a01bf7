//! Debounced free-text search with a local fallback.
//!
//! Every edit bumps a monotonically increasing request token and cancels the
//! previously scheduled execution. Only after a quiet period of `debounce`
//! does the latest text go out, so a burst of keystrokes costs one request.
//! A response is applied only while its token is still the highest one
//! issued; anything older is dropped.
//!
//! Failures and timeouts never leave the search box spinning: a locally
//! built fallback set is shown instead and flagged with `used_fallback`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use beacon_core::{EngineError, FallbackEntry, Result, SearchConfig};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Request body sent to the search exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
}

/// One search hit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: Value,
}

impl From<FallbackEntry> for SearchResult {
    fn from(entry: FallbackEntry) -> Self {
        Self {
            title: entry.title,
            description: entry.description,
            metadata: entry.metadata,
        }
    }
}

/// Response body of the search exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub results: Vec<SearchResult>,
    /// Set by the backend when it rejects the query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The search slice read by the search UI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    pub request_token: u64,
    pub results: Vec<SearchResult>,
    pub loading: bool,
    pub used_fallback: bool,
    /// User-facing reason the fallback set is shown.
    pub error: Option<String>,
}

/// The search exchange.
#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse>;
}

/// Search over HTTP POST.
pub struct HttpSearchClient {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpSearchClient {
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

    pub fn from_config(config: &SearchConfig) -> Result<Self> {
        Self::new(config.endpoint.clone(), config.request_timeout())
    }
}

#[async_trait]
impl SearchClient for HttpSearchClient {
    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        debug!(endpoint = %self.endpoint, query = %request.query, "sending search request");

        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| EngineError::from(e).with_timeout(self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::from_http_status(status.as_u16(), &body));
        }

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| EngineError::from(e).with_timeout(self.timeout))?;
        match body.error {
            Some(message) => Err(EngineError::application(message)),
            None => Ok(body),
        }
    }
}

/// Debounce and fallback controller for the search box.
pub struct SearchController {
    inner: Arc<Inner>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    client: Arc<dyn SearchClient>,
    debounce: Duration,
    request_timeout: Duration,
    fallback: Vec<SearchResult>,
    filters: Mutex<Option<Value>>,
    latest_token: AtomicU64,
    closed: AtomicBool,
    state: watch::Sender<SearchQuery>,
    updates: mpsc::UnboundedSender<SearchQuery>,
}

impl SearchController {
    /// Create a controller and the receiver for its state updates.
    pub fn new(
        client: Arc<dyn SearchClient>,
        config: &SearchConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SearchQuery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::with_sender(client, config, tx), rx)
    }

    /// Create a controller that publishes into an existing channel.
    pub fn with_sender(
        client: Arc<dyn SearchClient>,
        config: &SearchConfig,
        updates: mpsc::UnboundedSender<SearchQuery>,
    ) -> Self {
        let (state, _) = watch::channel(SearchQuery::default());
        let inner = Inner {
            client,
            debounce: config.debounce(),
            request_timeout: config.request_timeout(),
            fallback: config.fallback.iter().cloned().map(SearchResult::from).collect(),
            filters: Mutex::new(None),
            latest_token: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            state,
            updates,
        };

        Self {
            inner: Arc::new(inner),
            pending: Mutex::new(None),
        }
    }

    /// Record a query edit and (re)schedule the search.
    ///
    /// Returns the request token assigned to this edit.
    pub async fn on_query_change(&self, text: impl Into<String>) -> u64 {
        let text = text.into();
        let token = self.inner.latest_token.fetch_add(1, Ordering::SeqCst) + 1;

        let mut pending = self.pending.lock().await;
        if let Some(previous) = pending.take() {
            previous.abort();
        }

        if self.inner.closed.load(Ordering::SeqCst) {
            return token;
        }

        if text.trim().is_empty() {
            self.inner.update(token, |state| {
                *state = SearchQuery {
                    text: text.clone(),
                    request_token: token,
                    ..SearchQuery::default()
                };
            });
            debug!(token, "search cleared");
            return token;
        }

        self.inner.update(token, |state| {
            state.text = text.clone();
            state.request_token = token;
        });

        let inner = Arc::clone(&self.inner);
        *pending = Some(tokio::spawn(async move { inner.execute(token, text).await }));
        token
    }

    /// Filters attached to subsequent requests.
    pub async fn set_filters(&self, filters: Option<Value>) {
        *self.inner.filters.lock().await = filters;
    }

    /// Current search state.
    pub fn state(&self) -> SearchQuery {
        self.inner.state.borrow().clone()
    }

    /// Watch the search state directly.
    pub fn subscribe(&self) -> watch::Receiver<SearchQuery> {
        self.inner.state.subscribe()
    }

    /// Highest token issued so far.
    pub fn latest_token(&self) -> u64 {
        self.inner.latest_token.load(Ordering::SeqCst)
    }

    /// Cancel any scheduled or in-flight search. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);

        let previous = self.pending.lock().await.take();
        if let Some(task) = previous {
            task.abort();
            let _ = task.await;
            info!("search controller shut down");
        }

        let token = self.latest_token();
        self.inner.update(token, |state| state.loading = false);
    }
}

impl Drop for SearchController {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.try_lock()
            && let Some(task) = pending.take()
        {
            task.abort();
        }
    }
}

impl Inner {
    fn is_current(&self, token: u64) -> bool {
        self.latest_token.load(Ordering::SeqCst) == token
    }

    /// Mutate the state only while `token` is the latest, publishing the
    /// result under the same lock so updates are delivered in order.
    fn update(&self, token: u64, f: impl FnOnce(&mut SearchQuery)) -> bool {
        self.state.send_if_modified(|state| {
            if !self.is_current(token) {
                return false;
            }
            f(state);
            let _ = self.updates.send(state.clone());
            true
        })
    }

    async fn execute(&self, token: u64, text: String) {
        tokio::time::sleep(self.debounce).await;
        if !self.update(token, |state| state.loading = true) {
            return;
        }

        let request = SearchRequest {
            query: text.clone(),
            filters: self.filters.lock().await.clone(),
        };

        debug!(token, query = %text, "executing search");
        let outcome = match tokio::time::timeout(self.request_timeout, self.client.search(&request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(EngineError::timeout(
                "search",
                self.request_timeout.as_millis() as u64,
            )),
        };

        let applied = match outcome {
            Ok(response) => self.update(token, |state| {
                state.results = response.results;
                state.loading = false;
                state.used_fallback = false;
                state.error = None;
            }),
            Err(err) => {
                warn!(token, query = %text, error = %err, "search failed, using fallback");
                let fallback = self.fallback_for(&text);
                self.update(token, |state| {
                    state.results = fallback;
                    state.loading = false;
                    state.used_fallback = true;
                    state.error = Some(err.friendly_message());
                })
            }
        };

        if !applied {
            debug!(token, "discarded stale search response");
        }
    }

    /// Local results for `query`, each marked as fallback.
    fn fallback_for(&self, query: &str) -> Vec<SearchResult> {
        let needle = query.trim().to_lowercase();
        let matches: Vec<SearchResult> = self
            .fallback
            .iter()
            .filter(|r| {
                r.title.to_lowercase().contains(&needle)
                    || r.description.to_lowercase().contains(&needle)
            })
            .cloned()
            .map(mark_fallback)
            .collect();

        if !matches.is_empty() {
            return matches;
        }

        vec![SearchResult {
            title: format!("No live results for \"{}\"", query.trim()),
            description: "Search is temporarily unavailable. Try again in a moment.".to_string(),
            metadata: json!({ "fallback": true }),
        }]
    }
}

fn mark_fallback(mut result: SearchResult) -> SearchResult {
    match result.metadata {
        Value::Object(ref mut map) => {
            map.insert("fallback".to_string(), Value::Bool(true));
        }
        _ => result.metadata = json!({ "fallback": true }),
    }
    result
}
