//! Caller-owned engine wiring every producer to the aggregator.
//!
//! ```no_run
//! use beacon::{DashboardEngine, EngineConfig};
//!
//! # async fn example() -> beacon_core::Result<()> {
//! let config = EngineConfig::from_file("beacon.yaml")?;
//! let engine = DashboardEngine::from_config(config).await?;
//! engine.start().await;
//!
//! let mut snapshots = engine.subscribe();
//! while snapshots.changed().await.is_ok() {
//!     let snapshot = snapshots.borrow_and_update().clone();
//!     println!("v{} healthy {:.0}%", snapshot.version, snapshot.derived.healthy_pct);
//! }
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use beacon_chat::{ChatSlice, ChatTransport, HttpChatTransport, MessageId, StreamingSessionManager};
use beacon_core::{EngineConfig, EngineError, Result, SourceId};
use beacon_feeds::{
    HttpSearchClient, HttpSourceFetcher, PollingScheduler, SearchClient, SearchController,
    SearchQuery, SourceFetcher, SourceHandle, SourceSlice,
};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::{DashboardSnapshot, SliceUpdate, StateAggregator};

/// Builds a [`DashboardEngine`], with optional injected collaborators.
///
/// Sources without an injected fetcher are fetched over HTTP from their
/// configured endpoint; the same holds for search and chat.
pub struct DashboardEngineBuilder {
    config: EngineConfig,
    fetchers: HashMap<SourceId, Arc<dyn SourceFetcher>>,
    transport: Option<Arc<dyn ChatTransport>>,
    search_client: Option<Arc<dyn SearchClient>>,
}

impl DashboardEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            fetchers: HashMap::new(),
            transport: None,
            search_client: None,
        }
    }

    /// Use `fetcher` for the configured source `id`.
    pub fn with_fetcher(mut self, id: impl Into<SourceId>, fetcher: Arc<dyn SourceFetcher>) -> Self {
        self.fetchers.insert(id.into(), fetcher);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn ChatTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_search_client(mut self, client: Arc<dyn SearchClient>) -> Self {
        self.search_client = Some(client);
        self
    }

    /// Validate the configuration, register every source and start the
    /// aggregator. Polling begins with [`DashboardEngine::start`].
    pub async fn build(mut self) -> Result<DashboardEngine> {
        self.config.validate()?;

        let (source_tx, source_rx) = mpsc::unbounded_channel();
        let (chat_tx, chat_rx) = mpsc::unbounded_channel();
        let (search_tx, search_rx) = mpsc::unbounded_channel();

        let scheduler = PollingScheduler::with_sender(self.config.degraded_after, source_tx);
        let mut handles = HashMap::new();
        for source in &self.config.sources {
            let fetcher: Arc<dyn SourceFetcher> = match self.fetchers.remove(&source.id) {
                Some(fetcher) => fetcher,
                None => Arc::new(HttpSourceFetcher::from_config(source)?),
            };
            let handle = scheduler.register_config(source, fetcher).await?;
            handles.insert(source.id.clone(), handle);
        }
        for id in self.fetchers.keys() {
            warn!(source_id = %id, "fetcher supplied for unconfigured source");
        }

        let transport: Arc<dyn ChatTransport> = match self.transport {
            Some(transport) => transport,
            None => {
                require_endpoint("chat", &self.config.chat.endpoint)?;
                Arc::new(HttpChatTransport::from_config(&self.config.chat)?)
            }
        };
        let chat = StreamingSessionManager::with_sender(transport, &self.config.chat, chat_tx);

        let search_client: Arc<dyn SearchClient> = match self.search_client {
            Some(client) => client,
            None => {
                require_endpoint("search", &self.config.search.endpoint)?;
                Arc::new(HttpSearchClient::from_config(&self.config.search)?)
            }
        };
        let search = SearchController::with_sender(search_client, &self.config.search, search_tx);

        let aggregator = StateAggregator::new();
        let snapshots = aggregator.subscribe();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_aggregator(
            aggregator,
            Receivers {
                sources: source_rx,
                chat: chat_rx,
                search: search_rx,
            },
            cancel.clone(),
        ));

        info!(sources = handles.len(), "dashboard engine built");

        Ok(DashboardEngine {
            scheduler,
            chat,
            search,
            handles,
            snapshots,
            aggregator: Mutex::new(Some(task)),
            cancel,
            shut_down: AtomicBool::new(false),
        })
    }
}

fn require_endpoint(name: &str, endpoint: &str) -> Result<()> {
    if endpoint.trim().is_empty() {
        return Err(EngineError::config(format!(
            "{} endpoint is required when no {} client is supplied",
            name, name
        )));
    }
    Ok(())
}

/// Owns the scheduler, chat manager, search controller and aggregator.
pub struct DashboardEngine {
    scheduler: PollingScheduler,
    chat: StreamingSessionManager,
    search: SearchController,
    handles: HashMap<SourceId, SourceHandle>,
    snapshots: watch::Receiver<Arc<DashboardSnapshot>>,
    aggregator: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    shut_down: AtomicBool,
}

impl DashboardEngine {
    pub fn builder(config: EngineConfig) -> DashboardEngineBuilder {
        DashboardEngineBuilder::new(config)
    }

    /// Build an engine that talks HTTP to every configured endpoint.
    pub async fn from_config(config: EngineConfig) -> Result<Self> {
        DashboardEngineBuilder::new(config).build().await
    }

    /// Start polling. Idempotent.
    pub async fn start(&self) {
        self.scheduler.start().await;
    }

    /// Ask the assistant; see [`StreamingSessionManager::submit_query`].
    pub async fn submit_query(&self, text: &str) -> Result<MessageId> {
        self.chat.submit_query(text).await
    }

    /// Feed a search box edit; returns its request token.
    pub async fn on_query_change(&self, text: impl Into<String>) -> u64 {
        self.search.on_query_change(text).await
    }

    /// Request an out-of-band fetch of one source.
    pub fn refresh(&self, id: &SourceId) -> bool {
        match self.handles.get(id) {
            Some(handle) => {
                handle.refresh();
                true
            }
            None => false,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<DashboardSnapshot>> {
        self.snapshots.clone()
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<DashboardSnapshot> {
        self.snapshots.borrow().clone()
    }

    /// The search slice, read directly by the search UI.
    pub fn search_state(&self) -> watch::Receiver<SearchQuery> {
        self.search.subscribe()
    }

    pub fn scheduler(&self) -> &PollingScheduler {
        &self.scheduler
    }

    pub fn chat(&self) -> &StreamingSessionManager {
        &self.chat
    }

    pub fn search(&self) -> &SearchController {
        &self.search
    }

    /// Stop every producer, then drain the aggregator. Idempotent.
    pub async fn shutdown(&self) {
        let first = !self.shut_down.swap(true, Ordering::SeqCst);

        self.scheduler.stop().await;
        self.chat.teardown().await;
        self.search.shutdown().await;

        self.cancel.cancel();
        let task = self.aggregator.lock().await.take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!("aggregator task ended abnormally: {}", e);
        }

        if first {
            info!(version = self.snapshot().version, "dashboard engine shut down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl Drop for DashboardEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Receivers {
    sources: mpsc::UnboundedReceiver<SourceSlice>,
    chat: mpsc::UnboundedReceiver<ChatSlice>,
    search: mpsc::UnboundedReceiver<SearchQuery>,
}

impl Receivers {
    fn try_next(&mut self) -> Option<SliceUpdate> {
        if let Ok(slice) = self.sources.try_recv() {
            return Some(SliceUpdate::Source(slice));
        }
        if let Ok(slice) = self.chat.try_recv() {
            return Some(SliceUpdate::Chat(slice));
        }
        if let Ok(query) = self.search.try_recv() {
            return Some(SliceUpdate::Search(query));
        }
        None
    }
}

async fn run_aggregator(
    mut aggregator: StateAggregator,
    mut rx: Receivers,
    cancel: CancellationToken,
) {
    loop {
        let update = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(slice) = rx.sources.recv() => SliceUpdate::Source(slice),
            Some(slice) = rx.chat.recv() => SliceUpdate::Chat(slice),
            Some(query) = rx.search.recv() => SliceUpdate::Search(query),
            else => break,
        };
        aggregator.apply(update);
    }

    // Producers are stopped by now; fold in what they published last.
    let mut drained = 0usize;
    while let Some(update) = rx.try_next() {
        aggregator.apply(update);
        drained += 1;
    }
    debug!(drained, version = aggregator.snapshot().version, "aggregator stopped");
}
