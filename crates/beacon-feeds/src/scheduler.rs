//! Source registry and polling scheduler.
//!
//! Every registered [`DataSource`] gets its own polling task. A task fetches
//! immediately, then once per interval; ticks that come due while a fetch is
//! still outstanding are skipped, so a source never has two requests in
//! flight. Each fetch is bounded by the source's request timeout.
//!
//! Failures are contained: a failing source records the error in its own
//! slice, keeps its last good payload, and is retried at the normal cadence.
//! Sibling tasks share nothing but the update channel.
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use beacon_feeds::{PollingScheduler, source::fn_fetcher};
//!
//! # async fn example() -> beacon_core::Result<()> {
//! let (scheduler, mut updates) = PollingScheduler::new(3);
//! scheduler
//!     .register_source(
//!         "revenue",
//!         fn_fetcher(|| async { Ok(serde_json::json!([])) }),
//!         Duration::from_secs(5),
//!     )
//!     .await?;
//! scheduler.start().await;
//!
//! while let Some(slice) = updates.recv().await {
//!     println!("{} is {:?}", slice.id, slice.status);
//! }
//! scheduler.stop().await;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use beacon_core::config::DEFAULT_REQUEST_TIMEOUT_MS;
use beacon_core::{EngineError, Result, SourceConfig, SourceId, SourceKind, log_source_event};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::source::{DataSource, SourceFetcher, SourceSlice};

/// Handle returned by registration.
#[derive(Debug, Clone)]
pub struct SourceHandle {
    id: SourceId,
    refresh: Arc<Notify>,
}

impl SourceHandle {
    pub fn id(&self) -> &SourceId {
        &self.id
    }

    /// Ask for an out-of-band fetch.
    ///
    /// Dropped if a fetch for this source is already outstanding.
    pub fn refresh(&self) {
        self.refresh.notify_waiters();
    }
}

struct SourceEntry {
    state: Arc<Mutex<DataSource>>,
    refresh: Arc<Notify>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Owns N independent polled sources.
pub struct PollingScheduler {
    entries: Mutex<BTreeMap<SourceId, SourceEntry>>,
    updates: mpsc::UnboundedSender<SourceSlice>,
    degraded_after: u32,
    cancel: CancellationToken,
    running: AtomicBool,
    stopped: AtomicBool,
}

impl PollingScheduler {
    /// Create a scheduler and the receiver for its source updates.
    ///
    /// `degraded_after` is the number of consecutive failures after which a
    /// slice is flagged degraded (0 disables the flag).
    pub fn new(degraded_after: u32) -> (Self, mpsc::UnboundedReceiver<SourceSlice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::with_sender(degraded_after, tx), rx)
    }

    /// Create a scheduler that publishes into an existing channel.
    pub fn with_sender(degraded_after: u32, updates: mpsc::UnboundedSender<SourceSlice>) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            updates,
            degraded_after,
            cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Register a source with the default timeout and record schema.
    pub async fn register_source(
        &self,
        id: impl Into<SourceId>,
        fetcher: Arc<dyn SourceFetcher>,
        interval: Duration,
    ) -> Result<SourceHandle> {
        let source = DataSource::new(
            id.into(),
            SourceKind::Records,
            fetcher,
            interval,
            Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        );
        self.register(source).await
    }

    /// Register a source described by configuration.
    pub async fn register_config(
        &self,
        config: &SourceConfig,
        fetcher: Arc<dyn SourceFetcher>,
    ) -> Result<SourceHandle> {
        let source = DataSource::new(
            config.id.clone(),
            config.kind,
            fetcher,
            config.interval(),
            config.request_timeout(),
        );
        self.register(source).await
    }

    /// Register a fully specified source.
    ///
    /// If the scheduler is running the source fetches immediately; otherwise
    /// its first fetch happens when [`start`](Self::start) runs.
    pub async fn register(&self, source: DataSource) -> Result<SourceHandle> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(EngineError::validation("scheduler has been stopped"));
        }
        if source.interval().is_zero() {
            return Err(EngineError::validation(format!(
                "source {} interval must be positive",
                source.id()
            )));
        }
        if source.request_timeout().is_zero() {
            return Err(EngineError::validation(format!(
                "source {} request timeout must be positive",
                source.id()
            )));
        }

        let mut entries = self.entries.lock().await;
        let id = source.id().clone();
        if entries.contains_key(&id) {
            return Err(EngineError::validation(format!("source {} already registered", id)));
        }

        let _ = self.updates.send(source.slice(self.degraded_after));

        let refresh = Arc::new(Notify::new());
        let mut entry = SourceEntry {
            state: Arc::new(Mutex::new(source)),
            refresh: Arc::clone(&refresh),
            cancel: self.cancel.child_token(),
            task: None,
        };

        if self.running.load(Ordering::SeqCst) {
            entry.task = Some(self.spawn_poller(&entry));
        }

        info!(source_id = %id, "registered source");
        entries.insert(id.clone(), entry);

        Ok(SourceHandle { id, refresh })
    }

    /// Remove a source, cancelling its timer and any in-flight fetch.
    pub async fn unregister_source(&self, id: &SourceId) -> bool {
        let entry = self.entries.lock().await.remove(id);
        match entry {
            Some(entry) => {
                entry.cancel.cancel();
                if let Some(task) = entry.task {
                    let _ = task.await;
                }
                info!(source_id = %id, "unregistered source");
                true
            }
            None => false,
        }
    }

    /// Start polling every registered source. Idempotent.
    pub async fn start(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            warn!("start() called on a stopped scheduler");
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut entries = self.entries.lock().await;
        for entry in entries.values_mut() {
            if entry.task.is_none() {
                entry.task = Some(self.spawn_poller(entry));
            }
        }
        info!(sources = entries.len(), "polling scheduler started");
    }

    /// Cancel every timer and abort every in-flight fetch.
    ///
    /// Idempotent and safe to call from several places; when it returns no
    /// polling task is left running.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = {
            let mut entries = self.entries.lock().await;
            entries.values_mut().filter_map(|e| e.task.take()).collect()
        };

        if tasks.is_empty() {
            return;
        }

        let count = tasks.len();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("polling task ended abnormally: {}", e);
            }
        }
        info!(tasks = count, "polling scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of polling tasks still alive.
    pub async fn active_tasks(&self) -> usize {
        self.entries
            .lock()
            .await
            .values()
            .filter(|e| e.task.as_ref().is_some_and(|t| !t.is_finished()))
            .count()
    }

    /// Current view of every source, ordered by id.
    pub async fn sources(&self) -> Vec<SourceSlice> {
        let entries = self.entries.lock().await;
        let mut slices = Vec::with_capacity(entries.len());
        for entry in entries.values() {
            slices.push(entry.state.lock().await.slice(self.degraded_after));
        }
        slices
    }

    /// Current view of one source.
    pub async fn source(&self, id: &SourceId) -> Option<SourceSlice> {
        let state = {
            let entries = self.entries.lock().await;
            Arc::clone(&entries.get(id)?.state)
        };
        let slice = state.lock().await.slice(self.degraded_after);
        Some(slice)
    }

    fn spawn_poller(&self, entry: &SourceEntry) -> JoinHandle<()> {
        let poller = Poller {
            state: Arc::clone(&entry.state),
            refresh: Arc::clone(&entry.refresh),
            cancel: entry.cancel.clone(),
            updates: self.updates.clone(),
            degraded_after: self.degraded_after,
        };
        tokio::spawn(poller.run())
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The per-source polling loop.
struct Poller {
    state: Arc<Mutex<DataSource>>,
    refresh: Arc<Notify>,
    cancel: CancellationToken,
    updates: mpsc::UnboundedSender<SourceSlice>,
    degraded_after: u32,
}

impl Poller {
    async fn run(self) {
        let (id, interval, request_timeout, fetcher) = {
            let source = self.state.lock().await;
            (
                source.id().clone(),
                source.interval(),
                source.request_timeout(),
                source.fetcher(),
            )
        };

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.refresh.notified() => {
                    debug!(source_id = %id, "manual refresh");
                }
            }

            if !self.begin().await {
                continue;
            }
            log_source_event!(id, "loading");

            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    let mut source = self.state.lock().await;
                    source.abort_fetch();
                    self.publish(&source);
                    log_source_event!(id, "aborted");
                    break;
                }
                result = tokio::time::timeout(request_timeout, fetcher.fetch()) => match result {
                    Ok(outcome) => outcome,
                    Err(_) => Err(EngineError::timeout(
                        format!("fetching {}", id),
                        request_timeout.as_millis() as u64,
                    )),
                },
            };

            {
                let mut source = self.state.lock().await;
                source.complete_fetch(outcome);
                match source.last_error() {
                    Some(error) if source.status() == crate::source::SourceStatus::Error => {
                        warn!(
                            source_id = %id,
                            failures = source.consecutive_failures(),
                            error,
                            "source fetch failed"
                        );
                    }
                    _ => log_source_event!(id, "fetched"),
                }
                self.publish(&source);
            }

            if started.elapsed() >= interval {
                // A tick came due while the fetch was outstanding; drop it.
                ticker.reset();
                debug!(source_id = %id, "skipped tick during slow fetch");
            }
        }

        debug!(source_id = %id, "poller exited");
    }

    async fn begin(&self) -> bool {
        let mut source = self.state.lock().await;
        if !source.begin_fetch() {
            return false;
        }
        self.publish(&source);
        true
    }

    fn publish(&self, source: &DataSource) {
        let _ = self.updates.send(source.slice(self.degraded_after));
    }
}
