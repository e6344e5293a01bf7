//! State aggregator.
//!
//! Folds the slices published by the polling scheduler, the chat manager and
//! the search controller into one immutable, versioned [`DashboardSnapshot`].
//! The aggregator is the only writer of the snapshot; each producer owns a
//! disjoint part of it.

use std::collections::BTreeMap;
use std::sync::Arc;

use beacon_chat::ChatSlice;
use beacon_core::SourceId;
use beacon_feeds::{SearchQuery, SourceSlice, SourceStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::trace;

/// One producer's new slice.
#[derive(Debug, Clone)]
pub enum SliceUpdate {
    Source(SourceSlice),
    Chat(ChatSlice),
    Search(SearchQuery),
}

impl SliceUpdate {
    fn label(&self) -> &'static str {
        match self {
            Self::Source(_) => "source",
            Self::Chat(_) => "chat",
            Self::Search(_) => "search",
        }
    }
}

/// Source counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub idle: usize,
    pub loading: usize,
    pub ok: usize,
    pub error: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.idle + self.loading + self.ok + self.error
    }
}

/// Values derived from the slices. Absent or degraded inputs count as zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DerivedAggregates {
    pub status_counts: StatusCounts,
    pub degraded: usize,
    /// Sources in error that still show their last good payload.
    pub stale: usize,
    /// Share of sources whose last fetch succeeded, 0.0 to 100.0.
    pub healthy_pct: f64,
    /// Metric values summed by name across every metrics source.
    pub metric_totals: BTreeMap<String, f64>,
    /// Insights across sources and the latest assistant answer.
    pub insight_count: usize,
    pub record_count: usize,
    pub last_fetched_at: Option<DateTime<Utc>>,
}

impl DerivedAggregates {
    pub fn compute(sources: &BTreeMap<SourceId, SourceSlice>, chat: &ChatSlice) -> Self {
        let mut derived = Self::default();

        for slice in sources.values() {
            match slice.status {
                SourceStatus::Idle => derived.status_counts.idle += 1,
                SourceStatus::Loading => derived.status_counts.loading += 1,
                SourceStatus::Ok => derived.status_counts.ok += 1,
                SourceStatus::Error => derived.status_counts.error += 1,
            }
            if slice.degraded {
                derived.degraded += 1;
            }
            if slice.is_stale() {
                derived.stale += 1;
            }
            if let Some(at) = slice.last_fetched_at {
                derived.last_fetched_at = Some(derived.last_fetched_at.map_or(at, |prev| prev.max(at)));
            }

            let Some(data) = &slice.data else {
                continue;
            };
            for metric in data.metrics() {
                let total = derived.metric_totals.entry(metric.name.clone()).or_insert(0.0);
                if metric.value.is_finite() {
                    *total += metric.value;
                }
            }
            derived.insight_count += data.insights().len();
            derived.record_count += data.items().len();
        }

        if let Some(payload) = chat.latest_payload() {
            derived.insight_count += payload.insights.len();
        }

        let total = derived.status_counts.total();
        derived.healthy_pct = if total == 0 {
            0.0
        } else {
            derived.status_counts.ok as f64 * 100.0 / total as f64
        };

        derived
    }
}

/// Immutable aggregate view. Newer versions supersede older ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DashboardSnapshot {
    pub sources: BTreeMap<SourceId, SourceSlice>,
    pub chat: ChatSlice,
    pub search: SearchQuery,
    pub derived: DerivedAggregates,
    pub version: u64,
}

impl DashboardSnapshot {
    pub fn source(&self, id: &str) -> Option<&SourceSlice> {
        self.sources.get(&SourceId::from(id))
    }
}

/// Sole writer of the dashboard snapshot.
pub struct StateAggregator {
    current: Arc<DashboardSnapshot>,
    publisher: watch::Sender<Arc<DashboardSnapshot>>,
}

impl Default for StateAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl StateAggregator {
    pub fn new() -> Self {
        let current = Arc::new(DashboardSnapshot::default());
        let (publisher, _) = watch::channel(Arc::clone(&current));
        Self { current, publisher }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<DashboardSnapshot>> {
        self.publisher.subscribe()
    }

    pub fn snapshot(&self) -> Arc<DashboardSnapshot> {
        Arc::clone(&self.current)
    }

    /// Build and publish the next snapshot.
    pub fn apply(&mut self, update: SliceUpdate) -> Arc<DashboardSnapshot> {
        let label = update.label();
        let mut next = DashboardSnapshot::clone(&self.current);

        match update {
            SliceUpdate::Source(mut slice) => {
                // An error never blanks a slot that had data.
                if slice.status == SourceStatus::Error
                    && slice.data.is_none()
                    && let Some(previous) = self.current.sources.get(&slice.id)
                {
                    slice.data = previous.data.clone();
                }
                next.sources.insert(slice.id.clone(), slice);
            }
            SliceUpdate::Chat(chat) => next.chat = chat,
            SliceUpdate::Search(search) => next.search = search,
        }

        next.derived = DerivedAggregates::compute(&next.sources, &next.chat);
        next.version = self.current.version + 1;

        let next = Arc::new(next);
        self.current = Arc::clone(&next);
        self.publisher.send_replace(Arc::clone(&next));
        trace!(version = next.version, slice = label, "published snapshot");
        next
    }
}
