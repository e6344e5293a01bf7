//! # beacon-feeds
//!
//! Request/response producers for the Beacon dashboard engine.
//!
//! This crate provides:
//! - [`PollingScheduler`] - Independent per-source polling with failure isolation
//! - [`SourcePayload`] - Per-source schema validation (metrics, insights, records)
//! - [`SearchController`] - Debounced search with stale-response discard and fallback
//!
//! Both producers publish their slices over an unbounded channel; neither
//! reads the other's state.

pub mod payload;
pub mod scheduler;
pub mod search;
pub mod source;

pub use payload::{Insight, Metric, SourcePayload};
pub use scheduler::{PollingScheduler, SourceHandle};
pub use search::{
    HttpSearchClient, SearchClient, SearchController, SearchQuery, SearchRequest, SearchResponse,
    SearchResult,
};
pub use source::{DataSource, HttpSourceFetcher, SourceFetcher, SourceSlice, SourceStatus, fn_fetcher};
