//! # beacon
//!
//! Client-side synchronization engine for business-intelligence dashboards.
//!
//! Three independent producers feed one immutable view model:
//! - polled data sources ([`beacon_feeds::PollingScheduler`])
//! - the streaming assistant ([`beacon_chat::StreamingSessionManager`])
//! - debounced search ([`beacon_feeds::SearchController`])
//!
//! The [`StateAggregator`] folds their slices into a versioned
//! [`DashboardSnapshot`]; [`DashboardEngine`] wires everything together under
//! caller-owned start and shutdown.
//!
//! ## Example
//!
//! ```no_run
//! use beacon::{DashboardEngine, EngineConfig, SourceConfig, SourceKind};
//!
//! # async fn example() -> beacon::Result<()> {
//! let _guard = beacon::init_logging(None, false)?;
//!
//! let config = EngineConfig::default().with_source(
//!     SourceConfig::new("kpis", "https://bi.example.com/api/kpis", 30_000)
//!         .with_kind(SourceKind::Metrics),
//! );
//! let engine = DashboardEngine::from_config(config).await?;
//! engine.start().await;
//! engine.submit_query("revenue drivers").await?;
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod engine;

pub use aggregator::{DashboardSnapshot, DerivedAggregates, SliceUpdate, StateAggregator, StatusCounts};
pub use engine::{DashboardEngine, DashboardEngineBuilder};

pub use beacon_core::{
    EngineConfig, EngineError, ErrorKind, FallbackEntry, LogGuard, Result, SearchConfig,
    SourceConfig, SourceId, SourceKind, StreamConfig, init_logging,
};
