//! # beacon-core
//!
//! Core errors, configuration, and logging shared by the Beacon crates.
//!
//! This crate provides:
//! - [`EngineError`] - The engine-wide error taxonomy
//! - [`config`] - YAML configuration for sources, search, and chat
//! - [`logging`] - Tracing setup for hosts that want Beacon's log layout
//! - [`types`] - Shared identifiers
//!
//! ## Example
//!
//! ```no_run
//! use beacon_core::{EngineConfig, logging};
//!
//! fn main() -> beacon_core::Result<()> {
//!     let _guard = logging::init_logging(None, false)?;
//!     let config = EngineConfig::from_file("beacon.yaml")?;
//!     tracing::info!(sources = config.sources.len(), "configuration loaded");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::{EngineConfig, FallbackEntry, SearchConfig, SourceConfig, StreamConfig};
pub use error::{EngineError, ErrorKind, Result};
pub use logging::{LogGuard, init_logging};
pub use types::{SourceId, SourceKind};
