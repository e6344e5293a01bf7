//! Logging infrastructure for Beacon.
//!
//! Every component logs through `tracing` with structured fields. The engine
//! is embedded in a host application, so [`init_logging`] is optional: a host
//! with its own subscriber never calls it and still receives every event.
//! When called, it writes daily-rotated JSON lines under
//! `~/.beacon/logs/` and a compact copy to stderr.
//!
//! ## Example
//!
//! ```no_run
//! use beacon_core::logging;
//!
//! let _guard = logging::init_logging(None, false).expect("logging init");
//!
//! tracing::info!("engine started");
//! tracing::debug!(source_id = "revenue", "polling");
//! ```

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    EnvFilter, Layer, fmt, layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt,
};

use crate::error::{EngineError, Result};

/// File name prefix of the rolling log; the appender adds a date suffix.
pub const LOG_FILE_PREFIX: &str = "beacon.log";

/// Flushes buffered file output when dropped.
///
/// Hold it for as long as the engine runs.
pub struct LogGuard {
    _file_guard: WorkerGuard,
}

/// Install Beacon's subscriber: JSON lines to `log_dir` plus compact stderr.
///
/// `log_dir` defaults to [`default_log_dir`]. `verbose` lowers the default
/// level from INFO to DEBUG; `RUST_LOG` replaces the default filter entirely.
/// Fails with [`EngineError::Config`] if a global subscriber already exists.
pub fn init_logging(log_dir: Option<PathBuf>, verbose: bool) -> Result<LogGuard> {
    let log_dir = log_dir.map_or_else(default_log_dir, Ok)?;
    let (writer, file_guard) = rolling_writer(&log_dir)?;

    tracing_subscriber::registry()
        .with(engine_filter(verbose))
        .with(json_file_layer(writer))
        .with(console_layer(verbose))
        .try_init()
        .map_err(|e| EngineError::config(format!("logging already initialized: {}", e)))?;

    tracing::debug!(log_dir = %log_dir.display(), verbose, "logging initialized");
    Ok(LogGuard {
        _file_guard: file_guard,
    })
}

fn rolling_writer(log_dir: &Path) -> Result<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(log_dir)
        .map_err(|e| EngineError::io("creating log directory", log_dir, e))?;
    let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    Ok(tracing_appender::non_blocking(appender))
}

// Targets match by prefix, so `beacon` covers every `beacon_*` crate.
fn engine_filter(verbose: bool) -> EnvFilter {
    let level = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("beacon={level}")))
}

fn json_file_layer<S>(writer: NonBlocking) -> impl Layer<S> + Send + Sync
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .json()
        .with_writer(writer)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false)
}

fn console_layer<S>(verbose: bool) -> impl Layer<S> + Send + Sync
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(verbose)
        .with_line_number(verbose)
}

/// Initialize minimal console-only logging for tests.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

/// Get the default log directory path (`~/.beacon/logs/`).
pub fn default_log_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| EngineError::config("could not determine home directory"))?;

    Ok(home.join(".beacon").join("logs"))
}

/// Log a polled source transition with a consistent target.
///
/// ```ignore
/// log_source_event!("revenue", "fetched");
/// log_source_event!("revenue", "failed", error = %err);
/// ```
#[macro_export]
macro_rules! log_source_event {
    ($source_id:expr, $event:expr) => {
        tracing::debug!(
            target: "beacon::source",
            source_id = %$source_id,
            event = $event,
            "source event"
        )
    };
    ($source_id:expr, $event:expr, $($field:tt)*) => {
        tracing::debug!(
            target: "beacon::source",
            source_id = %$source_id,
            event = $event,
            $($field)*,
            "source event"
        )
    };
}
