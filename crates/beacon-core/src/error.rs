//! Error types for Beacon operations.
//!
//! This module defines [`EngineError`], the single error enum shared by every
//! producer in the engine. Each variant falls into one of four categories
//! ([`ErrorKind`]) that decide how far a failure may travel:
//!
//! - validation failures are rejected before any network call
//! - transport and protocol failures are contained to the source, stream, or
//!   search request that produced them
//! - application failures are reported by the backend itself

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;

/// Failure category used for propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Empty or invalid input, rejected before any network call.
    Validation,
    /// Network failure or timeout.
    Transport,
    /// Malformed or out-of-order payload from a backend.
    Protocol,
    /// The backend explicitly reported failure.
    Application,
    /// Local configuration or environment problem.
    Config,
}

/// Comprehensive error type for all engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    // =========================================================================
    // Input Errors
    // =========================================================================
    /// Input rejected before any request was made
    #[error("Invalid input: {message}")]
    Validation { message: String },

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Network failure (connection refused, reset, DNS, 5xx)
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Request exceeded its bounded wait; the limit is `None` when unknown
    #[error("{operation} timed out{}", .timeout_ms.map(|ms| format!(" after {ms}ms")).unwrap_or_default())]
    Timeout {
        operation: String,
        timeout_ms: Option<u64>,
    },

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Payload could not be decoded or arrived out of order
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // =========================================================================
    // Application Errors
    // =========================================================================
    /// Backend reported a failure in its response
    #[error("Application error: {message}")]
    Application { message: String },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration is invalid or could not be parsed
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// I/O error with context
    #[error("I/O error {operation}: {path}")]
    Io {
        operation: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: Some(timeout_ms),
        }
    }

    /// Record the limit on a timeout that was raised without one.
    pub fn with_timeout(self, limit: Duration) -> Self {
        match self {
            Self::Timeout {
                operation,
                timeout_ms: None,
            } => Self::Timeout {
                operation,
                timeout_ms: Some(limit.as_millis() as u64),
            },
            other => other,
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create an application error
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io(operation: impl Into<String>, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            path: path.into(),
            source,
        }
    }

    /// Classify an HTTP status code returned by a backend.
    ///
    /// Timeouts, throttling, and server errors are transport failures: the
    /// request may succeed on the next cycle. Any other non-success status is
    /// the backend refusing the request.
    pub fn from_http_status(status: u16, body: &str) -> Self {
        let body = body.trim();
        match status {
            408 | 429 | 500..=599 => Self::transport(format!("HTTP {}: {}", status, body)),
            _ => Self::application(format!("HTTP {}: {}", status, body)),
        }
    }

    // =========================================================================
    // Error classification helpers
    // =========================================================================

    /// Returns the propagation category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Transport { .. } | Self::Timeout { .. } => ErrorKind::Transport,
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::Application { .. } => ErrorKind::Application,
            Self::Config { .. } | Self::Io { .. } => ErrorKind::Config,
        }
    }

    /// Returns true for network failures and timeouts.
    pub fn is_transport(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    /// Returns true if this error came from a bounded wait expiring.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if retrying at the normal cadence may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transport | ErrorKind::Protocol | ErrorKind::Application
        )
    }

    /// Get a user-facing message suitable for a status badge.
    pub fn friendly_message(&self) -> String {
        match self {
            Self::Validation { message } => message.clone(),
            Self::Timeout {
                timeout_ms: Some(ms),
                ..
            } => format!("Request timed out after {}ms. Showing last known data.", ms),
            Self::Timeout { timeout_ms: None, .. } => {
                "Request timed out. Showing last known data.".to_string()
            }
            Self::Transport { .. } => {
                "Could not reach the data service. Showing last known data.".to_string()
            }
            Self::Protocol { .. } => "Received an unexpected response from the service.".to_string(),
            Self::Application { message } => message.clone(),
            _ => format!("Error: {}", self),
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                operation: "HTTP request".to_string(),
                timeout_ms: None,
            }
        } else if err.is_decode() {
            Self::protocol(err.to_string())
        } else if let Some(status) = err.status() {
            Self::from_http_status(status.as_u16(), &err.to_string())
        } else {
            Self::transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::protocol(format!("invalid JSON: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_classification() {
        assert_eq!(EngineError::from_http_status(500, "boom").kind(), ErrorKind::Transport);
        assert_eq!(EngineError::from_http_status(503, "").kind(), ErrorKind::Transport);
        assert_eq!(EngineError::from_http_status(429, "slow down").kind(), ErrorKind::Transport);
        assert_eq!(EngineError::from_http_status(404, "missing").kind(), ErrorKind::Application);
        assert_eq!(EngineError::from_http_status(400, "bad").kind(), ErrorKind::Application);
    }

    #[test]
    fn test_http_status_message_includes_code() {
        let err = EngineError::from_http_status(502, " bad gateway \n");
        assert_eq!(err.to_string(), "Transport error: HTTP 502: bad gateway");
    }

    #[test]
    fn test_timeout_is_transport() {
        let err = EngineError::timeout("search", 5000);
        assert!(err.is_transport());
        assert!(err.is_timeout());
        assert!(err.is_retryable());
        assert!(err.friendly_message().contains("5000ms"));
    }

    #[test]
    fn test_timeout_without_limit_omits_number() {
        let err = EngineError::Timeout {
            operation: "HTTP request".to_string(),
            timeout_ms: None,
        };
        assert_eq!(err.to_string(), "HTTP request timed out");
        assert_eq!(err.friendly_message(), "Request timed out. Showing last known data.");

        let err = err.with_timeout(Duration::from_secs(10));
        assert_eq!(err.to_string(), "HTTP request timed out after 10000ms");

        // A known limit is never overwritten.
        let err = EngineError::timeout("search", 5000).with_timeout(Duration::from_secs(1));
        assert!(err.friendly_message().contains("5000ms"));
    }

    #[test]
    fn test_validation_not_retryable() {
        let err = EngineError::validation("query must not be empty");
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!err.is_retryable());
        assert_eq!(err.friendly_message(), "query must not be empty");
    }

    #[test]
    fn test_json_error_is_protocol() {
        let err: EngineError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }
}
