//! Shared type definitions used across Beacon crates.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a polled data source.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    /// Create a new source id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SourceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Payload schema a polled source is validated against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// `{"metrics": [{"name", "value", ...}]}`
    Metrics,
    /// `{"insights": [{"title", ...}]}`
    Insights,
    /// `{"items": [...]}` or a bare JSON array.
    #[default]
    Records,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Metrics => "metrics",
            Self::Insights => "insights",
            Self::Records => "records",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_id_serializes_as_string() {
        let id = SourceId::new("revenue");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"revenue\"");
        assert_eq!(id.to_string(), "revenue");
    }

    #[test]
    fn test_source_kind_parsing() {
        let kind: SourceKind = serde_json::from_str("\"metrics\"").unwrap();
        assert_eq!(kind, SourceKind::Metrics);
        assert_eq!(SourceKind::default(), SourceKind::Records);
    }
}
