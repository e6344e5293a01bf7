//! Per-source payload schemas.
//!
//! Polled endpoints return loosely shaped JSON. Each source declares a
//! [`SourceKind`] and its payload is validated here, once, at the boundary.
//! Optional fields take explicit defaults so downstream aggregation never has
//! to guess. An explicit `null` counts as absent, and an unrecognized
//! severity label is kept as [`Severity::Unknown`] rather than failing the
//! whole payload.

use beacon_core::{EngineError, Result, SourceKind};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A validated source payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourcePayload {
    Metrics(MetricsPayload),
    Insights(InsightsPayload),
    Records(RecordsPayload),
}

/// Metric readings, e.g. revenue or utilization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsPayload {
    #[serde(default)]
    pub metrics: Vec<Metric>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub value: f64,
    #[serde(default)]
    pub unit: Option<String>,
    /// Period-over-period change in percent.
    #[serde(default)]
    pub change_pct: Option<f64>,
}

/// Generated insights attached to a dashboard screen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InsightsPayload {
    #[serde(default)]
    pub insights: Vec<Insight>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub summary: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub severity: Severity,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Critical,
    /// A label this engine does not recognize, e.g. `"high"`.
    #[serde(other)]
    Unknown,
}

/// Arbitrary record lists (projects, tasks, channels).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordsPayload {
    #[serde(default)]
    pub items: Vec<Value>,
}

impl SourcePayload {
    /// Validate a raw response against the schema for `kind`.
    pub fn parse(kind: SourceKind, raw: Value) -> Result<Self> {
        let payload = match kind {
            SourceKind::Metrics => Self::Metrics(decode(kind, raw)?),
            SourceKind::Insights => Self::Insights(decode(kind, raw)?),
            SourceKind::Records => match raw {
                Value::Array(items) => Self::Records(RecordsPayload { items }),
                other => Self::Records(decode(kind, other)?),
            },
        };
        Ok(payload)
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Metrics(_) => SourceKind::Metrics,
            Self::Insights(_) => SourceKind::Insights,
            Self::Records(_) => SourceKind::Records,
        }
    }

    pub fn metrics(&self) -> &[Metric] {
        match self {
            Self::Metrics(p) => &p.metrics,
            _ => &[],
        }
    }

    pub fn insights(&self) -> &[Insight] {
        match self {
            Self::Insights(p) => &p.insights,
            _ => &[],
        }
    }

    pub fn items(&self) -> &[Value] {
        match self {
            Self::Records(p) => &p.items,
            _ => &[],
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn decode<T: serde::de::DeserializeOwned>(kind: SourceKind, raw: Value) -> Result<T> {
    if !raw.is_object() {
        return Err(EngineError::protocol(format!(
            "{} payload must be a JSON object",
            kind
        )));
    }
    serde_json::from_value(raw)
        .map_err(|e| EngineError::protocol(format!("{} payload rejected: {}", kind, e)))
}
