//! Typed events of the streaming exchange.
//!
//! Each server-sent event carries one JSON object tagged by `type`:
//!
//! ```text
//! {"type": "chunk", "content": "Revenue"}
//! {"type": "data", "result": {"insights": [...], "visualizations": [...], "queryType": "trend"}}
//! {"type": "end"}
//! {"type": "error", "message": "model overloaded"}
//! ```

use beacon_core::{EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One event of the streaming exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Next piece of the answer text.
    Chunk { content: String },
    /// Structured result attached to the answer.
    Data {
        #[serde(default)]
        result: DataResult,
    },
    /// Normal termination.
    End,
    /// Server-reported failure; terminates the stream.
    Error {
        #[serde(default = "default_error_message")]
        message: String,
    },
}

fn default_error_message() -> String {
    "The assistant reported an error.".to_string()
}

impl StreamEvent {
    /// Decode one event payload, rejecting anything off-schema.
    pub fn parse(data: &str) -> Result<Self> {
        serde_json::from_str(data)
            .map_err(|e| EngineError::protocol(format!("malformed stream event: {}", e)))
    }

    /// True for `end` and `error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End | Self::Error { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Chunk { .. } => "chunk",
            Self::Data { .. } => "data",
            Self::End => "end",
            Self::Error { .. } => "error",
        }
    }
}

/// Structured part of an answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataResult {
    #[serde(default)]
    pub insights: Vec<Value>,
    #[serde(default)]
    pub visualizations: Vec<Value>,
    #[serde(default, alias = "query_type")]
    pub query_type: Option<String>,
    #[serde(default)]
    pub sources: Vec<Value>,
}
