//! Transport for the streaming exchange.
//!
//! [`ChatTransport::open`] sends the query and returns the event stream.
//! Opening and reading are bounded separately by the caller, so the HTTP
//! client only carries a connect timeout; a whole-request timeout would cut
//! long answers off mid-stream.

use std::time::Duration;

use async_trait::async_trait;
use beacon_core::{EngineError, Result, StreamConfig};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::Serialize;
use tracing::{debug, trace};

use crate::events::StreamEvent;
use crate::sse::SseDecoder;

/// Stream of decoded events. Ends after the transport closes.
pub type EventStream = BoxStream<'static, Result<StreamEvent>>;

/// Sentinel some backends send after the last event.
const DONE_SENTINEL: &str = "[DONE]";

/// Opens one streaming exchange per query.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open(&self, query: &str) -> Result<EventStream>;
}

#[derive(Debug, Serialize)]
struct StreamRequest<'a> {
    query: &'a str,
}

/// Server-sent events over HTTP POST.
pub struct HttpChatTransport {
    client: reqwest::Client,
    endpoint: String,
    connect_timeout: Duration,
}

impl HttpChatTransport {
    pub fn new(endpoint: impl Into<String>, connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| EngineError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            connect_timeout,
        })
    }

    pub fn from_config(config: &StreamConfig) -> Result<Self> {
        Self::new(config.endpoint.clone(), config.request_timeout())
    }
}

#[async_trait]
impl ChatTransport for HttpChatTransport {
    async fn open(&self, query: &str) -> Result<EventStream> {
        debug!(endpoint = %self.endpoint, "opening assistant stream");

        let response = self
            .client
            .post(&self.endpoint)
            .header("accept", "text/event-stream")
            .json(&StreamRequest { query })
            .send()
            .await
            .map_err(|e| EngineError::from(e).with_timeout(self.connect_timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::from_http_status(status.as_u16(), &body));
        }

        let mut bytes = Box::pin(response.bytes_stream());
        let events = async_stream::stream! {
            let mut decoder = SseDecoder::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(EngineError::from(e));
                        return;
                    }
                };
                match decoder.push(&chunk) {
                    Ok(payloads) => {
                        for payload in payloads {
                            if let Some(event) = decode(&payload) {
                                yield event;
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
            match decoder.finish() {
                Ok(Some(payload)) => {
                    if let Some(event) = decode(&payload) {
                        yield event;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    yield Err(e);
                }
            }
        };

        Ok(events.boxed())
    }
}

fn decode(payload: &str) -> Option<Result<StreamEvent>> {
    let payload = payload.trim();
    if payload.is_empty() || payload == DONE_SENTINEL {
        return None;
    }
    trace!(payload, "stream event");
    Some(StreamEvent::parse(payload))
}
