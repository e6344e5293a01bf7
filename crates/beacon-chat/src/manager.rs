//! Streaming session manager.
//!
//! Owns the single [`ChatSession`] and at most one open stream. Each stream
//! is driven by its own pump task, which applies events strictly in arrival
//! order through [`ChatSession::apply_event`].
//!
//! Submitting a query while a stream is open retires the old stream first:
//! its handle is closed, its pump task is awaited, and only then is its
//! message frozen and the new stream opened. Two streams can therefore never
//! write into shared state at the same time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use beacon_core::{EngineError, Result, StreamConfig};
use chrono::Utc;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, trace, warn};

use crate::session::{
    Applied, ChatSession, ChatState, INTERRUPTED_MESSAGE, Message, MessageId, StreamId,
    StructuredPayload,
};
use crate::transport::ChatTransport;

/// Published view of the chat session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatSlice {
    /// `None` until the first query creates the session.
    pub session: Option<ChatSession>,
}

impl ChatSlice {
    pub fn state(&self) -> ChatState {
        self.session.as_ref().map(|s| s.state).unwrap_or_default()
    }

    pub fn messages(&self) -> &[Message] {
        self.session.as_ref().map(|s| s.messages.as_slice()).unwrap_or(&[])
    }

    pub fn latest_payload(&self) -> Option<&StructuredPayload> {
        self.session.as_ref()?.latest_payload()
    }
}

/// Handle to one open stream.
///
/// Clones share the same close state: whichever clone calls
/// [`close`](Self::close) first releases the stream, every later call is a
/// no-op.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    id: StreamId,
    cancel: CancellationToken,
    closed: Arc<AtomicBool>,
    open_streams: Arc<AtomicUsize>,
}

impl StreamHandle {
    fn open(id: StreamId, parent: &CancellationToken, open_streams: Arc<AtomicUsize>) -> Self {
        open_streams.fetch_add(1, Ordering::SeqCst);
        Self {
            id,
            cancel: parent.child_token(),
            closed: Arc::new(AtomicBool::new(false)),
            open_streams,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Close the stream. Returns true only for the call that closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        self.open_streams.fetch_sub(1, Ordering::SeqCst);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

struct ActiveStream {
    handle: StreamHandle,
    task: JoinHandle<()>,
}

struct Shared {
    session: Mutex<Option<ChatSession>>,
    updates: mpsc::UnboundedSender<ChatSlice>,
}

impl Shared {
    fn publish(&self, session: &ChatSession) {
        let _ = self.updates.send(ChatSlice {
            session: Some(session.clone()),
        });
    }
}

/// Owns the chat session and its single live stream.
pub struct StreamingSessionManager {
    transport: Arc<dyn ChatTransport>,
    open_timeout: Duration,
    idle_timeout: Duration,
    shared: Arc<Shared>,
    active: Mutex<Option<ActiveStream>>,
    open_streams: Arc<AtomicUsize>,
    next_stream: AtomicU64,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl StreamingSessionManager {
    /// Create a manager and the receiver for its session updates.
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        config: &StreamConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ChatSlice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::with_sender(transport, config, tx), rx)
    }

    /// Create a manager that publishes into an existing channel.
    pub fn with_sender(
        transport: Arc<dyn ChatTransport>,
        config: &StreamConfig,
        updates: mpsc::UnboundedSender<ChatSlice>,
    ) -> Self {
        Self {
            transport,
            open_timeout: config.request_timeout(),
            idle_timeout: config.idle_timeout(),
            shared: Arc::new(Shared {
                session: Mutex::new(None),
                updates,
            }),
            active: Mutex::new(None),
            open_streams: Arc::new(AtomicUsize::new(0)),
            next_stream: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Start a new exchange, retiring any open one first.
    ///
    /// Returns the id of the assistant message the answer streams into.
    pub async fn submit_query(&self, text: &str) -> Result<MessageId> {
        let query = text.trim();
        if query.is_empty() {
            return Err(EngineError::validation("query must not be empty"));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::validation("chat session has been torn down"));
        }

        let mut active = self.active.lock().await;
        if self.retire(active.take()).await {
            debug!("superseded open stream");
        }

        let stream_id = self.next_stream.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = StreamHandle::open(stream_id, &self.cancel, Arc::clone(&self.open_streams));

        let message_id = {
            let mut guard = self.shared.session.lock().await;
            let session = guard.get_or_insert_with(|| {
                let id = format!("chat-{}", Utc::now().timestamp_millis());
                info!(session_id = %id, "chat session created");
                ChatSession::new(id)
            });
            match session.begin_exchange(query, stream_id) {
                Ok(id) => {
                    self.shared.publish(session);
                    id
                }
                Err(e) => {
                    handle.close();
                    return Err(e);
                }
            }
        };

        let pump = Pump {
            shared: Arc::clone(&self.shared),
            transport: Arc::clone(&self.transport),
            handle: handle.clone(),
            query: query.to_string(),
            open_timeout: self.open_timeout,
            idle_timeout: self.idle_timeout,
        };
        let task = tokio::spawn(pump.run());
        *active = Some(ActiveStream { handle, task });

        info!(stream_id, message_id, "submitted query");
        Ok(message_id)
    }

    /// Close the open stream, if any, freezing its message as-is.
    ///
    /// Returns true if a stream was open. Idempotent.
    pub async fn cancel(&self) -> bool {
        let mut active = self.active.lock().await;
        self.retire(active.take()).await
    }

    /// Cancel the open stream and refuse further queries. Idempotent.
    pub async fn teardown(&self) {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        self.cancel().await;
        self.cancel.cancel();
        if first {
            info!("chat session torn down");
        }
    }

    /// Current view of the session.
    pub async fn session(&self) -> ChatSlice {
        ChatSlice {
            session: self.shared.session.lock().await.clone(),
        }
    }

    /// Number of streams opened and not yet released.
    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    pub fn is_torn_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn retire(&self, active: Option<ActiveStream>) -> bool {
        let Some(ActiveStream { handle, task }) = active else {
            return false;
        };

        let closed = handle.close();
        if let Err(e) = task.await {
            warn!(stream_id = handle.id(), "stream pump ended abnormally: {}", e);
        }

        let mut guard = self.shared.session.lock().await;
        if let Some(session) = guard.as_mut()
            && session.cancel_stream(handle.id())
        {
            info!(stream_id = handle.id(), "cancelled open stream");
            self.shared.publish(session);
            return true;
        }
        closed
    }
}

impl Drop for StreamingSessionManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Exit {
    Finished,
    Cancelled,
    Failed(EngineError),
}

/// Drives one stream from open to release.
struct Pump {
    shared: Arc<Shared>,
    transport: Arc<dyn ChatTransport>,
    handle: StreamHandle,
    query: String,
    open_timeout: Duration,
    idle_timeout: Duration,
}

impl Pump {
    async fn run(self) {
        let stream_id = self.handle.id();

        match self.drive().await {
            Exit::Finished => debug!(stream_id, "stream finished"),
            Exit::Cancelled => debug!(stream_id, "stream cancelled"),
            Exit::Failed(err) => {
                warn!(stream_id, error = %err, "assistant stream failed");
                let mut guard = self.shared.session.lock().await;
                if !self.handle.is_closed()
                    && let Some(session) = guard.as_mut()
                    && session.fail(stream_id, INTERRUPTED_MESSAGE)
                {
                    self.shared.publish(session);
                }
            }
        }

        self.handle.close();
    }

    async fn drive(&self) -> Exit {
        let stream_id = self.handle.id();

        let opened = tokio::select! {
            biased;
            _ = self.handle.cancelled() => return Exit::Cancelled,
            opened = tokio::time::timeout(self.open_timeout, self.transport.open(&self.query)) => opened,
        };
        let mut events = match opened {
            Ok(Ok(events)) => events,
            Ok(Err(e)) => return Exit::Failed(e),
            Err(_) => {
                return Exit::Failed(EngineError::timeout(
                    "opening assistant stream",
                    self.open_timeout.as_millis() as u64,
                ));
            }
        };

        {
            let mut guard = self.shared.session.lock().await;
            if self.handle.is_closed() {
                return Exit::Cancelled;
            }
            let Some(session) = guard.as_mut() else {
                return Exit::Cancelled;
            };
            if !session.mark_streaming(stream_id) {
                return Exit::Cancelled;
            }
            self.shared.publish(session);
        }
        debug!(stream_id, "stream open");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.handle.cancelled() => return Exit::Cancelled,
                next = tokio::time::timeout(self.idle_timeout, events.next()) => next,
            };

            let event = match next {
                Ok(Some(Ok(event))) => event,
                Ok(Some(Err(e))) => return Exit::Failed(e),
                Ok(None) => {
                    return Exit::Failed(EngineError::transport(
                        "stream closed before a terminal event",
                    ));
                }
                Err(_) => {
                    return Exit::Failed(EngineError::timeout(
                        "waiting for the next stream event",
                        self.idle_timeout.as_millis() as u64,
                    ));
                }
            };

            let kind = event.kind();
            let applied = {
                let mut guard = self.shared.session.lock().await;
                if self.handle.is_closed() {
                    return Exit::Cancelled;
                }
                let Some(session) = guard.as_mut() else {
                    return Exit::Cancelled;
                };
                let applied = session.apply_event(stream_id, event);
                if applied.is_ok() {
                    self.shared.publish(session);
                }
                applied
            };

            match applied {
                Ok(Applied::Continue) => trace!(stream_id, kind, "applied event"),
                Ok(Applied::Finished) => {
                    info!(stream_id, kind, "stream terminated by server");
                    return Exit::Finished;
                }
                Err(e) => return Exit::Failed(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_close_is_idempotent() {
        let parent = CancellationToken::new();
        let open = Arc::new(AtomicUsize::new(0));
        let handle = StreamHandle::open(1, &parent, Arc::clone(&open));
        let other = handle.clone();
        assert_eq!(open.load(Ordering::SeqCst), 1);

        assert!(handle.close());
        assert!(!other.close());
        assert!(!handle.close());
        assert!(other.is_closed());
        assert!(handle.cancel.is_cancelled());
        assert_eq!(open.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_parent_cancel_reaches_handle() {
        let parent = CancellationToken::new();
        let handle = StreamHandle::open(1, &parent, Arc::new(AtomicUsize::new(0)));
        parent.cancel();
        assert!(handle.cancel.is_cancelled());
        assert!(!handle.is_closed());
    }

    #[test]
    fn test_empty_slice_defaults() {
        let slice = ChatSlice::default();
        assert_eq!(slice.state(), ChatState::Idle);
        assert!(slice.messages().is_empty());
        assert!(slice.latest_payload().is_none());
    }
}
