//! Streaming assistant sessions for Beacon.
//!
//! A [`StreamingSessionManager`] owns one [`ChatSession`] and at most one
//! open stream to the assistant. Answers arrive as typed [`StreamEvent`]s
//! over server-sent events and are assembled into the session's messages.

pub mod events;
pub mod manager;
pub mod session;
pub mod sse;
pub mod transport;

pub use events::{DataResult, StreamEvent};
pub use manager::{ChatSlice, StreamHandle, StreamingSessionManager};
pub use session::{
    ChatSession, ChatState, INTERRUPTED_MESSAGE, Message, MessageId, MessageStatus, Role,
    StreamId, StructuredPayload,
};
pub use sse::SseDecoder;
pub use transport::{ChatTransport, EventStream, HttpChatTransport};
