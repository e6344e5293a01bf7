//! Chat session state machine.
//!
//! `Idle → Awaiting → Streaming → {Completed | Errored} → Idle`
//!
//! A terminal state stays visible until the session is settled, either by
//! [`ChatSession::settle`] or by the next [`ChatSession::begin_exchange`],
//! which settles before moving to `Awaiting`.
//!
//! [`ChatSession::apply_event`] is the only place stream events touch the
//! session. It checks that the event belongs to the active stream and that
//! the stream has not already terminated, so a superseded or finished
//! exchange can never write into a message again.
//!
//! Chunks are joined verbatim: content is the plain concatenation of every
//! chunk in arrival order, with no separator inserted and no whitespace
//! trimmed. `["Revenue", " grew", " 12%."]` assembles to `"Revenue grew 12%."`.

use beacon_core::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::{DataResult, StreamEvent};

pub type MessageId = u64;
pub type StreamId = u64;

/// Message shown when a stream fails without a server-supplied reason.
pub const INTERRUPTED_MESSAGE: &str =
    "Sorry, the assistant connection was interrupted. Please try again.";

/// Separator placed between partial content and an appended error text.
const ERROR_SEPARATOR: &str = "\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatState {
    #[default]
    Idle,
    Awaiting,
    Streaming,
    Completed,
    Errored,
}

impl ChatState {
    /// True while a stream is open or being opened.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Awaiting | Self::Streaming)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Placeholder waiting for the stream to open.
    Pending,
    Streaming,
    Complete,
    Errored,
    /// Superseded or torn down mid-stream; content kept as-is.
    Cancelled,
}

/// Structured part of an assistant message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredPayload {
    pub sources: Vec<Value>,
    pub insights: Vec<Value>,
    pub visualizations: Vec<Value>,
    pub query_type: Option<String>,
}

impl StructuredPayload {
    /// Fold a `data` result in. Lists accumulate; `query_type` is replaced
    /// when the result carries one.
    pub fn merge(&mut self, result: DataResult) {
        self.sources.extend(result.sources);
        self.insights.extend(result.insights);
        self.visualizations.extend(result.visualizations);
        if result.query_type.is_some() {
            self.query_type = result.query_type;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub structured_payload: Option<StructuredPayload>,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
}

impl Message {
    fn new(id: MessageId, role: Role, content: String, status: MessageStatus) -> Self {
        Self {
            id,
            role,
            content,
            structured_payload: None,
            created_at: Utc::now(),
            status,
        }
    }

    /// Frozen messages never change again.
    pub fn is_frozen(&self) -> bool {
        matches!(
            self.status,
            MessageStatus::Complete | MessageStatus::Errored | MessageStatus::Cancelled
        )
    }
}

/// Outcome of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The stream stays open.
    Continue,
    /// The event terminated the exchange.
    Finished,
}

/// Stateful wrapper around the conversation with the assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub messages: Vec<Message>,
    pub state: ChatState,
    pub active_stream: Option<StreamId>,
    active_message: Option<MessageId>,
    next_message_id: MessageId,
}

impl ChatSession {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            messages: Vec::new(),
            state: ChatState::Idle,
            active_stream: None,
            active_message: None,
            next_message_id: 1,
        }
    }

    /// The assistant message the active stream writes into.
    pub fn active_message(&self) -> Option<&Message> {
        let id = self.active_message?;
        self.messages.iter().find(|m| m.id == id)
    }

    /// Structured payload of the most recent assistant message that has one.
    pub fn latest_payload(&self) -> Option<&StructuredPayload> {
        self.messages
            .iter()
            .rev()
            .filter(|m| m.role == Role::Assistant)
            .find_map(|m| m.structured_payload.as_ref())
    }

    /// Append the user message and an empty assistant placeholder bound to
    /// `stream`, moving to `Awaiting`.
    ///
    /// The caller must have retired any previous stream first.
    pub fn begin_exchange(&mut self, query: &str, stream: StreamId) -> Result<MessageId> {
        let query = query.trim();
        if query.is_empty() {
            return Err(EngineError::validation("query must not be empty"));
        }
        self.settle();
        if self.state != ChatState::Idle {
            return Err(EngineError::protocol(format!(
                "stream {:?} is still active",
                self.active_stream
            )));
        }

        let user_id = self.allocate_id();
        self.messages.push(Message::new(
            user_id,
            Role::User,
            query.to_string(),
            MessageStatus::Complete,
        ));

        let reply_id = self.allocate_id();
        self.messages.push(Message::new(
            reply_id,
            Role::Assistant,
            String::new(),
            MessageStatus::Pending,
        ));

        self.state = ChatState::Awaiting;
        self.active_stream = Some(stream);
        self.active_message = Some(reply_id);
        Ok(reply_id)
    }

    /// Move a finished exchange (`Completed` or `Errored`) back to `Idle`.
    ///
    /// Returns false if there was nothing to settle.
    pub fn settle(&mut self) -> bool {
        if matches!(self.state, ChatState::Completed | ChatState::Errored) {
            self.state = ChatState::Idle;
            true
        } else {
            false
        }
    }

    /// Record that `stream` opened. Returns false if it is not the active one.
    pub fn mark_streaming(&mut self, stream: StreamId) -> bool {
        if self.active_stream != Some(stream) || self.state != ChatState::Awaiting {
            return false;
        }
        self.state = ChatState::Streaming;
        if let Some(message) = self.active_message_mut() {
            message.status = MessageStatus::Streaming;
        }
        true
    }

    /// Apply one event from `stream`.
    pub fn apply_event(&mut self, stream: StreamId, event: StreamEvent) -> Result<Applied> {
        if self.active_stream != Some(stream) {
            return Err(EngineError::protocol(format!(
                "{} event from inactive stream {}",
                event.kind(),
                stream
            )));
        }
        if self.state == ChatState::Awaiting {
            self.mark_streaming(stream);
        }
        if self.state != ChatState::Streaming {
            return Err(EngineError::protocol(format!(
                "{} event while session is {:?}",
                event.kind(),
                self.state
            )));
        }

        let message = self
            .active_message_mut()
            .filter(|m| !m.is_frozen())
            .ok_or_else(|| EngineError::protocol("no writable assistant message"))?;

        match event {
            StreamEvent::Chunk { content } => {
                message.content.push_str(&content);
                Ok(Applied::Continue)
            }
            StreamEvent::Data { result } => {
                message
                    .structured_payload
                    .get_or_insert_with(StructuredPayload::default)
                    .merge(result);
                Ok(Applied::Continue)
            }
            StreamEvent::End => {
                message.status = MessageStatus::Complete;
                self.finish(ChatState::Completed);
                Ok(Applied::Finished)
            }
            StreamEvent::Error { message: text } => {
                write_error(message, &text);
                self.finish(ChatState::Errored);
                Ok(Applied::Finished)
            }
        }
    }

    /// Terminate `stream` with a locally supplied error text.
    ///
    /// Returns false if `stream` is no longer active.
    pub fn fail(&mut self, stream: StreamId, text: &str) -> bool {
        if self.active_stream != Some(stream) {
            return false;
        }
        if let Some(message) = self.active_message_mut() {
            write_error(message, text);
        }
        self.finish(ChatState::Errored);
        true
    }

    /// Freeze the message of a cancelled `stream` as-is and return to `Idle`.
    ///
    /// Returns false if `stream` already terminated.
    pub fn cancel_stream(&mut self, stream: StreamId) -> bool {
        if self.active_stream != Some(stream) {
            return false;
        }
        if let Some(message) = self.active_message_mut() {
            message.status = MessageStatus::Cancelled;
        }
        self.finish(ChatState::Idle);
        true
    }

    fn finish(&mut self, state: ChatState) {
        self.state = state;
        self.active_stream = None;
        self.active_message = None;
    }

    fn active_message_mut(&mut self) -> Option<&mut Message> {
        let id = self.active_message?;
        self.messages.iter_mut().find(|m| m.id == id)
    }

    fn allocate_id(&mut self) -> MessageId {
        let id = self.next_message_id;
        self.next_message_id += 1;
        id
    }
}

/// Replace empty content with `text`, otherwise append it after a blank line.
fn write_error(message: &mut Message, text: &str) {
    if message.content.is_empty() {
        message.content = text.to_string();
    } else {
        message.content.push_str(ERROR_SEPARATOR);
        message.content.push_str(text);
    }
    message.status = MessageStatus::Errored;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chunk(text: &str) -> StreamEvent {
        StreamEvent::Chunk {
            content: text.to_string(),
        }
    }

    fn open_session(stream: StreamId) -> (ChatSession, MessageId) {
        let mut session = ChatSession::new("s-1");
        let id = session.begin_exchange("revenue drivers", stream).unwrap();
        (session, id)
    }

    #[test]
    fn test_begin_exchange_appends_pair() {
        let (session, reply) = open_session(1);
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].role, Role::User);
        assert_eq!(session.messages[0].content, "revenue drivers");
        assert_eq!(session.messages[1].id, reply);
        assert_eq!(session.messages[1].content, "");
        assert_eq!(session.state, ChatState::Awaiting);
        assert_eq!(session.active_stream, Some(1));
    }

    #[test]
    fn test_empty_query_rejected() {
        let mut session = ChatSession::new("s-1");
        let err = session.begin_exchange("  \n", 1).unwrap_err();
        assert_eq!(err.kind(), beacon_core::ErrorKind::Validation);
        assert!(session.messages.is_empty());
        assert_eq!(session.state, ChatState::Idle);
    }

    #[test]
    fn test_chunks_join_verbatim() {
        let (mut session, _) = open_session(1);
        for part in ["Revenue", " grew", " 12%."] {
            assert_eq!(session.apply_event(1, chunk(part)).unwrap(), Applied::Continue);
        }
        assert_eq!(session.state, ChatState::Streaming);
        assert_eq!(session.apply_event(1, StreamEvent::End).unwrap(), Applied::Finished);

        let reply = &session.messages[1];
        assert_eq!(reply.content, "Revenue grew 12%.");
        assert_eq!(reply.status, MessageStatus::Complete);
        assert_eq!(session.state, ChatState::Completed);
        assert!(session.active_stream.is_none());
    }

    #[test]
    fn test_join_keeps_whitespace_as_sent() {
        let (mut session, _) = open_session(1);
        for part in ["a ", " b", "", "c\n"] {
            session.apply_event(1, chunk(part)).unwrap();
        }
        assert_eq!(session.messages[1].content, "a  bc\n");
    }

    #[test]
    fn test_data_merges_without_touching_content() {
        let (mut session, _) = open_session(1);
        session.apply_event(1, chunk("Hi")).unwrap();
        session
            .apply_event(
                1,
                StreamEvent::Data {
                    result: DataResult {
                        insights: vec![json!({"title": "Margin up"})],
                        query_type: Some("trend".into()),
                        ..Default::default()
                    },
                },
            )
            .unwrap();
        session
            .apply_event(
                1,
                StreamEvent::Data {
                    result: DataResult {
                        insights: vec![json!({"title": "Churn flat"})],
                        visualizations: vec![json!({"type": "line"})],
                        ..Default::default()
                    },
                },
            )
            .unwrap();

        let reply = &session.messages[1];
        assert_eq!(reply.content, "Hi");
        let payload = reply.structured_payload.as_ref().unwrap();
        assert_eq!(payload.insights.len(), 2);
        assert_eq!(payload.visualizations.len(), 1);
        assert_eq!(payload.query_type.as_deref(), Some("trend"));
        assert_eq!(session.latest_payload(), Some(payload));
    }

    #[test]
    fn test_error_event_replaces_empty_content() {
        let (mut session, _) = open_session(1);
        session
            .apply_event(
                1,
                StreamEvent::Error {
                    message: "model overloaded".into(),
                },
            )
            .unwrap();
        assert_eq!(session.messages[1].content, "model overloaded");
        assert_eq!(session.messages[1].status, MessageStatus::Errored);
        assert_eq!(session.state, ChatState::Errored);
    }

    #[test]
    fn test_error_event_appends_to_partial_content() {
        let (mut session, _) = open_session(1);
        session.apply_event(1, chunk("Revenue")).unwrap();
        session
            .apply_event(
                1,
                StreamEvent::Error {
                    message: "model overloaded".into(),
                },
            )
            .unwrap();
        assert_eq!(session.messages[1].content, "Revenue\n\nmodel overloaded");
    }

    #[test]
    fn test_events_after_terminal_rejected() {
        let (mut session, _) = open_session(1);
        session.apply_event(1, StreamEvent::End).unwrap();
        let err = session.apply_event(1, chunk("late")).unwrap_err();
        assert_eq!(err.kind(), beacon_core::ErrorKind::Protocol);
        assert_eq!(session.messages[1].content, "");
    }

    #[test]
    fn test_events_from_other_stream_rejected() {
        let (mut session, _) = open_session(2);
        assert!(session.apply_event(1, chunk("stale")).is_err());
        assert_eq!(session.messages[1].content, "");
        assert_eq!(session.state, ChatState::Awaiting);
    }

    #[test]
    fn test_cancel_freezes_message() {
        let (mut session, _) = open_session(1);
        session.apply_event(1, chunk("partial")).unwrap();
        assert!(session.cancel_stream(1));
        assert!(!session.cancel_stream(1));

        assert_eq!(session.messages[1].status, MessageStatus::Cancelled);
        assert!(session.messages[1].is_frozen());
        assert_eq!(session.state, ChatState::Idle);
        assert!(session.apply_event(1, chunk(" more")).is_err());
        assert_eq!(session.messages[1].content, "partial");
    }

    #[test]
    fn test_fail_synthesizes_message() {
        let (mut session, _) = open_session(1);
        assert!(session.fail(1, INTERRUPTED_MESSAGE));
        assert_eq!(session.messages[1].content, INTERRUPTED_MESSAGE);
        assert_eq!(session.state, ChatState::Errored);
        assert!(!session.fail(1, INTERRUPTED_MESSAGE));
    }

    #[test]
    fn test_new_exchange_after_completion() {
        let (mut session, _) = open_session(1);
        session.apply_event(1, StreamEvent::End).unwrap();
        let reply = session.begin_exchange("and costs?", 2).unwrap();
        assert_eq!(reply, 4);
        assert_eq!(session.messages.len(), 4);
        assert_eq!(session.state, ChatState::Awaiting);
    }

    #[test]
    fn test_terminal_state_settles_to_idle() {
        let (mut session, reply) = open_session(1);
        session
            .apply_event(1, StreamEvent::Error { message: "quota".into() })
            .unwrap();
        assert_eq!(session.state, ChatState::Errored);

        assert!(session.settle());
        assert_eq!(session.state, ChatState::Idle);
        assert!(!session.settle());
        let message = session.messages.iter().find(|m| m.id == reply).unwrap();
        assert_eq!(message.status, MessageStatus::Errored);
        assert_eq!(message.content, "quota");

        // Settling never touches a live exchange.
        session.begin_exchange("retry", 2).unwrap();
        assert!(!session.settle());
        assert_eq!(session.state, ChatState::Awaiting);
    }

    #[test]
    fn test_begin_while_active_refused() {
        let (mut session, _) = open_session(1);
        assert!(session.begin_exchange("again", 2).is_err());
        assert_eq!(session.messages.len(), 2);
    }
}
