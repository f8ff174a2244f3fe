//! JSON wire protocol between drawing clients and the sync server.
//!
//! Every WebSocket text frame carries one event:
//! ```text
//! { "event": "<name>", "data": <payload> }
//!
//!  client ─► server   draw              WireOperation
//!                     request_history   { "room"?: String }
//!  server ─► client   draw              WireOperation (someone else's)
//!                     dispatch_history  [WireOperation] (ordered)
//!                     nack              { "room": String, "reason": String }
//! ```
//!
//! A missing or `null` payload on `request_history` means the default room.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::operation::{Operation, WireOperation};

/// Event names as they appear on the wire.
pub mod event {
    pub const DRAW: &str = "draw";
    pub const REQUEST_HISTORY: &str = "request_history";
    pub const DISPATCH_HISTORY: &str = "dispatch_history";
    pub const NACK: &str = "nack";
}

/// Payload of `request_history`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
}

impl HistoryRequest {
    pub fn for_room(room: impl Into<String>) -> Self {
        Self {
            room: Some(room.into()),
        }
    }
}

/// Frames a client sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Draw(WireOperation),
    RequestHistory(HistoryRequest),
}

/// Frames the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// An operation committed by another session.
    Draw(WireOperation),
    /// Ordered history of a room.
    DispatchHistory(Vec<WireOperation>),
    /// A request from this session could not be completed.
    Nack { room: String, reason: String },
}

#[derive(Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    data: Value,
}

impl ClientMessage {
    pub fn draw(op: impl Into<WireOperation>) -> Self {
        ClientMessage::Draw(op.into())
    }

    pub fn request_history(room: Option<String>) -> Self {
        ClientMessage::RequestHistory(HistoryRequest { room })
    }

    pub fn event(&self) -> &'static str {
        match self {
            ClientMessage::Draw(_) => event::DRAW,
            ClientMessage::RequestHistory(_) => event::REQUEST_HISTORY,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let frame: RawFrame = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        match frame.event.as_str() {
            event::DRAW => serde_json::from_value(frame.data)
                .map(ClientMessage::Draw)
                .map_err(|e| ProtocolError::Deserialization(e.to_string())),
            event::REQUEST_HISTORY if frame.data.is_null() => {
                Ok(ClientMessage::RequestHistory(HistoryRequest::default()))
            }
            event::REQUEST_HISTORY => serde_json::from_value(frame.data)
                .map(ClientMessage::RequestHistory)
                .map_err(|e| ProtocolError::Deserialization(e.to_string())),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }
}

impl ServerMessage {
    pub fn draw(op: &Operation) -> Self {
        ServerMessage::Draw(WireOperation::from(op))
    }

    pub fn dispatch_history(history: &[Operation]) -> Self {
        ServerMessage::DispatchHistory(history.iter().map(WireOperation::from).collect())
    }

    pub fn nack(room: impl Into<String>, reason: impl ToString) -> Self {
        ServerMessage::Nack {
            room: room.into(),
            reason: reason.to_string(),
        }
    }

    pub fn event(&self) -> &'static str {
        match self {
            ServerMessage::Draw(_) => event::DRAW,
            ServerMessage::DispatchHistory(_) => event::DISPATCH_HISTORY,
            ServerMessage::Nack { .. } => event::NACK,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Unknown event: {0:?}")]
    UnknownEvent(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,
}
