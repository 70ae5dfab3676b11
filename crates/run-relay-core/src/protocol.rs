//! Run Relay wire protocol.
//!
//! JSON text frames over a WebSocket. Clients send [`ClientCommand`]s; the
//! server sends either a bare [`RunMessage`] or a typed control envelope.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::message::RunMessage;

/// Protocol version implemented by this crate.
pub const PROTOCOL_VERSION: u32 = 1;

/// Client -> Server commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Start a new run for the session.
    Query { query: String },
    /// Request cooperative cancellation of the current run.
    Cancel,
    /// Heartbeat.
    Ping,
    /// Fetch up to `limit` most recent transcript messages.
    GetMessages {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },
    GetState,
}

/// Snapshot returned for `get_state`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub running: bool,
    pub step_number: u32,
    pub message_count: usize,
    pub subscribers: usize,
}

/// Server -> Client control envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    Pong,
    /// Unrecoverable without user action; surfaced, never retried.
    Error { message: String },
    State { state: SessionState },
    /// Reply to `get_messages`, oldest first.
    Messages { messages: Vec<RunMessage> },
}

/// Anything the server may send.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Message(Box<RunMessage>),
    Control(ControlFrame),
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Control(ControlFrame::Error {
            message: message.into(),
        })
    }
}

impl From<RunMessage> for ServerFrame {
    fn from(message: RunMessage) -> Self {
        ServerFrame::Message(Box::new(message))
    }
}

impl From<ControlFrame> for ServerFrame {
    fn from(frame: ControlFrame) -> Self {
        ServerFrame::Control(frame)
    }
}

impl Serialize for ServerFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ServerFrame::Message(message) => message.serialize(serializer),
            ServerFrame::Control(frame) => frame.serialize(serializer),
        }
    }
}

// Control envelopes always carry `type`; run messages never do.
impl<'de> Deserialize<'de> for ServerFrame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        if value.get("type").is_some() {
            serde_json::from_value(value)
                .map(ServerFrame::Control)
                .map_err(D::Error::custom)
        } else {
            serde_json::from_value(value)
                .map(|m| ServerFrame::Message(Box::new(m)))
                .map_err(D::Error::custom)
        }
    }
}
