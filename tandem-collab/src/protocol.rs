//! JSON wire protocol spoken between room members and the relay.
//!
//! One message object per WebSocket text frame:
//! ```text
//! { "type": "join" | "leave" | "presence" | "document:update" | "ping" | "pong",
//!   "roomId": string,
//!   "payload": <type-specific>,
//!   "timestamp": number (ms epoch) }
//! ```
//!
//! Payload shapes:
//!
//! | type | payload |
//! |------|---------|
//! | `join` | `{ user, presence }` |
//! | `leave` | `{ userId }` |
//! | `presence` | `{ userId, state }` |
//! | `document:update` | `{ documentId, update: number[] }` |
//! | `ping` / `pong` | `{ timestamp }` |

use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message types for the room protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// A member entered the room
    Join,
    /// A member left the room
    Leave,
    /// Cursor/selection awareness update
    Presence,
    /// Encoded CRDT update for one document
    #[serde(rename = "document:update")]
    DocumentUpdate,
    /// Heartbeat ping
    Ping,
    /// Heartbeat pong
    Pong,
    /// Any type this client does not understand
    #[serde(other)]
    Unknown,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Presence => "presence",
            Self::DocumentUpdate => "document:update",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Member identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl User {
    /// Create a user with a fresh random id.
    pub fn new(display_name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), display_name)
    }

    /// Create with explicit id (for testing and reconnecting clients)
    pub fn with_id(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            avatar_url: None,
        }
    }
}

/// Caret position inside a document, in UTF-16 code units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    pub offset: u32,
}

/// Selected range; `anchor` may be after `head`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    pub anchor: u32,
    pub head: u32,
}

/// Ephemeral awareness state of one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceState {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub last_seen_at: u64,
}

impl PresenceState {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            cursor: None,
            selection: None,
            last_seen_at: now_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub user: User,
    pub presence: PresenceState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeavePayload {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub user_id: String,
    pub state: PresenceState,
}

/// `update` travels as a JSON array of byte values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentUpdatePayload {
    pub document_id: String,
    pub update: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub timestamp: u64,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub room_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub timestamp: u64,
}

impl TransportMessage {
    /// Build a message with a typed payload, stamped with the current time.
    pub fn new<P: Serialize>(
        kind: MessageType,
        room_id: impl Into<String>,
        payload: &P,
    ) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            kind,
            room_id: room_id.into(),
            payload,
            timestamp: now_millis(),
        })
    }

    /// Create a join announcement.
    pub fn join(
        room_id: impl Into<String>,
        user: &User,
        presence: &PresenceState,
    ) -> Result<Self, ProtocolError> {
        let payload = JoinPayload {
            user: user.clone(),
            presence: presence.clone(),
        };
        Self::new(MessageType::Join, room_id, &payload)
    }

    /// Create a leave announcement.
    pub fn leave(room_id: impl Into<String>, user_id: &str) -> Result<Self, ProtocolError> {
        let payload = LeavePayload {
            user_id: user_id.to_string(),
        };
        Self::new(MessageType::Leave, room_id, &payload)
    }

    /// Create an awareness update.
    pub fn presence(
        room_id: impl Into<String>,
        state: &PresenceState,
    ) -> Result<Self, ProtocolError> {
        let payload = PresencePayload {
            user_id: state.user_id.clone(),
            state: state.clone(),
        };
        Self::new(MessageType::Presence, room_id, &payload)
    }

    /// Create a document update carrying encoded CRDT bytes.
    pub fn document_update(
        room_id: impl Into<String>,
        document_id: &str,
        update: Vec<u8>,
    ) -> Result<Self, ProtocolError> {
        let payload = DocumentUpdatePayload {
            document_id: document_id.to_string(),
            update,
        };
        Self::new(MessageType::DocumentUpdate, room_id, &payload)
    }

    /// Create a ping message.
    pub fn ping(room_id: impl Into<String>) -> Self {
        Self::heartbeat(MessageType::Ping, room_id.into())
    }

    /// Create a pong message.
    pub fn pong(room_id: impl Into<String>) -> Self {
        Self::heartbeat(MessageType::Pong, room_id.into())
    }

    fn heartbeat(kind: MessageType, room_id: String) -> Self {
        let timestamp = now_millis();
        Self {
            kind,
            room_id,
            payload: serde_json::json!({ "timestamp": timestamp }),
            timestamp,
        }
    }

    /// Serialize to wire text.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from wire text.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// Parse the payload as `P`.
    pub fn payload_as<P: DeserializeOwned>(&self) -> Result<P, ProtocolError> {
        P::deserialize(&self.payload).map_err(|e| ProtocolError::InvalidPayload {
            kind: self.kind,
            reason: e.to_string(),
        })
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// Frame parsed, but its payload does not match its type
    InvalidPayload { kind: MessageType, reason: String },
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidPayload { kind, reason } => {
                write!(f, "Invalid {kind} payload: {reason}")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
