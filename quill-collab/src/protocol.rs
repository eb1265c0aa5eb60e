//! Wire protocol for document channels.
//!
//! Every message travels as a JSON text frame so it survives text-only
//! broadcast transports. Binary payloads (state vectors, updates, presence
//! records) are base64-encoded:
//!
//! ```text
//! {"event":"sync-update","sender":"<session uuid>","payload":"<base64>"}
//! ```
//!
//! | event             | payload                          |
//! |-------------------|----------------------------------|
//! | `sync-request`    | sender's encoded state vector    |
//! | `sync-update`     | encoded document update          |
//! | `presence-update` | encoded presence records         |
//!
//! [`Frame`] is the envelope spoken between [`WsTransport`](crate::transport::ws::WsTransport)
//! and [`HubServer`](crate::hub::HubServer): join/leave a channel and
//! broadcast a [`SyncMessage`] on it.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    /// "Send me what I lack": carries the sender's state vector.
    SyncRequest,
    /// Document delta, either a reply to a request or a live edit.
    SyncUpdate,
    /// Presence records of the sessions that changed.
    PresenceUpdate,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::SyncRequest => "sync-request",
            MessageType::SyncUpdate => "sync-update",
            MessageType::PresenceUpdate => "presence-update",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message on a document channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub event: MessageType,
    /// Session that produced the message, used to drop our own echoes.
    pub sender: Uuid,
    /// Base64 of the binary payload.
    pub payload: String,
}

impl SyncMessage {
    fn with_payload(event: MessageType, sender: Uuid, bytes: &[u8]) -> Self {
        Self {
            event,
            sender,
            payload: STANDARD.encode(bytes),
        }
    }

    /// Create a sync request carrying the sender's state vector.
    pub fn sync_request(sender: Uuid, state_vector: &[u8]) -> Self {
        Self::with_payload(MessageType::SyncRequest, sender, state_vector)
    }

    /// Create a document update message.
    pub fn sync_update(sender: Uuid, update: &[u8]) -> Self {
        Self::with_payload(MessageType::SyncUpdate, sender, update)
    }

    /// Create a presence update message.
    pub fn presence_update(sender: Uuid, records: &[u8]) -> Self {
        Self::with_payload(MessageType::PresenceUpdate, sender, records)
    }

    /// Decode the base64 payload.
    pub fn payload_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        STANDARD
            .decode(self.payload.as_bytes())
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Envelope between a WebSocket client and the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Frame {
    /// Client → hub: subscribe this connection to `channel`.
    Join { channel: String },
    /// Hub → client: subscription confirmed.
    Joined { channel: String },
    /// Client → hub: unsubscribe.
    Leave { channel: String },
    /// Both directions: a message on `channel`.
    Broadcast { channel: String, message: SyncMessage },
    /// Hub → client: the previous frame was rejected.
    Error { reason: String },
}

impl Frame {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidPayload(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidPayload(e) => write!(f, "Invalid payload: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
