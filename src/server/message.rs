use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Sender id used for every server-originated message.
pub const SYSTEM_SENDER: &str = "system";

/// Represents different types of errors that can occur when processing messages
#[derive(Error, Debug)]
pub enum MessageError {
    /// Error when an inbound frame is not valid JSON of the expected shape.
    #[error("Invalid frame format: {0}")]
    InvalidFrame(String),

    /// Error when message serialization or deserialization fails.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Error when the message content exceeds the allowed limit.
    #[error("Message too long")]
    MessageTooLong,
}

/// Delivery state of an outbound [`Message`].
///
/// Transitions are monotonic: `pending -> delivered` or `pending -> error`,
/// and a settled message is never reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Error,
}

/// Severity level carried by system messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Debug,
}

/// Type-specific payload of a message; the variant name is the wire-level
/// `type` tag, and variant fields sit flat next to the common fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageKind {
    Chat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
    },
    System {
        severity: Severity,
    },
    File {
        file_name: String,
        file_type: String,
        file_size: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_url: Option<String>,
    },
    Error,
}

/// A structured message exchanged with clients.
///
/// Serializes to the flat wire format
/// `{"id","type","content","sender_id","timestamp","status","metadata", ...}`
/// where the subtype fields of [`MessageKind`] hang off the `type` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(flatten)]
    pub kind: MessageKind,
    pub content: String,
    pub sender_id: String,
    pub timestamp: DateTime<Utc>,
    status: DeliveryStatus,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Message {
    fn new(kind: MessageKind, sender_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            content: content.into(),
            sender_id: sender_id.into(),
            timestamp: Utc::now(),
            status: DeliveryStatus::Pending,
            metadata: HashMap::new(),
        }
    }

    /// Creates a chat message from a user.
    pub fn chat(
        sender_id: impl Into<String>,
        content: impl Into<String>,
        reply_to: Option<String>,
        agent_id: Option<String>,
    ) -> Self {
        Self::new(MessageKind::Chat { reply_to, agent_id }, sender_id, content)
    }

    /// Creates a server-originated system message with the given severity.
    pub fn system(content: impl Into<String>, severity: Severity) -> Self {
        Self::new(MessageKind::System { severity }, SYSTEM_SENDER, content)
    }

    /// Creates a file metadata message.
    pub fn file(
        sender_id: impl Into<String>,
        file_name: impl Into<String>,
        file_type: impl Into<String>,
        file_size: u64,
        file_url: Option<String>,
    ) -> Self {
        let name = file_name.into();
        let kind = MessageKind::File {
            file_name: name.clone(),
            file_type: file_type.into(),
            file_size,
            file_url,
        };
        Self::new(kind, sender_id, name)
    }

    /// Creates a bare error message.
    pub fn error(sender_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(MessageKind::Error, sender_id, content)
    }

    /// Current delivery status. Mutation goes through [`Self::mark_delivered`]
    /// and [`Self::mark_failed`] only.
    pub fn status(&self) -> DeliveryStatus {
        self.status
    }

    /// Marks the message delivered. No effect once the status has settled.
    pub fn mark_delivered(&mut self) {
        if self.status == DeliveryStatus::Pending {
            self.status = DeliveryStatus::Delivered;
        }
    }

    /// Marks the message failed. No effect once the status has settled.
    pub fn mark_failed(&mut self) {
        if self.status == DeliveryStatus::Pending {
            self.status = DeliveryStatus::Error;
        }
    }

    /// System messages bypass rate limiting by type tag.
    pub fn is_system(&self) -> bool {
        matches!(self.kind, MessageKind::System { .. })
    }

    /// Serializes the message to its wire frame.
    pub fn to_frame(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(|e| MessageError::SerializationError(e.to_string()))
    }
}

/// Inbound frame sent by a client over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
}

impl ClientFrame {
    /// Parses a raw text frame. Malformed JSON is an admission error the
    /// caller surfaces to the sender without closing the connection.
    pub fn parse(raw: &str) -> Result<Self, MessageError> {
        serde_json::from_str(raw).map_err(|e| MessageError::InvalidFrame(e.to_string()))
    }
}
