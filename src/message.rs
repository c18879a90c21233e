//! Message types for the perceptual tier

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single chat message as received from the ingress layer.
///
/// Messages are immutable once created; they are owned by the perceptual
/// tier until their block is promoted or evicted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: Uuid,

    /// Chat this message belongs to
    pub chat_id: String,

    /// Sender identifier (user id, bot id, ...)
    pub sender_id: String,

    /// Timestamp when the message was created
    pub timestamp: DateTime<Utc>,

    /// Message text
    pub text: String,

    /// Optional metadata (platform, reply target, ...)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Message {
    /// Create a new message
    pub fn new(
        chat_id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_id: chat_id.into(),
            sender_id: sender_id.into(),
            timestamp: Utc::now(),
            text: text.into(),
            metadata: HashMap::new(),
        }
    }

    /// Set metadata
    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_roundtrips_through_json() {
        let msg = Message::new("chat-1", "alice", "hello there");
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, msg.id);
        assert_eq!(back.chat_id, "chat-1");
        assert_eq!(back.text, "hello there");
    }

    #[test]
    fn empty_metadata_is_skipped() {
        let msg = Message::new("chat-1", "alice", "hi");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("metadata"));
    }
}
