//! Message envelopes crossing the bus

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Message received from a chat platform, headed for the agent core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Channel id (e.g., "telegram")
    pub channel: String,
    /// Sender identifier on the platform
    pub sender_id: String,
    /// Chat/conversation identifier
    pub chat_id: String,
    /// Message text
    pub content: String,
    /// When the message was received
    pub timestamp: DateTime<Utc>,
    /// Media references (URLs or local paths)
    #[serde(default)]
    pub media: Vec<String>,
    /// Platform-specific metadata
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    session_key: String,
}

impl InboundMessage {
    /// Create a new inbound message. The session key defaults to `channel:chat_id`.
    pub fn new(channel: &str, sender_id: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel: channel.to_string(),
            sender_id: sender_id.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            media: Vec::new(),
            metadata: HashMap::new(),
            session_key: format!("{}:{}", channel, chat_id),
        }
    }

    /// Override the routing key (e.g., to give each thread its own session)
    pub fn with_session_key(mut self, key: impl Into<String>) -> Self {
        self.session_key = key.into();
        self
    }

    /// Attach media references
    pub fn with_media(mut self, media: Vec<String>) -> Self {
        self.media = media;
        self
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Routing key identifying the originating conversation
    pub fn session_key(&self) -> &str {
        &self.session_key
    }
}

/// Message produced by the agent core, headed for a chat platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Target channel id
    pub channel: String,
    /// Target chat id
    pub chat_id: String,
    /// Message content (markdown)
    pub content: String,
    /// Platform message id to reply to
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Local media paths to attach
    #[serde(default)]
    pub media: Vec<String>,
    /// Platform-specific metadata (e.g., thread ids)
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl OutboundMessage {
    /// Create a new outbound message
    pub fn new(channel: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            reply_to: None,
            media: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Set reply-to message id
    pub fn reply_to(mut self, message_id: &str) -> Self {
        self.reply_to = Some(message_id.to_string());
        self
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Read a string metadata entry
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// Build the reply to an inbound message, carrying its metadata along
    /// so adapters can thread the response.
    pub fn reply(to: &InboundMessage, content: &str) -> Self {
        Self {
            channel: to.channel.clone(),
            chat_id: to.chat_id.clone(),
            content: content.to_string(),
            reply_to: to
                .metadata
                .get("message_id")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            media: Vec::new(),
            metadata: to.metadata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_default() {
        let msg = InboundMessage::new("telegram", "user-1", "chat-9", "hi");
        assert_eq!(msg.session_key(), "telegram:chat-9");
    }

    #[test]
    fn test_session_key_override() {
        let msg = InboundMessage::new("slack", "U1", "C1", "hi").with_session_key("slack:C1:1700.01");
        assert_eq!(msg.session_key(), "slack:C1:1700.01");
        assert_eq!(msg.chat_id, "C1");
    }

    #[test]
    fn test_inbound_serde_keeps_session_key() {
        let msg = InboundMessage::new("discord", "42", "7", "yo").with_session_key("custom");
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: InboundMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.session_key(), "custom");
    }

    #[test]
    fn test_outbound_builder() {
        let msg = OutboundMessage::new("telegram", "123", "hello")
            .reply_to("55")
            .with_metadata("thread_ts", "1700.02");
        assert_eq!(msg.reply_to.as_deref(), Some("55"));
        assert_eq!(msg.metadata_str("thread_ts"), Some("1700.02"));
        assert_eq!(msg.metadata_str("missing"), None);
    }

    #[test]
    fn test_reply_carries_message_id() {
        let inbound = InboundMessage::new("discord", "42", "7", "ping")
            .with_metadata("message_id", "m-1");
        let reply = OutboundMessage::reply(&inbound, "pong");
        assert_eq!(reply.channel, "discord");
        assert_eq!(reply.chat_id, "7");
        assert_eq!(reply.reply_to.as_deref(), Some("m-1"));
    }
}
