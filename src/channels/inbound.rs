//! Sender filtering and publication of inbound messages

use crate::bus::{InboundMessage, InboundPublisher};

/// Senders permitted to talk to the gateway. Empty means everyone.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    entries: Vec<String>,
}

impl AllowList {
    pub fn new(entries: &[String]) -> Self {
        Self {
            entries: entries
                .iter()
                .map(|e| e.trim().trim_start_matches('@').to_string())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    /// Whether `sender_id` may publish.
    ///
    /// A sender id may carry several identities joined by `|`
    /// (e.g. `"12345|alice"`); any one of them matching is enough.
    pub fn permits(&self, sender_id: &str) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        if self.entries.iter().any(|e| e == sender_id) {
            return true;
        }
        sender_id
            .split('|')
            .filter(|part| !part.is_empty())
            .any(|part| self.entries.iter().any(|e| e == part))
    }
}

/// Admission point between an adapter and the inbound queue
#[derive(Clone)]
pub struct Inbound {
    allow: AllowList,
    publisher: InboundPublisher,
}

impl Inbound {
    pub fn new(allow: AllowList, publisher: InboundPublisher) -> Self {
        Self { allow, publisher }
    }

    /// Publish `message` if its sender is allowed.
    ///
    /// Returns whether the message was published. Waits while the inbound
    /// queue is full.
    pub async fn admit(&self, message: InboundMessage) -> bool {
        if !self.allow.permits(&message.sender_id) {
            tracing::debug!(
                channel = %message.channel,
                sender_id = %message.sender_id,
                "Dropping message from sender not in allow list"
            );
            return false;
        }

        let channel = message.channel.clone();
        match self.publisher.publish(message).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(channel = %channel, "Inbound message lost: {}", e);
                false
            }
        }
    }
}
