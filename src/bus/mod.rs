//! In-process message bus
//!
//! Carries [`InboundMessage`]s from channel adapters to the agent core and
//! [`OutboundMessage`]s from the agent core back to the channel manager.

mod message;
mod queue;

pub use message::{InboundMessage, OutboundMessage};
pub use queue::{
    InboundPublisher, InboundReceiver, MessageBus, OutboundPublisher, OutboundReceiver,
    DEFAULT_QUEUE_CAPACITY,
};
