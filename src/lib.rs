//! chatgate - Resilient multi-channel message gateway
//!
//! chatgate connects one agent core to several chat platforms at once.
//! Adapters keep their platform connections alive, normalize inbound
//! messages onto a shared bus and deliver the agent's replies back out.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                         Channel Manager                           │
//! │  ┌──────────┐ ┌─────────┐ ┌───────┐ ┌──────────┐ ┌────────────┐   │
//! │  │ Telegram │ │ Discord │ │ Slack │ │ DingTalk │ │   Feishu   │   │
//! │  └────┬─────┘ └────┬────┘ └───┬───┘ └────┬─────┘ └─────┬──────┘   │
//! │       │  supervisor · credentials · dedup · rate limits │         │
//! └───────┼────────────┼──────────┼──────────┼─────────────┼──────────┘
//!         │ inbound    ▲ outbound (dispatch by channel name)
//! ┌───────▼────────────┴──────────────────────────────────────────────┐
//! │                          Message Bus                              │
//! └───────┬────────────▲──────────────────────────────────────────────┘
//!         ▼            │
//! ┌──────────────────────────────────┐
//! │            Agent core            │
//! └──────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`bus`]: bounded inbound/outbound queues and message envelopes
//! - [`resilience`]: connection supervision, credential refresh,
//!   redelivery filtering and rate-limited sending
//! - [`format`]: markdown to platform markup, length chunking
//! - [`channels`]: platform adapters and the channel manager
//! - [`config`]: configuration management

pub mod bus;
pub mod channels;
pub mod config;
pub mod error;
pub mod format;
pub mod resilience;

pub use bus::{InboundMessage, MessageBus, OutboundMessage};
pub use channels::{ChannelAdapter, ChannelManager};
pub use config::GatewayConfig;
pub use error::{Error, Result};
