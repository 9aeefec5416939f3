//! Channel adapter trait

use crate::bus::{InboundPublisher, OutboundMessage};
use crate::config::ResilienceConfig;
use crate::error::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// A connection to one chat platform.
///
/// Adapters publish what they receive to the bus on their own; the
/// [`ChannelManager`](super::ChannelManager) only calls [`send`](Self::send)
/// for outbound envelopes addressed to [`name`](Self::name).
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Stable lowercase channel id, e.g. `"telegram"`
    fn name(&self) -> &str;

    /// Receive from the platform until `cancel` fires.
    ///
    /// Returns `Ok(())` after cancellation, or an [`Error::Config`]
    /// when the adapter cannot run at all (missing credentials, bad address).
    /// Transient failures are retried internally and never end this call.
    ///
    /// [`Error::Config`]: crate::error::Error::Config
    async fn start(&self, cancel: CancellationToken) -> Result<()>;

    /// Deliver one outbound message
    async fn send(&self, message: &OutboundMessage) -> Result<()>;
}

/// What every adapter needs from the gateway besides its own config
#[derive(Clone)]
pub struct AdapterContext {
    /// Where received messages go
    pub inbound: InboundPublisher,
    /// Shared reconnect, retry and credential settings
    pub resilience: ResilienceConfig,
}

impl AdapterContext {
    pub fn new(inbound: InboundPublisher, resilience: ResilienceConfig) -> Self {
        Self { inbound, resilience }
    }
}
