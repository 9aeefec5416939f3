//! Adapter registry and outbound dispatch

use super::adapter::{AdapterContext, ChannelAdapter};
use super::{DingTalkAdapter, DiscordAdapter, FeishuAdapter, SlackAdapter, TelegramAdapter};
use crate::bus::{MessageBus, OutboundMessage, OutboundReceiver};
use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

type Registry = HashMap<String, Arc<dyn ChannelAdapter>>;

/// Default time running adapters get to unwind after cancellation.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Owns every adapter and routes outbound envelopes to them by channel name.
///
/// The registry is fixed at construction.
pub struct ChannelManager {
    adapters: Arc<Registry>,
    shutdown_grace: Duration,
}

impl ChannelManager {
    /// Register `adapters`; two adapters with the same name is a config error
    pub fn new(adapters: Vec<Arc<dyn ChannelAdapter>>) -> Result<Self> {
        let mut registry = Registry::with_capacity(adapters.len());
        for adapter in adapters {
            let name = adapter.name().to_string();
            if registry.insert(name.clone(), adapter).is_some() {
                return Err(Error::Config(format!(
                    "Channel '{}' registered more than once",
                    name
                )));
            }
        }
        Ok(Self {
            adapters: Arc::new(registry),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        })
    }

    /// Build the enabled adapters from configuration
    pub fn from_config(config: &GatewayConfig, bus: &MessageBus) -> Result<Self> {
        let ctx = AdapterContext::new(bus.inbound_publisher(), config.resilience.clone());
        let mut adapters: Vec<Arc<dyn ChannelAdapter>> = Vec::new();

        macro_rules! init_channel {
            ($config_opt:expr, $adapter:ident) => {
                if let Some(channel_config) = $config_opt.as_ref().filter(|c| c.enabled) {
                    adapters.push(Arc::new($adapter::new(channel_config.clone(), &ctx)));
                }
            };
        }

        init_channel!(config.channels.telegram, TelegramAdapter);
        init_channel!(config.channels.discord, DiscordAdapter);
        init_channel!(config.channels.slack, SlackAdapter);
        init_channel!(config.channels.dingtalk, DingTalkAdapter);
        init_channel!(config.channels.feishu, FeishuAdapter);

        Ok(Self::new(adapters)?.with_shutdown_grace(config.shutdown_grace()))
    }

    /// Override the shutdown grace period
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Registered channel names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Look up an adapter by channel name
    pub fn get(&self, name: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Route one envelope to the adapter named by its channel
    pub async fn dispatch(&self, message: &OutboundMessage) -> Result<()> {
        route(&self.adapters, message).await
    }

    /// Start every adapter and the outbound dispatch loop, then wait for
    /// `cancel`.
    ///
    /// After cancellation, running tasks get the shutdown grace period to
    /// finish; whatever is still running then is aborted.
    pub async fn start_all(&self, outbound: OutboundReceiver, cancel: CancellationToken) -> Result<()> {
        let mut tasks = JoinSet::new();

        for (name, adapter) in self.adapters.iter() {
            let name = name.clone();
            let adapter = adapter.clone();
            let token = cancel.child_token();
            tasks.spawn(async move {
                tracing::info!(channel = %name, "Starting channel adapter");
                match adapter.start(token).await {
                    Ok(()) => tracing::info!(channel = %name, "Channel adapter stopped"),
                    Err(e) => tracing::error!(channel = %name, "Channel adapter failed: {}", e),
                }
            });
        }

        tasks.spawn(dispatch_loop(self.adapters.clone(), outbound, cancel.clone()));

        tracing::info!(channels = ?self.names(), "Channel manager running");
        cancel.cancelled().await;
        tracing::info!("Shutting down channel adapters");

        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = tasks.len(),
                grace_secs = self.shutdown_grace.as_secs(),
                "Aborting tasks still running after shutdown grace period"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        Ok(())
    }
}

async fn route(adapters: &Registry, message: &OutboundMessage) -> Result<()> {
    let adapter = adapters
        .get(&message.channel)
        .ok_or_else(|| Error::UnknownRoute(message.channel.clone()))?;
    adapter.send(message).await
}

async fn dispatch_loop(adapters: Arc<Registry>, mut outbound: OutboundReceiver, cancel: CancellationToken) {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = outbound.recv() => message,
        };
        let Some(message) = message else {
            tracing::info!("Outbound queue closed");
            break;
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = route(&adapters, &message) => result,
        };

        match result {
            Ok(()) => {
                tracing::debug!(channel = %message.channel, chat_id = %message.chat_id, "Delivered");
            }
            Err(e @ Error::UnknownRoute(_)) => {
                tracing::warn!(channel = %message.channel, "Dropping outbound message: {}", e);
            }
            Err(e) => {
                tracing::error!(
                    channel = %message.channel,
                    chat_id = %message.chat_id,
                    "Failed to deliver outbound message: {}",
                    e
                );
            }
        }
    }
    tracing::debug!("Dispatch loop stopped");
}
