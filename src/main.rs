//! chatgate - Resilient multi-channel message gateway
//!
//! Runs the channel adapters against a configuration file and exposes a few
//! operator commands for checking and exercising them.

use anyhow::{Context, Result};
use chatgate::{
    bus::{InboundReceiver, OutboundPublisher},
    channels::ChannelManager,
    config::GatewayConfig,
    MessageBus, OutboundMessage,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "chatgate")]
#[command(author = "A3S Lab Team")]
#[command(version)]
#[command(about = "Resilient multi-channel message gateway")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CHATGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway and run until Ctrl+C
    Gateway {
        /// Answer every inbound message with its own text
        #[arg(long)]
        echo: bool,
    },

    /// Send a message through one configured channel
    Send {
        /// Target channel
        #[arg(short, long)]
        channel: String,

        /// Target chat ID
        #[arg(short = 't', long)]
        to: String,

        /// Message content
        #[arg(short, long)]
        message: String,
    },

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },

    /// Validate configuration and list enabled channels
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.json_logs);

    let config = match &cli.config {
        Some(path) => GatewayConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => GatewayConfig::default(),
    };

    match cli.command {
        Commands::Gateway { echo } => run_gateway(config, echo).await?,
        Commands::Send {
            channel,
            to,
            message,
        } => send_message(&config, &channel, &to, &message).await?,
        Commands::Config { default } => {
            show_config(if default { None } else { Some(&config) })?;
        }
        Commands::Check => run_check(&config)?,
    }

    Ok(())
}

fn init_logging(verbose: bool, json: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("chatgate={}", log_level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run_gateway(config: GatewayConfig, echo: bool) -> Result<()> {
    tracing::info!("Starting chatgate");

    let bus = MessageBus::new(config.bus.inbound_capacity, config.bus.outbound_capacity);
    let manager = ChannelManager::from_config(&config, &bus)?;
    if manager.is_empty() {
        tracing::warn!("No channels enabled; nothing to do until one is configured");
    }

    let cancel = CancellationToken::new();
    let inbound = bus.subscribe_inbound()?;
    let outbound = bus.subscribe_outbound()?;
    let consumer = tokio::spawn(consume_inbound(
        inbound,
        echo.then(|| bus.outbound_publisher()),
        cancel.clone(),
    ));

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutting down..."),
            Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
        }
        shutdown.cancel();
    });

    tracing::info!(channels = ?manager.names(), "chatgate is running. Press Ctrl+C to stop.");
    manager.start_all(outbound, cancel).await?;
    consumer.await?;

    tracing::info!("chatgate stopped");
    Ok(())
}

/// Stand-in for an agent core: logs inbound traffic, optionally echoing it.
async fn consume_inbound(
    mut inbound: InboundReceiver,
    echo: Option<OutboundPublisher>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = inbound.recv() => message,
        };
        let Some(message) = message else { break };

        tracing::info!(
            channel = %message.channel,
            chat_id = %message.chat_id,
            sender_id = %message.sender_id,
            session = %message.session_key(),
            "Inbound: {}",
            message.content
        );

        if let Some(outbound) = &echo {
            let reply = OutboundMessage::reply(&message, &message.content);
            if let Err(e) = outbound.publish(reply).await {
                tracing::warn!("Echo reply dropped: {}", e);
            }
        }
    }
}

async fn send_message(config: &GatewayConfig, channel: &str, to: &str, message: &str) -> Result<()> {
    let bus = MessageBus::new(config.bus.inbound_capacity, config.bus.outbound_capacity);
    let manager = ChannelManager::from_config(config, &bus)?;

    manager
        .dispatch(&OutboundMessage::new(channel, to, message))
        .await
        .with_context(|| format!("Failed to send to {} on {}", to, channel))?;

    println!("Sent to {} on {}", to, channel);
    Ok(())
}

fn run_check(config: &GatewayConfig) -> Result<()> {
    config.validate()?;
    println!("Configuration OK");

    let channels = config.enabled_channels();
    if channels.is_empty() {
        println!("No channels enabled");
    } else {
        println!("Enabled channels: {}", channels.join(", "));
    }
    Ok(())
}

fn show_config(config: Option<&GatewayConfig>) -> Result<()> {
    let config = config.cloned().unwrap_or_default();
    println!("{}", config.to_toml()?);
    Ok(())
}
