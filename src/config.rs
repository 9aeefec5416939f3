//! chatgate configuration management

use crate::error::{Error, Result};
use crate::resilience::{
    DeliveryPolicy, ReconnectPolicy, DEFAULT_DEDUP_CAPACITY, MAX_RECONNECT_DELAY_SECS,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main chatgate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// How long running adapters get to unwind after shutdown (seconds)
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Message bus queue sizes
    #[serde(default)]
    pub bus: BusConfig,

    /// Reconnect, retry and credential settings shared by all adapters
    #[serde(default)]
    pub resilience: ResilienceConfig,

    /// Channel configurations
    #[serde(default)]
    pub channels: ChannelsConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_secs: default_shutdown_grace_secs(),
            bus: BusConfig::default(),
            resilience: ResilienceConfig::default(),
            channels: ChannelsConfig::default(),
        }
    }
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_dedup_capacity() -> usize {
    DEFAULT_DEDUP_CAPACITY
}

impl GatewayConfig {
    /// Load and validate a TOML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml(&content)?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse and validate TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Reject values no adapter can run with
    pub fn validate(&self) -> Result<()> {
        if self.bus.inbound_capacity == 0 || self.bus.outbound_capacity == 0 {
            return Err(Error::Config("bus capacities must be at least 1".to_string()));
        }

        let reconnect = &self.resilience.reconnect;
        if !(reconnect.initial_delay_secs.is_finite() && reconnect.initial_delay_secs >= 0.0) {
            return Err(Error::Config(
                "resilience.reconnect.initial_delay_secs must be a non-negative number".to_string(),
            ));
        }
        if !(reconnect.max_delay_secs.is_finite()
            && reconnect.max_delay_secs >= reconnect.initial_delay_secs)
        {
            return Err(Error::Config(
                "resilience.reconnect.max_delay_secs must be at least initial_delay_secs".to_string(),
            ));
        }
        if reconnect.max_delay_secs > MAX_RECONNECT_DELAY_SECS {
            return Err(Error::Config(format!(
                "resilience.reconnect delays must not exceed {} seconds",
                MAX_RECONNECT_DELAY_SECS
            )));
        }
        if reconnect.multiplier == 0 {
            return Err(Error::Config(
                "resilience.reconnect.multiplier must be at least 1".to_string(),
            ));
        }
        if self.resilience.delivery.max_attempts == 0 {
            return Err(Error::Config(
                "resilience.delivery.max_attempts must be at least 1".to_string(),
            ));
        }

        if let Some(feishu) = self.channels.feishu.as_ref().filter(|c| c.enabled) {
            if feishu.app_id.is_empty() {
                return Err(Error::Config("channels.feishu.app_id is required".to_string()));
            }
            feishu.listen.parse::<std::net::SocketAddr>().map_err(|e| {
                Error::Config(format!("channels.feishu.listen '{}': {}", feishu.listen, e))
            })?;
            if !feishu.path.starts_with('/') {
                return Err(Error::Config("channels.feishu.path must start with '/'".to_string()));
            }
        }
        if let Some(dingtalk) = self.channels.dingtalk.as_ref().filter(|c| c.enabled) {
            if dingtalk.robot_code.is_empty() {
                return Err(Error::Config("channels.dingtalk.robot_code is required".to_string()));
            }
        }

        Ok(())
    }

    /// Names of the channels that are configured and enabled
    pub fn enabled_channels(&self) -> Vec<&'static str> {
        let c = &self.channels;
        [
            ("telegram", c.telegram.as_ref().map(|c| c.enabled)),
            ("discord", c.discord.as_ref().map(|c| c.enabled)),
            ("slack", c.slack.as_ref().map(|c| c.enabled)),
            ("dingtalk", c.dingtalk.as_ref().map(|c| c.enabled)),
            ("feishu", c.feishu.as_ref().map(|c| c.enabled)),
        ]
        .into_iter()
        .filter(|(_, enabled)| *enabled == Some(true))
        .map(|(name, _)| name)
        .collect()
    }

    /// Shutdown grace period
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Message bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Inbound queue capacity
    pub inbound_capacity: usize,

    /// Outbound queue capacity
    pub outbound_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: crate::bus::DEFAULT_QUEUE_CAPACITY,
            outbound_capacity: crate::bus::DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Shared resilience settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Reconnect backoff for socket adapters
    pub reconnect: ReconnectPolicy,

    /// Outbound send retries
    pub delivery: DeliveryPolicy,

    /// Access-token caching
    pub credentials: CredentialsConfig,
}

/// Access-token cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Treat tokens as expired this many seconds early
    pub refresh_margin_secs: u64,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            refresh_margin_secs: crate::resilience::DEFAULT_REFRESH_MARGIN.as_secs(),
        }
    }
}

impl CredentialsConfig {
    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }
}

/// Channel configurations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    /// Telegram channel config
    pub telegram: Option<TelegramConfig>,

    /// Slack channel config
    pub slack: Option<SlackConfig>,

    /// Discord channel config
    pub discord: Option<DiscordConfig>,

    /// Feishu (Lark) channel config
    pub feishu: Option<FeishuConfig>,

    /// DingTalk channel config
    pub dingtalk: Option<DingTalkConfig>,
}

/// Telegram channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Environment variable holding the bot token
    pub bot_token_ref: String,

    /// Allowed sender ids or usernames (empty = all allowed)
    #[serde(default)]
    pub allow_from: Vec<String>,

    /// Long-poll timeout in seconds
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,

    #[serde(default = "default_telegram_api")]
    pub api_base: String,
}

fn default_poll_timeout_secs() -> u64 {
    30
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}

/// Slack channel configuration (Socket Mode)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Environment variable holding the bot token (`xoxb-`)
    pub bot_token_ref: String,

    /// Environment variable holding the app-level token (`xapp-`)
    pub app_token_ref: String,

    /// Allowed user ids (empty = all allowed)
    #[serde(default)]
    pub allow_from: Vec<String>,

    /// Recently seen event ids kept for redelivery filtering
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,

    #[serde(default = "default_slack_api")]
    pub api_base: String,
}

fn default_slack_api() -> String {
    "https://slack.com/api".to_string()
}

/// Discord channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Environment variable holding the bot token
    pub bot_token_ref: String,

    /// Allowed user ids (empty = all allowed)
    #[serde(default)]
    pub allow_from: Vec<String>,

    /// Gateway intents bitmask
    #[serde(default = "default_discord_intents")]
    pub intents: u64,

    #[serde(default = "default_discord_api")]
    pub api_base: String,
}

fn default_discord_intents() -> u64 {
    // GUILDS | GUILD_MESSAGES | DIRECT_MESSAGES | MESSAGE_CONTENT
    1 | (1 << 9) | (1 << 12) | (1 << 15)
}

fn default_discord_api() -> String {
    "https://discord.com/api/v10".to_string()
}

/// Feishu (Lark) channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeishuConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// App ID
    pub app_id: String,

    /// Environment variable holding the app secret
    pub app_secret_ref: String,

    /// Environment variable holding the encrypt key used to sign callbacks
    #[serde(default)]
    pub encrypt_key_ref: Option<String>,

    /// Environment variable holding the callback verification token
    #[serde(default)]
    pub verification_token_ref: Option<String>,

    /// Allowed user open_ids (empty = all allowed)
    #[serde(default)]
    pub allow_from: Vec<String>,

    /// Recently seen message ids kept for redelivery filtering
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,

    /// Address the callback server binds to
    #[serde(default = "default_feishu_listen")]
    pub listen: String,

    /// Callback path
    #[serde(default = "default_feishu_path")]
    pub path: String,

    #[serde(default = "default_feishu_api")]
    pub api_base: String,
}

fn default_feishu_listen() -> String {
    "0.0.0.0:18791".to_string()
}

fn default_feishu_path() -> String {
    "/feishu/events".to_string()
}

fn default_feishu_api() -> String {
    "https://open.feishu.cn/open-apis".to_string()
}

/// DingTalk channel configuration (Stream mode)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DingTalkConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Environment variable holding the app key (client id)
    pub app_key_ref: String,

    /// Environment variable holding the app secret (client secret)
    pub app_secret_ref: String,

    /// Robot code identifier
    pub robot_code: String,

    /// Allowed user staffIds (empty = all allowed)
    #[serde(default)]
    pub allow_from: Vec<String>,

    /// Recently seen message ids kept for redelivery filtering
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,

    #[serde(default = "default_dingtalk_api")]
    pub api_base: String,
}

fn default_dingtalk_api() -> String {
    "https://api.dingtalk.com".to_string()
}

/// Resolve a `*_ref` credential from the environment.
///
/// The exact name is tried first, then its upper-case form.
pub fn resolve_credential(credential_ref: &str) -> Result<String> {
    std::env::var(credential_ref)
        .or_else(|_| std::env::var(credential_ref.to_uppercase()))
        .ok()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| {
            Error::Config(format!(
                "Failed to resolve credential from env var: {}",
                credential_ref
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.bus.inbound_capacity, 1000);
        assert_eq!(config.bus.outbound_capacity, 1000);
        assert_eq!(config.resilience.reconnect.initial_delay_secs, 2.0);
        assert_eq!(config.resilience.reconnect.max_delay_secs, 60.0);
        assert_eq!(config.resilience.delivery.max_attempts, 3);
        assert_eq!(config.resilience.credentials.refresh_margin_secs, 60);
        assert!(config.enabled_channels().is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
shutdown_grace_secs = 2

[bus]
inbound_capacity = 16

[resilience.reconnect]
initial_delay_secs = 1
max_delay_secs = 30
multiplier = 3

[channels.telegram]
bot_token_ref = "TG_TOKEN"
allow_from = ["42", "alice"]

[channels.slack]
enabled = false
bot_token_ref = "SLACK_BOT"
app_token_ref = "SLACK_APP"

[channels.feishu]
app_id = "cli_test"
app_secret_ref = "FEISHU_SECRET"
dedup_capacity = 50
"#
        )
        .unwrap();

        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.shutdown_grace(), Duration::from_secs(2));
        assert_eq!(config.bus.inbound_capacity, 16);
        assert_eq!(config.bus.outbound_capacity, 1000);
        assert_eq!(config.resilience.reconnect.multiplier, 3);
        assert_eq!(config.resilience.delivery.retry_delay_ms, 1000);

        let telegram = config.channels.telegram.as_ref().unwrap();
        assert!(telegram.enabled);
        assert_eq!(telegram.allow_from, vec!["42", "alice"]);
        assert_eq!(telegram.poll_timeout_secs, 30);

        let feishu = config.channels.feishu.as_ref().unwrap();
        assert_eq!(feishu.dedup_capacity, 50);
        assert_eq!(feishu.listen, "0.0.0.0:18791");

        assert_eq!(config.enabled_channels(), vec!["telegram", "feishu"]);
    }

    #[test]
    fn test_load_missing_file() {
        let err = GatewayConfig::load(Path::new("/nonexistent/chatgate.toml")).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = GatewayConfig::default();
        config.bus.outbound_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.resilience.reconnect.max_delay_secs = 1.0;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.resilience.delivery.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.resilience.reconnect.initial_delay_secs = 1e30;
        config.resilience.reconnect.max_delay_secs = 1e30;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must not exceed"));

        let err = GatewayConfig::from_toml(
            "[channels.feishu]\napp_id = \"cli\"\napp_secret_ref = \"S\"\nlisten = \"not an addr\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("listen"));
    }

    #[test]
    fn test_toml_roundtrip_of_defaults() {
        let config = GatewayConfig::default();
        let text = config.to_toml().unwrap();
        let parsed = GatewayConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.shutdown_grace_secs, config.shutdown_grace_secs);
    }

    #[test]
    fn test_discord_default_intents() {
        assert_eq!(default_discord_intents(), 37377);
    }

    #[test]
    fn test_resolve_credential() {
        std::env::set_var("CHATGATE_TEST_CREDENTIAL", "s3cret");
        assert_eq!(resolve_credential("CHATGATE_TEST_CREDENTIAL").unwrap(), "s3cret");
        assert_eq!(resolve_credential("chatgate_test_credential").unwrap(), "s3cret");

        let err = resolve_credential("CHATGATE_TEST_MISSING").unwrap_err();
        assert!(err.to_string().contains("Failed to resolve"));
    }
}
