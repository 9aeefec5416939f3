//! Telegram channel adapter
//!
//! Receives through Bot API long polling (`getUpdates`) driven by the
//! connection supervisor: a dial is a `getMe` token check and each poll is
//! one frame. Sends go through `sendMessage` as HTML, falling back to plain
//! text when Telegram refuses the markup.

use super::adapter::{AdapterContext, ChannelAdapter};
use super::inbound::{AllowList, Inbound};
use crate::bus::{InboundMessage, OutboundMessage};
use crate::config::{resolve_credential, TelegramConfig};
use crate::error::{Error, Result};
use crate::format::{chunk_message, transform, TelegramHtml};
use crate::resilience::{
    ConnectionSupervisor, Dialer, FrameConnection, LinkEvent, RateLimitedSender, ReconnectPolicy,
    SendFailure,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Telegram message size limit (characters)
pub const TELEGRAM_MAX_MESSAGE_LEN: usize = 4096;

/// Telegram channel adapter
pub struct TelegramAdapter {
    config: TelegramConfig,
    client: reqwest::Client,
    inbound: Inbound,
    reconnect: ReconnectPolicy,
    sender: RateLimitedSender,
    /// Next `getUpdates` offset; survives reconnects so nothing is re-read
    offset: Arc<AtomicI64>,
}

impl TelegramAdapter {
    /// Create a new Telegram adapter
    pub fn new(config: TelegramConfig, ctx: &AdapterContext) -> Self {
        Self {
            inbound: Inbound::new(AllowList::new(&config.allow_from), ctx.inbound.clone()),
            client: reqwest::Client::new(),
            reconnect: ctx.resilience.reconnect.clone(),
            sender: RateLimitedSender::new("telegram", ctx.resilience.delivery.clone()),
            offset: Arc::new(AtomicI64::new(0)),
            config,
        }
    }

    fn api_url(&self, token: &str) -> String {
        format!("{}/bot{}", self.config.api_base.trim_end_matches('/'), token)
    }

    /// Convert an update into an inbound message; non-text updates yield `None`
    fn parse_update(update: &Update) -> Option<InboundMessage> {
        let message = update.message.as_ref()?;
        let from = message.from.as_ref()?;
        if from.is_bot {
            return None;
        }
        let content = message.text.as_deref().or(message.caption.as_deref())?;

        let sender_id = match &from.username {
            Some(username) => format!("{}|{}", from.id, username),
            None => from.id.to_string(),
        };

        let mut inbound = InboundMessage::new("telegram", &sender_id, &message.chat.id.to_string(), content)
            .with_metadata("message_id", message.message_id.to_string())
            .with_metadata("user_id", from.id)
            .with_metadata("first_name", from.first_name.clone())
            .with_metadata("chat_type", message.chat.kind.clone())
            .with_metadata("is_group", message.chat.kind != "private");
        if let Some(username) = &from.username {
            inbound = inbound.with_metadata("username", username.clone());
        }
        if let Some(sent_at) = chrono::DateTime::from_timestamp(message.date, 0) {
            inbound.timestamp = sent_at;
        }
        Some(inbound)
    }

    async fn send_text(
        &self,
        token: &str,
        chat_id: &str,
        text: &str,
        html: bool,
        reply_to: Option<&str>,
    ) -> Result<()> {
        let url = format!("{}/sendMessage", self.api_url(token));
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });
        if html {
            body["parse_mode"] = "HTML".into();
        }
        if let Some(message_id) = reply_to.and_then(|id| id.parse::<i64>().ok()) {
            body["reply_parameters"] = serde_json::json!({
                "message_id": message_id,
                "allow_sending_without_reply": true,
            });
        }

        let client = &self.client;
        let (url, body) = (&url, &body);
        self.sender
            .send("sendMessage", || async move {
                let response = client.post(url).json(body).send().await?;
                let status = response.status();
                let reply: ApiReply<serde_json::Value> = response.json().await?;
                if reply.ok {
                    return Ok(());
                }
                let retry_after = reply
                    .parameters
                    .and_then(|p| p.retry_after)
                    .map(Duration::from_secs);
                Err(SendFailure::from_status(
                    status,
                    retry_after,
                    reply.description.as_deref().unwrap_or_default(),
                ))
            })
            .await
    }
}

#[async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let token = resolve_credential(&self.config.bot_token_ref)?;
        let dialer = PollDialer {
            client: self.client.clone(),
            api: self.api_url(&token),
            inbound: self.inbound.clone(),
            offset: self.offset.clone(),
            poll_timeout: Duration::from_secs(self.config.poll_timeout_secs),
        };

        tracing::info!("Telegram adapter starting");
        let supervisor = ConnectionSupervisor::new("telegram", self.reconnect.clone());
        supervisor.run(&dialer, &cancel).await
    }

    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        let token = resolve_credential(&self.config.bot_token_ref)?;

        for (i, chunk) in chunk_message(&message.content, TELEGRAM_MAX_MESSAGE_LEN)
            .iter()
            .enumerate()
        {
            if chunk.trim().is_empty() {
                continue;
            }
            let reply_to = if i == 0 { message.reply_to.as_deref() } else { None };
            let html = transform(chunk, &TelegramHtml);

            match self.send_text(&token, &message.chat_id, &html, true, reply_to).await {
                Err(Error::Channel(reason)) if reason.contains("can't parse entities") => {
                    tracing::warn!(
                        chat_id = %message.chat_id,
                        "Telegram rejected HTML, resending as plain text"
                    );
                    self.send_text(&token, &message.chat_id, chunk, false, reply_to).await?;
                }
                other => other?,
            }
        }

        tracing::debug!(chat_id = %message.chat_id, "Sent Telegram message");
        Ok(())
    }
}

struct PollDialer {
    client: reqwest::Client,
    api: String,
    inbound: Inbound,
    offset: Arc<AtomicI64>,
    poll_timeout: Duration,
}

#[async_trait]
impl Dialer for PollDialer {
    async fn dial(&self) -> Result<Box<dyn FrameConnection>> {
        let response = self
            .client
            .get(format!("{}/getMe", self.api))
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| Error::Transport(format!("getMe failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::Config("Telegram rejected the bot token".to_string()));
        }
        let reply: ApiReply<BotUser> = response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("getMe returned invalid JSON: {}", e)))?;
        let bot = match (reply.ok, reply.result) {
            (true, Some(bot)) => bot,
            _ => {
                return Err(Error::Transport(format!(
                    "getMe failed: {}",
                    reply.description.unwrap_or_default()
                )))
            }
        };

        tracing::info!(bot = %bot.username.unwrap_or_default(), "Telegram bot authenticated");
        Ok(Box::new(PollConnection {
            client: self.client.clone(),
            api: self.api.clone(),
            inbound: self.inbound.clone(),
            offset: self.offset.clone(),
            poll_timeout: self.poll_timeout,
        }))
    }
}

struct PollConnection {
    client: reqwest::Client,
    api: String,
    inbound: Inbound,
    offset: Arc<AtomicI64>,
    poll_timeout: Duration,
}

#[async_trait]
impl FrameConnection for PollConnection {
    async fn next_event(&mut self) -> Result<LinkEvent> {
        let body = serde_json::json!({
            "offset": self.offset.load(Ordering::SeqCst),
            "timeout": self.poll_timeout.as_secs(),
            "allowed_updates": ["message"],
        });
        let response = self
            .client
            .post(format!("{}/getUpdates", self.api))
            .timeout(self.poll_timeout + Duration::from_secs(10))
            .json(&body)
            .send()
            .await?;

        let reply: ApiReply<Vec<Update>> = response.json().await?;
        if !reply.ok {
            return Err(Error::Transport(format!(
                "getUpdates failed ({}): {}",
                reply.error_code.unwrap_or_default(),
                reply.description.unwrap_or_default()
            )));
        }

        for update in reply.result.unwrap_or_default() {
            self.offset.fetch_max(update.update_id + 1, Ordering::SeqCst);
            match TelegramAdapter::parse_update(&update) {
                Some(message) => {
                    self.inbound.admit(message).await;
                }
                None => tracing::debug!(update_id = update.update_id, "Ignoring Telegram update"),
            }
        }
        Ok(LinkEvent::Frame)
    }
}

/// Bot API response wrapper
#[derive(Debug, Deserialize)]
struct ApiReply<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct BotUser {
    username: Option<String>,
}

/// Telegram update (only the fields the gateway reads)
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub from: Option<TelegramUser>,
    pub chat: TelegramChat,
    pub date: i64,
    pub text: Option<String>,
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub first_name: String,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
}
