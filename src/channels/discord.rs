//! Discord channel adapter
//!
//! Receives over the Gateway WebSocket under the connection supervisor.
//! HELLO carries the heartbeat interval and is answered with IDENTIFY;
//! RECONNECT (op 7) and INVALID_SESSION (op 9) make the supervisor re-dial.
//! Sends go through the REST API.

use super::adapter::{AdapterContext, ChannelAdapter};
use super::inbound::{AllowList, Inbound};
use super::ws::{self, WsReader, WsWriter};
use crate::bus::{InboundMessage, OutboundMessage};
use crate::config::{resolve_credential, DiscordConfig};
use crate::error::{Error, Result};
use crate::format::chunk_message;
use crate::resilience::{
    retry_after_header, retry_after_secs, ConnectionSupervisor, Dialer, FrameConnection, Heartbeat, LinkEvent,
    RateLimitedSender, ReconnectPolicy, SendFailure,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Discord message size limit (characters)
pub const DISCORD_MAX_MESSAGE_LEN: usize = 2000;

const OP_DISPATCH: u8 = 0;
const OP_HEARTBEAT: u8 = 1;
const OP_IDENTIFY: u8 = 2;
const OP_RECONNECT: u8 = 7;
const OP_INVALID_SESSION: u8 = 9;
const OP_HELLO: u8 = 10;
const OP_HEARTBEAT_ACK: u8 = 11;

/// Discord channel adapter
pub struct DiscordAdapter {
    config: DiscordConfig,
    client: reqwest::Client,
    inbound: Inbound,
    reconnect: ReconnectPolicy,
    sender: RateLimitedSender,
}

impl DiscordAdapter {
    /// Create a new Discord adapter
    pub fn new(config: DiscordConfig, ctx: &AdapterContext) -> Self {
        Self {
            inbound: Inbound::new(AllowList::new(&config.allow_from), ctx.inbound.clone()),
            client: reqwest::Client::new(),
            reconnect: ctx.resilience.reconnect.clone(),
            sender: RateLimitedSender::new("discord", ctx.resilience.delivery.clone()),
            config,
        }
    }

    /// Convert a MESSAGE_CREATE payload; messages from bots (including this
    /// one) and empty messages yield `None`.
    fn parse_message_create(d: &Value) -> Option<InboundMessage> {
        let author = d.get("author")?;
        if author.get("bot").and_then(Value::as_bool).unwrap_or(false) {
            return None;
        }
        let content = d.get("content").and_then(Value::as_str).filter(|c| !c.is_empty())?;
        let author_id = author.get("id").and_then(Value::as_str)?;
        let channel_id = d.get("channel_id").and_then(Value::as_str)?;
        let message_id = d.get("id").and_then(Value::as_str).unwrap_or_default();

        let sender_id = match author.get("username").and_then(Value::as_str) {
            Some(username) => format!("{}|{}", author_id, username),
            None => author_id.to_string(),
        };

        let mut msg = InboundMessage::new("discord", &sender_id, channel_id, content)
            .with_metadata("message_id", message_id)
            .with_metadata("is_dm", d.get("guild_id").is_none());
        if let Some(guild_id) = d.get("guild_id").and_then(Value::as_str) {
            msg = msg.with_metadata("guild_id", guild_id);
        }
        if let Some(sent_at) = d
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
        {
            msg.timestamp = sent_at.with_timezone(&chrono::Utc);
        }
        Some(msg)
    }

    async fn post_message(&self, token: &str, channel_id: &str, content: &str, reply_to: Option<&str>) -> Result<()> {
        let url = format!(
            "{}/channels/{}/messages",
            self.config.api_base.trim_end_matches('/'),
            channel_id
        );
        let mut body = serde_json::json!({ "content": content });
        if let Some(message_id) = reply_to {
            body["message_reference"] = serde_json::json!({
                "message_id": message_id,
                "fail_if_not_exists": false,
            });
        }

        let client = &self.client;
        let auth = format!("Bot {}", token);
        let (url, body, auth) = (&url, &body, &auth);
        self.sender
            .send("createMessage", || async move {
                let response = client
                    .post(url)
                    .header("Authorization", auth)
                    .json(body)
                    .send()
                    .await?;
                let status = response.status();
                if status.is_success() {
                    return Ok(());
                }
                let header_wait = retry_after_header(response.headers());
                let text = response.text().await.unwrap_or_default();
                let retry_after = header_wait.or_else(|| body_retry_after(&text));
                Err(SendFailure::from_status(status, retry_after, &text))
            })
            .await
    }
}

/// `retry_after` from a 429 JSON body, in seconds
fn body_retry_after(text: &str) -> Option<Duration> {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v.get("retry_after").and_then(Value::as_f64))
        .and_then(retry_after_secs)
}

#[async_trait]
impl ChannelAdapter for DiscordAdapter {
    fn name(&self) -> &str {
        "discord"
    }

    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let token = resolve_credential(&self.config.bot_token_ref)?;
        let dialer = GatewayDialer {
            client: self.client.clone(),
            api_base: self.config.api_base.trim_end_matches('/').to_string(),
            token,
            intents: self.config.intents,
            inbound: self.inbound.clone(),
        };

        tracing::info!(intents = self.config.intents, "Discord adapter starting");
        let supervisor = ConnectionSupervisor::new("discord", self.reconnect.clone());
        supervisor.run(&dialer, &cancel).await
    }

    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        let token = resolve_credential(&self.config.bot_token_ref)?;
        for (i, chunk) in chunk_message(&message.content, DISCORD_MAX_MESSAGE_LEN)
            .iter()
            .enumerate()
        {
            if chunk.trim().is_empty() {
                continue;
            }
            let reply_to = if i == 0 { message.reply_to.as_deref() } else { None };
            self.post_message(&token, &message.chat_id, chunk, reply_to).await?;
        }
        tracing::debug!(channel_id = %message.chat_id, "Sent Discord message");
        Ok(())
    }
}

struct GatewayDialer {
    client: reqwest::Client,
    api_base: String,
    token: String,
    intents: u64,
    inbound: Inbound,
}

#[derive(Debug, Deserialize)]
struct GatewayBot {
    url: String,
}

#[async_trait]
impl Dialer for GatewayDialer {
    async fn dial(&self) -> Result<Box<dyn FrameConnection>> {
        let response = self
            .client
            .get(format!("{}/gateway/bot", self.api_base))
            .header("Authorization", format!("Bot {}", self.token))
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| Error::Transport(format!("gateway lookup failed: {}", e)))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::Config("Discord rejected the bot token".to_string()));
        }
        if !response.status().is_success() {
            return Err(Error::Transport(format!("gateway lookup failed: {}", response.status())));
        }
        let gateway: GatewayBot = response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("gateway lookup returned invalid JSON: {}", e)))?;

        let url = format!("{}/?v=10&encoding=json", gateway.url.trim_end_matches('/'));
        let (writer, reader) = ws::connect(&url).await?;
        Ok(Box::new(GatewayConnection::new(
            reader,
            writer,
            self.token.clone(),
            self.intents,
            self.inbound.clone(),
        )))
    }
}

struct GatewayConnection {
    reader: WsReader,
    writer: WsWriter,
    token: String,
    intents: u64,
    inbound: Inbound,
    /// Last dispatch sequence number, -1 before the first one
    sequence: Arc<AtomicI64>,
}

#[derive(Debug, Deserialize)]
struct GatewayPayload {
    op: u8,
    #[serde(default)]
    d: Value,
    #[serde(default)]
    s: Option<i64>,
    #[serde(default)]
    t: Option<String>,
}

impl GatewayConnection {
    fn new(reader: WsReader, writer: WsWriter, token: String, intents: u64, inbound: Inbound) -> Self {
        Self {
            reader,
            writer,
            token,
            intents,
            inbound,
            sequence: Arc::new(AtomicI64::new(-1)),
        }
    }

    fn heartbeat_payload(sequence: &AtomicI64) -> Value {
        let seq = sequence.load(Ordering::SeqCst);
        let d = if seq < 0 { Value::Null } else { Value::from(seq) };
        serde_json::json!({ "op": OP_HEARTBEAT, "d": d })
    }

    async fn identify(&self) -> Result<()> {
        self.writer
            .send_json(&serde_json::json!({
                "op": OP_IDENTIFY,
                "d": {
                    "token": self.token,
                    "intents": self.intents,
                    "properties": {
                        "os": std::env::consts::OS,
                        "browser": "chatgate",
                        "device": "chatgate",
                    },
                },
            }))
            .await
    }

    async fn handle(&mut self, payload: GatewayPayload) -> Result<LinkEvent> {
        if let Some(seq) = payload.s {
            self.sequence.store(seq, Ordering::SeqCst);
        }

        match payload.op {
            OP_HELLO => {
                let interval = payload
                    .d
                    .get("heartbeat_interval")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| Error::Transport("HELLO without heartbeat_interval".to_string()))?;
                self.identify().await?;
                Ok(LinkEvent::HeartbeatInterval(Duration::from_millis(interval)))
            }
            OP_DISPATCH => {
                match payload.t.as_deref() {
                    Some("READY") => {
                        let user = payload.d.pointer("/user/username").and_then(Value::as_str);
                        tracing::info!(user = user.unwrap_or_default(), "Discord gateway ready");
                    }
                    Some("MESSAGE_CREATE") => {
                        if let Some(message) = DiscordAdapter::parse_message_create(&payload.d) {
                            self.inbound.admit(message).await;
                        }
                    }
                    _ => {}
                }
                Ok(LinkEvent::Frame)
            }
            OP_HEARTBEAT => {
                self.writer
                    .send_json(&Self::heartbeat_payload(&self.sequence))
                    .await?;
                Ok(LinkEvent::Frame)
            }
            OP_HEARTBEAT_ACK => Ok(LinkEvent::Frame),
            OP_RECONNECT => Ok(LinkEvent::Reconnect),
            OP_INVALID_SESSION => {
                tracing::warn!("Discord session invalidated");
                Ok(LinkEvent::Reconnect)
            }
            other => {
                tracing::debug!(op = other, "Ignoring Discord gateway opcode");
                Ok(LinkEvent::Frame)
            }
        }
    }
}

#[async_trait]
impl FrameConnection for GatewayConnection {
    async fn next_event(&mut self) -> Result<LinkEvent> {
        loop {
            let Some(text) = ws::next_text(&mut self.reader, &self.writer).await? else {
                return Ok(LinkEvent::Closed);
            };
            match serde_json::from_str::<GatewayPayload>(&text) {
                Ok(payload) => return self.handle(payload).await,
                Err(e) => tracing::debug!("Dropping malformed Discord payload: {}", e),
            }
        }
    }

    fn heartbeat(&self) -> Option<Arc<dyn Heartbeat>> {
        Some(Arc::new(GatewayHeartbeat {
            writer: self.writer.clone(),
            sequence: self.sequence.clone(),
        }))
    }
}

struct GatewayHeartbeat {
    writer: WsWriter,
    sequence: Arc<AtomicI64>,
}

#[async_trait]
impl Heartbeat for GatewayHeartbeat {
    async fn beat(&self) -> Result<()> {
        self.writer
            .send_json(&GatewayConnection::heartbeat_payload(&self.sequence))
            .await
    }
}
