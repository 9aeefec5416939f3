//! Slack channel adapter (Socket Mode)

use super::adapter::{AdapterContext, ChannelAdapter};
use super::inbound::{AllowList, Inbound};
use super::ws::{self, WsReader, WsWriter};
use crate::bus::{InboundMessage, OutboundMessage};
use crate::config::{resolve_credential, SlackConfig};
use crate::error::{Error, Result};
use crate::format::{chunk_message, transform, SlackMrkdwn};
use crate::resilience::{
    dial_error, retry_after_header, ConnectionSupervisor, DedupWindow, Dialer, FrameConnection,
    LinkEvent, RateLimitedSender, ReconnectPolicy, SendFailure,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Longest text sent in one `chat.postMessage`
pub const SLACK_MAX_MESSAGE_LEN: usize = 4000;

/// Slack errors that mean the token itself is wrong
const AUTH_ERRORS: &[&str] = &[
    "invalid_auth",
    "not_authed",
    "account_inactive",
    "token_revoked",
    "not_allowed_token_type",
];

/// Slack channel adapter
pub struct SlackAdapter {
    config: SlackConfig,
    client: reqwest::Client,
    inbound: Inbound,
    reconnect: ReconnectPolicy,
    sender: RateLimitedSender,
    /// Shared across reconnects: Slack redelivers unacked envelopes on a new socket
    dedup: Arc<DedupWindow>,
}

impl SlackAdapter {
    /// Create a new Slack adapter
    pub fn new(config: SlackConfig, ctx: &AdapterContext) -> Self {
        Self {
            inbound: Inbound::new(AllowList::new(&config.allow_from), ctx.inbound.clone()),
            client: reqwest::Client::new(),
            reconnect: ctx.resilience.reconnect.clone(),
            sender: RateLimitedSender::new("slack", ctx.resilience.delivery.clone()),
            dedup: Arc::new(DedupWindow::new(config.dedup_capacity)),
            config,
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/{}", self.config.api_base.trim_end_matches('/'), method)
    }

    /// Convert a `message` or `app_mention` event. Bot messages, edits and
    /// other subtypes yield `None`.
    fn parse_event(event: &Value) -> Option<InboundMessage> {
        let kind = event.get("type").and_then(Value::as_str)?;
        if kind != "message" && kind != "app_mention" {
            return None;
        }
        if event.get("subtype").is_some() || event.get("bot_id").is_some() {
            return None;
        }

        let user = event.get("user").and_then(Value::as_str)?;
        let channel = event.get("channel").and_then(Value::as_str)?;
        let text = event.get("text").and_then(Value::as_str).filter(|t| !t.is_empty())?;
        let ts = event.get("ts").and_then(Value::as_str).unwrap_or_default();

        let mut msg = InboundMessage::new("slack", user, channel, text)
            .with_metadata("message_id", ts)
            .with_metadata("is_dm", event.get("channel_type").and_then(Value::as_str) == Some("im"));
        if let Some(team) = event.get("team").and_then(Value::as_str) {
            msg = msg.with_metadata("team", team);
        }
        if let Some(thread_ts) = event.get("thread_ts").and_then(Value::as_str) {
            msg = msg
                .with_metadata("thread_ts", thread_ts)
                .with_session_key(format!("slack:{}:{}", channel, thread_ts));
        }
        if let Some(sent_at) = ts
            .split('.')
            .next()
            .and_then(|secs| secs.parse::<i64>().ok())
            .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        {
            msg.timestamp = sent_at;
        }
        Some(msg)
    }

    async fn post_message(&self, token: &str, channel: &str, text: &str, thread_ts: Option<&str>) -> Result<()> {
        let url = self.api_url("chat.postMessage");
        let mut body = serde_json::json!({
            "channel": channel,
            "text": text,
            "mrkdwn": true,
        });
        if let Some(thread_ts) = thread_ts {
            body["thread_ts"] = thread_ts.into();
        }

        let client = &self.client;
        let (url, body) = (&url, &body);
        self.sender
            .send("chat.postMessage", || async move {
                let response = client.post(url).bearer_auth(token).json(body).send().await?;
                let status = response.status();
                let retry_after = retry_after_header(response.headers());
                if !status.is_success() {
                    let text = response.text().await.unwrap_or_default();
                    return Err(SendFailure::from_status(status, retry_after, &text));
                }

                let reply: ApiReply = response.json().await?;
                if reply.ok {
                    return Ok(());
                }
                let error = reply.error.unwrap_or_default();
                Err(if error == "ratelimited" {
                    SendFailure::RateLimited { retry_after }
                } else if AUTH_ERRORS.contains(&error.as_str()) {
                    SendFailure::Unauthorized(error)
                } else {
                    SendFailure::Rejected(error)
                })
            })
            .await
    }
}

#[async_trait]
impl ChannelAdapter for SlackAdapter {
    fn name(&self) -> &str {
        "slack"
    }

    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let app_token = resolve_credential(&self.config.app_token_ref)?;
        resolve_credential(&self.config.bot_token_ref)?;

        let dialer = SocketDialer {
            client: self.client.clone(),
            open_url: self.api_url("apps.connections.open"),
            app_token,
            inbound: self.inbound.clone(),
            dedup: self.dedup.clone(),
        };

        tracing::info!("Slack adapter starting");
        let supervisor = ConnectionSupervisor::new("slack", self.reconnect.clone());
        supervisor.run(&dialer, &cancel).await
    }

    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        let token = resolve_credential(&self.config.bot_token_ref)?;
        let thread_ts = message
            .metadata_str("thread_ts")
            .or(message.reply_to.as_deref());

        for chunk in chunk_message(&message.content, SLACK_MAX_MESSAGE_LEN) {
            if chunk.trim().is_empty() {
                continue;
            }
            let text = transform(&chunk, &SlackMrkdwn);
            self.post_message(&token, &message.chat_id, &text, thread_ts).await?;
        }
        tracing::debug!(channel_id = %message.chat_id, "Sent Slack message");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ApiReply {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

struct SocketDialer {
    client: reqwest::Client,
    open_url: String,
    app_token: String,
    inbound: Inbound,
    dedup: Arc<DedupWindow>,
}

#[async_trait]
impl Dialer for SocketDialer {
    async fn dial(&self) -> Result<Box<dyn FrameConnection>> {
        let reply: ApiReply = self
            .client
            .post(&self.open_url)
            .bearer_auth(&self.app_token)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| Error::Transport(format!("apps.connections.open failed: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::Transport(format!("apps.connections.open returned invalid JSON: {}", e)))?;

        let url = match (reply.ok, reply.url) {
            (true, Some(url)) => url,
            _ => {
                let error = reply.error.unwrap_or_default();
                return Err(if AUTH_ERRORS.contains(&error.as_str()) {
                    dial_error(Error::Auth(format!("apps.connections.open: {}", error)))
                } else {
                    Error::Transport(format!("apps.connections.open: {}", error))
                });
            }
        };

        let (writer, reader) = ws::connect(&url).await?;
        Ok(Box::new(SocketConnection {
            reader,
            writer,
            inbound: self.inbound.clone(),
            dedup: self.dedup.clone(),
        }))
    }
}

struct SocketConnection {
    reader: WsReader,
    writer: WsWriter,
    inbound: Inbound,
    dedup: Arc<DedupWindow>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    envelope_id: Option<String>,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    reason: Option<String>,
}

impl SocketConnection {
    async fn handle(&mut self, envelope: Envelope) -> Result<LinkEvent> {
        // Unacked envelopes are redelivered, so ack before doing any work
        if let Some(envelope_id) = &envelope.envelope_id {
            self.writer
                .send_json(&serde_json::json!({ "envelope_id": envelope_id }))
                .await?;
        }

        match envelope.kind.as_str() {
            "hello" => {
                tracing::info!("Slack socket connected");
                Ok(LinkEvent::Frame)
            }
            "disconnect" => {
                tracing::info!(reason = envelope.reason.as_deref().unwrap_or_default(), "Slack asked to reconnect");
                Ok(LinkEvent::Reconnect)
            }
            "events_api" => {
                let Some(event) = envelope.payload.get("event") else {
                    return Ok(LinkEvent::Frame);
                };
                let Some(message) = SlackAdapter::parse_event(event) else {
                    return Ok(LinkEvent::Frame);
                };

                // `message` and `app_mention` arrive separately for one post
                let key = format!(
                    "{}:{}",
                    message.chat_id,
                    message.metadata.get("message_id").and_then(Value::as_str).unwrap_or_default()
                );
                if self.dedup.seen(&key).await {
                    tracing::debug!(key = %key, "Dropping duplicate Slack event");
                    return Ok(LinkEvent::Frame);
                }
                self.inbound.admit(message).await;
                Ok(LinkEvent::Frame)
            }
            other => {
                tracing::debug!(kind = other, "Ignoring Slack envelope");
                Ok(LinkEvent::Frame)
            }
        }
    }
}

#[async_trait]
impl FrameConnection for SocketConnection {
    async fn next_event(&mut self) -> Result<LinkEvent> {
        loop {
            let Some(text) = ws::next_text(&mut self.reader, &self.writer).await? else {
                return Ok(LinkEvent::Closed);
            };
            match serde_json::from_str::<Envelope>(&text) {
                Ok(envelope) => return self.handle(envelope).await,
                Err(e) => tracing::debug!("Dropping malformed Slack envelope: {}", e),
            }
        }
    }
}
