//! DingTalk channel adapter
//!
//! Receives robot messages through Stream mode: the gateway opens a
//! WebSocket with client id/secret and DingTalk pushes frames over it.
//! Replies go through the robot send API, authorized with an OAuth access
//! token held in a [`CredentialCache`].

use super::adapter::{AdapterContext, ChannelAdapter};
use super::inbound::{AllowList, Inbound};
use super::ws::{self, WsReader, WsWriter};
use crate::bus::{InboundMessage, OutboundMessage};
use crate::config::{resolve_credential, DingTalkConfig};
use crate::error::{Error, Result};
use crate::format::chunk_message;
use crate::resilience::{
    dial_error, retry_after_header, ConnectionSupervisor, CredentialCache, DedupWindow, Dialer,
    FrameConnection, IssuedToken, LinkEvent, RateLimitedSender, ReconnectPolicy, SendFailure,
    TokenSource,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Longest markdown body sent in one robot message
pub const DINGTALK_MAX_MESSAGE_LEN: usize = 4000;

/// Callback topic carrying robot messages
const BOT_MESSAGE_TOPIC: &str = "/v1.0/im/bot/messages/get";

/// DingTalk channel adapter
pub struct DingTalkAdapter {
    config: DingTalkConfig,
    client: reqwest::Client,
    inbound: Inbound,
    reconnect: ReconnectPolicy,
    sender: RateLimitedSender,
    tokens: CredentialCache,
    dedup: Arc<DedupWindow>,
}

impl DingTalkAdapter {
    /// Create a new DingTalk adapter
    pub fn new(config: DingTalkConfig, ctx: &AdapterContext) -> Self {
        let client = reqwest::Client::new();
        let source = Arc::new(AccessTokenSource {
            client: client.clone(),
            url: format!("{}/v1.0/oauth2/accessToken", config.api_base.trim_end_matches('/')),
            app_key_ref: config.app_key_ref.clone(),
            app_secret_ref: config.app_secret_ref.clone(),
        });
        Self {
            inbound: Inbound::new(AllowList::new(&config.allow_from), ctx.inbound.clone()),
            reconnect: ctx.resilience.reconnect.clone(),
            sender: RateLimitedSender::new("dingtalk", ctx.resilience.delivery.clone()),
            tokens: CredentialCache::with_margin(source, ctx.resilience.credentials.refresh_margin()),
            dedup: Arc::new(DedupWindow::new(config.dedup_capacity)),
            client,
            config,
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    /// Convert a robot callback body
    fn parse_bot_message(data: &BotMessage) -> Option<InboundMessage> {
        let content = data.text.as_ref().map(|t| t.content.trim()).filter(|c| !c.is_empty())?;
        let sender = data
            .sender_staff_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .unwrap_or(&data.sender_id);

        let mut msg = InboundMessage::new("dingtalk", sender, &data.conversation_id, content)
            .with_metadata("message_id", data.msg_id.clone())
            .with_metadata("conversation_type", data.conversation_type.clone())
            .with_metadata("is_group", data.conversation_type == "2")
            .with_metadata("sender_staff_id", sender);
        if let Some(nick) = &data.sender_nick {
            msg = msg.with_metadata("sender_nick", nick.clone());
        }
        if let Some(sent_at) = data.create_at.and_then(chrono::DateTime::from_timestamp_millis) {
            msg.timestamp = sent_at;
        }
        Some(msg)
    }

    /// Endpoint and body for a reply: direct chats go to the user,
    /// everything else to the group conversation.
    fn robot_request(&self, message: &OutboundMessage, text: &str) -> (String, Value) {
        let msg_param = serde_json::json!({ "title": "chatgate", "text": text }).to_string();
        let direct_to = match message.metadata_str("conversation_type") {
            Some("1") => message.metadata_str("sender_staff_id"),
            _ => None,
        };

        match direct_to {
            Some(user_id) => (
                self.api_url("/v1.0/robot/oToMessages/batchSend"),
                serde_json::json!({
                    "robotCode": self.config.robot_code,
                    "userIds": [user_id],
                    "msgKey": "sampleMarkdown",
                    "msgParam": msg_param,
                }),
            ),
            None => (
                self.api_url("/v1.0/robot/groupMessages/send"),
                serde_json::json!({
                    "robotCode": self.config.robot_code,
                    "openConversationId": message.chat_id,
                    "msgKey": "sampleMarkdown",
                    "msgParam": msg_param,
                }),
            ),
        }
    }

    async fn post_once(&self, url: &str, body: &Value) -> Result<()> {
        let token = self.tokens.get_token().await?;
        let client = &self.client;
        let token = token.as_str();
        self.sender
            .send("robot send", || async move {
                let response = client
                    .post(url)
                    .header("x-acs-dingtalk-access-token", token)
                    .json(body)
                    .send()
                    .await?;
                let status = response.status();
                if status.is_success() {
                    return Ok(());
                }
                let retry_after = retry_after_header(response.headers());
                let text = response.text().await.unwrap_or_default();
                Err(SendFailure::from_status(status, retry_after, &text))
            })
            .await
    }
}

#[async_trait]
impl ChannelAdapter for DingTalkAdapter {
    fn name(&self) -> &str {
        "dingtalk"
    }

    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let dialer = StreamDialer {
            client: self.client.clone(),
            open_url: self.api_url("/v1.0/gateway/connections/open"),
            client_id: resolve_credential(&self.config.app_key_ref)?,
            client_secret: resolve_credential(&self.config.app_secret_ref)?,
            inbound: self.inbound.clone(),
            dedup: self.dedup.clone(),
        };

        tracing::info!(robot_code = %self.config.robot_code, "DingTalk adapter starting");
        let supervisor = ConnectionSupervisor::new("dingtalk", self.reconnect.clone());
        supervisor.run(&dialer, &cancel).await
    }

    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        resolve_credential(&self.config.app_key_ref)?;
        resolve_credential(&self.config.app_secret_ref)?;

        for chunk in chunk_message(&message.content, DINGTALK_MAX_MESSAGE_LEN) {
            if chunk.trim().is_empty() {
                continue;
            }
            let (url, body) = self.robot_request(message, &chunk);
            match self.post_once(&url, &body).await {
                Err(Error::Auth(reason)) => {
                    tracing::warn!("DingTalk access token rejected, refreshing: {}", reason);
                    self.tokens.invalidate().await;
                    self.post_once(&url, &body).await?;
                }
                other => other?,
            }
        }
        tracing::debug!(conversation_id = %message.chat_id, "Sent DingTalk message");
        Ok(())
    }
}

/// OAuth access token for the robot API
struct AccessTokenSource {
    client: reqwest::Client,
    url: String,
    app_key_ref: String,
    app_secret_ref: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessTokenReply {
    access_token: String,
    expire_in: u64,
}

#[async_trait]
impl TokenSource for AccessTokenSource {
    async fn fetch(&self) -> Result<IssuedToken> {
        let body = serde_json::json!({
            "appKey": resolve_credential(&self.app_key_ref)?,
            "appSecret": resolve_credential(&self.app_secret_ref)?,
        });
        let response = self.client.post(&self.url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(Error::Auth(format!(
                "DingTalk access token request failed: {}",
                response.status()
            )));
        }
        let reply: AccessTokenReply = response.json().await?;
        Ok(IssuedToken {
            value: reply.access_token,
            expires_in: Duration::from_secs(reply.expire_in),
        })
    }
}

struct StreamDialer {
    client: reqwest::Client,
    open_url: String,
    client_id: String,
    client_secret: String,
    inbound: Inbound,
    dedup: Arc<DedupWindow>,
}

#[derive(Debug, Deserialize)]
struct StreamEndpoint {
    endpoint: String,
    ticket: String,
}

#[async_trait]
impl Dialer for StreamDialer {
    async fn dial(&self) -> Result<Box<dyn FrameConnection>> {
        let body = serde_json::json!({
            "clientId": self.client_id,
            "clientSecret": self.client_secret,
            "subscriptions": [
                { "type": "EVENT", "topic": "*" },
                { "type": "CALLBACK", "topic": BOT_MESSAGE_TOPIC },
            ],
            "ua": concat!("chatgate/", env!("CARGO_PKG_VERSION")),
        });
        let response = self
            .client
            .post(&self.open_url)
            .json(&body)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| Error::Transport(format!("stream open failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(dial_error(Error::Auth(format!("stream open: {}", status))));
        }
        if !status.is_success() {
            return Err(Error::Transport(format!("stream open failed: {}", status)));
        }
        let endpoint: StreamEndpoint = response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("stream open returned invalid JSON: {}", e)))?;

        let url = format!("{}?ticket={}", endpoint.endpoint, endpoint.ticket);
        let (writer, reader) = ws::connect(&url).await?;
        Ok(Box::new(StreamConnection {
            reader,
            writer,
            inbound: self.inbound.clone(),
            dedup: self.dedup.clone(),
        }))
    }
}

/// One pushed frame
#[derive(Debug, Deserialize)]
struct StreamFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    headers: HashMap<String, Value>,
    #[serde(default)]
    data: String,
}

impl StreamFrame {
    fn header(&self, name: &str) -> &str {
        self.headers.get(name).and_then(Value::as_str).unwrap_or_default()
    }
}

/// Robot callback body (only the fields the gateway reads)
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BotMessage {
    msg_id: String,
    conversation_id: String,
    #[serde(default)]
    conversation_type: String,
    #[serde(default)]
    sender_id: String,
    #[serde(default)]
    sender_staff_id: Option<String>,
    #[serde(default)]
    sender_nick: Option<String>,
    #[serde(default)]
    text: Option<BotText>,
    #[serde(default)]
    create_at: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct BotText {
    content: String,
}

struct StreamConnection {
    reader: WsReader,
    writer: WsWriter,
    inbound: Inbound,
    dedup: Arc<DedupWindow>,
}

impl StreamConnection {
    async fn ack(&self, frame: &StreamFrame, data: String) -> Result<()> {
        self.writer
            .send_json(&serde_json::json!({
                "code": 200,
                "headers": {
                    "contentType": "application/json",
                    "messageId": frame.header("messageId"),
                },
                "message": "OK",
                "data": data,
            }))
            .await
    }

    async fn handle(&mut self, frame: StreamFrame) -> Result<LinkEvent> {
        match (frame.kind.as_str(), frame.header("topic")) {
            ("SYSTEM", "ping") => {
                let data = frame.data.clone();
                self.ack(&frame, data).await?;
                Ok(LinkEvent::Frame)
            }
            ("SYSTEM", "disconnect") => {
                tracing::info!("DingTalk asked to reconnect");
                Ok(LinkEvent::Reconnect)
            }
            ("CALLBACK", BOT_MESSAGE_TOPIC) => {
                self.ack(&frame, r#"{"response":null}"#.to_string()).await?;

                let data: BotMessage = match serde_json::from_str(&frame.data) {
                    Ok(data) => data,
                    Err(e) => {
                        tracing::debug!("Dropping malformed DingTalk callback: {}", e);
                        return Ok(LinkEvent::Frame);
                    }
                };
                if self.dedup.seen(&data.msg_id).await {
                    tracing::debug!(msg_id = %data.msg_id, "Dropping duplicate DingTalk message");
                    return Ok(LinkEvent::Frame);
                }
                if let Some(message) = DingTalkAdapter::parse_bot_message(&data) {
                    self.inbound.admit(message).await;
                }
                Ok(LinkEvent::Frame)
            }
            ("EVENT", _) => {
                self.ack(&frame, r#"{"status":"SUCCESS","message":"success"}"#.to_string())
                    .await?;
                Ok(LinkEvent::Frame)
            }
            (kind, topic) => {
                tracing::debug!(kind, topic, "Ignoring DingTalk frame");
                Ok(LinkEvent::Frame)
            }
        }
    }
}

#[async_trait]
impl FrameConnection for StreamConnection {
    async fn next_event(&mut self) -> Result<LinkEvent> {
        loop {
            let Some(text) = ws::next_text(&mut self.reader, &self.writer).await? else {
                return Ok(LinkEvent::Closed);
            };
            match serde_json::from_str::<StreamFrame>(&text) {
                Ok(frame) => return self.handle(frame).await,
                Err(e) => tracing::debug!("Dropping malformed DingTalk frame: {}", e),
            }
        }
    }
}
