//! Feishu (Lark) channel adapter
//!
//! Feishu pushes events to an HTTP callback, so this adapter runs a small
//! axum server instead of a supervised socket. Replies use the IM API with
//! a tenant access token held in a [`CredentialCache`].

use super::adapter::{AdapterContext, ChannelAdapter};
use super::inbound::{AllowList, Inbound};
use crate::bus::{InboundMessage, OutboundMessage};
use crate::config::{resolve_credential, FeishuConfig};
use crate::error::{Error, Result};
use crate::format::chunk_message;
use crate::resilience::{
    retry_after_header, CredentialCache, DedupWindow, IssuedToken, RateLimitedSender, SendFailure,
    TokenSource,
};
use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Longest text body sent in one message
pub const FEISHU_MAX_MESSAGE_LEN: usize = 4000;

/// API codes meaning the tenant token is expired or invalid
const TOKEN_ERRORS: &[i64] = &[99991661, 99991663, 99991668];

/// API code for request frequency limits
const RATE_LIMITED: i64 = 99991400;

/// Feishu channel adapter
pub struct FeishuAdapter {
    config: FeishuConfig,
    client: reqwest::Client,
    inbound: Inbound,
    sender: RateLimitedSender,
    tokens: CredentialCache,
    dedup: Arc<DedupWindow>,
}

impl FeishuAdapter {
    /// Create a new Feishu adapter
    pub fn new(config: FeishuConfig, ctx: &AdapterContext) -> Self {
        let client = reqwest::Client::new();
        let source = Arc::new(TenantTokenSource {
            client: client.clone(),
            url: format!(
                "{}/auth/v3/tenant_access_token/internal",
                config.api_base.trim_end_matches('/')
            ),
            app_id: config.app_id.clone(),
            app_secret_ref: config.app_secret_ref.clone(),
        });
        Self {
            inbound: Inbound::new(AllowList::new(&config.allow_from), ctx.inbound.clone()),
            sender: RateLimitedSender::new("feishu", ctx.resilience.delivery.clone()),
            tokens: CredentialCache::with_margin(source, ctx.resilience.credentials.refresh_margin()),
            dedup: Arc::new(DedupWindow::new(config.dedup_capacity)),
            client,
            config,
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    /// Verify callback signature (SHA256 of timestamp + nonce + encrypt_key + body)
    pub fn verify_signature(
        timestamp: &str,
        nonce: &str,
        encrypt_key: &str,
        body: &str,
        expected: &str,
    ) -> Result<()> {
        let mut hasher = Sha256::new();
        hasher.update(timestamp.as_bytes());
        hasher.update(nonce.as_bytes());
        hasher.update(encrypt_key.as_bytes());
        hasher.update(body.as_bytes());
        let digest = format!("{:x}", hasher.finalize());

        if !digest.eq_ignore_ascii_case(expected.trim()) {
            return Err(Error::Auth("Invalid Feishu signature".to_string()));
        }
        Ok(())
    }

    /// Convert a `im.message.receive_v1` event. Only text messages carry
    /// content the gateway understands.
    pub fn parse_event(event: &FeishuEvent) -> Option<InboundMessage> {
        if event.sender.sender_type == "app" || event.message.message_type != "text" {
            return None;
        }
        let body: TextContent = serde_json::from_str(&event.message.content).ok()?;
        let mut text = body.text;
        for mention in &event.message.mentions {
            text = text.replace(&mention.key, "");
        }
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let message = &event.message;
        let mut msg = InboundMessage::new("feishu", &event.sender.sender_id.open_id, &message.chat_id, text)
            .with_metadata("message_id", message.message_id.clone())
            .with_metadata("chat_type", message.chat_type.clone())
            .with_metadata("is_dm", message.chat_type == "p2p")
            .with_metadata("is_mention", !message.mentions.is_empty());
        if let Some(root_id) = message.root_id.as_deref().filter(|id| !id.is_empty()) {
            msg = msg.with_metadata("root_id", root_id);
        }
        if let Some(sent_at) = message
            .create_time
            .parse::<i64>()
            .ok()
            .and_then(chrono::DateTime::from_timestamp_millis)
        {
            msg.timestamp = sent_at;
        }
        Some(msg)
    }

    /// Serve the event callback on `listener` until `cancel` fires
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        if !self.config.path.starts_with('/') {
            return Err(Error::Config(format!(
                "Feishu callback path '{}' must start with '/'",
                self.config.path
            )));
        }
        let state = Arc::new(CallbackState {
            encrypt_key: optional_credential(self.config.encrypt_key_ref.as_deref())?,
            verification_token: optional_credential(self.config.verification_token_ref.as_deref())?,
            inbound: self.inbound.clone(),
            dedup: self.dedup.clone(),
        });
        let app = Router::new()
            .route(&self.config.path, post(handle_callback))
            .with_state(state);

        tracing::info!(
            addr = ?listener.local_addr().ok(),
            path = %self.config.path,
            "Feishu callback server listening"
        );
        axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await?;
        tracing::info!("Feishu callback server stopped");
        Ok(())
    }

    async fn post_once(&self, url: &str, body: &Value) -> Result<()> {
        let token = self.tokens.get_token().await?;
        let client = &self.client;
        let token = token.as_str();
        self.sender
            .send("im.message.create", || async move {
                let response = client.post(url).bearer_auth(token).json(body).send().await?;
                let status = response.status();
                let retry_after = retry_after_header(response.headers());
                let text = response.text().await.unwrap_or_default();

                let reply: Option<ApiReply> = serde_json::from_str(&text).ok();
                match reply {
                    Some(reply) if reply.code == 0 && status.is_success() => Ok(()),
                    Some(reply) if TOKEN_ERRORS.contains(&reply.code) => {
                        Err(SendFailure::Unauthorized(reply.msg))
                    }
                    Some(reply) if reply.code == RATE_LIMITED => {
                        Err(SendFailure::RateLimited { retry_after })
                    }
                    _ if !status.is_success() => Err(SendFailure::from_status(status, retry_after, &text)),
                    Some(reply) => Err(SendFailure::Rejected(format!("{} ({})", reply.msg, reply.code))),
                    None => Err(SendFailure::Rejected(format!("unexpected reply: {}", text))),
                }
            })
            .await
    }
}

fn optional_credential(credential_ref: Option<&str>) -> Result<Option<String>> {
    credential_ref.map(resolve_credential).transpose()
}

#[async_trait]
impl ChannelAdapter for FeishuAdapter {
    fn name(&self) -> &str {
        "feishu"
    }

    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        resolve_credential(&self.config.app_secret_ref)?;
        let addr: SocketAddr = self.config.listen.parse().map_err(|e| {
            Error::Config(format!("Invalid Feishu listen address '{}': {}", self.config.listen, e))
        })?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Config(format!("Failed to bind Feishu callback on {}: {}", addr, e)))?;

        tracing::info!(app_id = %self.config.app_id, "Feishu adapter starting");
        self.serve(listener, cancel).await
    }

    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        resolve_credential(&self.config.app_secret_ref)?;

        let url = match message.reply_to.as_deref() {
            Some(message_id) => self.api_url(&format!("/im/v1/messages/{}/reply", message_id)),
            None => self.api_url("/im/v1/messages?receive_id_type=chat_id"),
        };

        for chunk in chunk_message(&message.content, FEISHU_MAX_MESSAGE_LEN) {
            if chunk.trim().is_empty() {
                continue;
            }
            let body = serde_json::json!({
                "receive_id": message.chat_id,
                "msg_type": "text",
                "content": serde_json::json!({ "text": chunk }).to_string(),
            });
            match self.post_once(&url, &body).await {
                Err(Error::Auth(reason)) => {
                    tracing::warn!("Feishu tenant token rejected, refreshing: {}", reason);
                    self.tokens.invalidate().await;
                    self.post_once(&url, &body).await?;
                }
                other => other?,
            }
        }
        tracing::debug!(chat_id = %message.chat_id, "Sent Feishu message");
        Ok(())
    }
}

struct CallbackState {
    encrypt_key: Option<String>,
    verification_token: Option<String>,
    inbound: Inbound,
    dedup: Arc<DedupWindow>,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or_default()
}

async fn handle_callback(
    State(state): State<Arc<CallbackState>>,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, Json<Value>) {
    let ok = (StatusCode::OK, Json(serde_json::json!({})));

    if let Some(key) = &state.encrypt_key {
        let verified = FeishuAdapter::verify_signature(
            header(&headers, "x-lark-request-timestamp"),
            header(&headers, "x-lark-request-nonce"),
            key,
            &body,
            header(&headers, "x-lark-signature"),
        );
        if let Err(e) = verified {
            tracing::warn!("Rejecting Feishu callback: {}", e);
            return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"msg": "invalid signature"})));
        }
    }

    let payload: CallbackPayload = match serde_json::from_str(&body) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::debug!("Malformed Feishu callback: {}", e);
            return (StatusCode::BAD_REQUEST, Json(serde_json::json!({"msg": "malformed body"})));
        }
    };

    if payload.encrypt.is_some() {
        tracing::warn!("Encrypted Feishu callbacks are not supported; disable event encryption");
        return (StatusCode::BAD_REQUEST, Json(serde_json::json!({"msg": "encrypted payload"})));
    }

    let token = payload
        .header
        .as_ref()
        .map(|h| h.token.as_str())
        .or(payload.token.as_deref())
        .unwrap_or_default();
    if let Some(expected) = &state.verification_token {
        if token != expected {
            tracing::warn!("Rejecting Feishu callback with wrong verification token");
            return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"msg": "invalid token"})));
        }
    }

    if payload.kind.as_deref() == Some("url_verification") {
        let challenge = payload.challenge.unwrap_or_default();
        return (StatusCode::OK, Json(serde_json::json!({ "challenge": challenge })));
    }

    let event_type = payload.header.as_ref().map(|h| h.event_type.as_str()).unwrap_or_default();
    if event_type != "im.message.receive_v1" {
        tracing::debug!(event_type, "Ignoring Feishu event");
        return ok;
    }

    let event: FeishuEvent = match payload.event.map(serde_json::from_value).transpose() {
        Ok(Some(event)) => event,
        Ok(None) | Err(_) => {
            tracing::debug!("Feishu message event without a readable body");
            return ok;
        }
    };

    if state.dedup.seen(&event.message.message_id).await {
        tracing::debug!(message_id = %event.message.message_id, "Dropping duplicate Feishu event");
        return ok;
    }
    if let Some(message) = FeishuAdapter::parse_event(&event) {
        state.inbound.admit(message).await;
    }
    ok
}

/// Tenant access token for the IM API
struct TenantTokenSource {
    client: reqwest::Client,
    url: String,
    app_id: String,
    app_secret_ref: String,
}

#[derive(Debug, Deserialize)]
struct TenantTokenReply {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    tenant_access_token: String,
    #[serde(default)]
    expire: u64,
}

#[async_trait]
impl TokenSource for TenantTokenSource {
    async fn fetch(&self) -> Result<IssuedToken> {
        let body = serde_json::json!({
            "app_id": self.app_id,
            "app_secret": resolve_credential(&self.app_secret_ref)?,
        });
        let reply: TenantTokenReply = self.client.post(&self.url).json(&body).send().await?.json().await?;
        if reply.code != 0 {
            return Err(Error::Auth(format!(
                "Feishu token API error: {} ({})",
                reply.msg, reply.code
            )));
        }
        Ok(IssuedToken {
            value: reply.tenant_access_token,
            expires_in: Duration::from_secs(reply.expire),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApiReply {
    code: i64,
    #[serde(default)]
    msg: String,
}

/// Callback envelope, covering both the v1 challenge and v2 event schema
#[derive(Debug, Deserialize)]
struct CallbackPayload {
    #[serde(rename = "type")]
    kind: Option<String>,
    challenge: Option<String>,
    token: Option<String>,
    encrypt: Option<String>,
    header: Option<EventHeader>,
    event: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct EventHeader {
    #[serde(default)]
    event_type: String,
    #[serde(default)]
    token: String,
}

#[derive(Debug, Deserialize)]
struct TextContent {
    text: String,
}

/// Feishu event structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeishuEvent {
    pub sender: FeishuSender,
    pub message: FeishuMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeishuSender {
    pub sender_id: FeishuUserId,
    #[serde(default)]
    pub sender_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeishuUserId {
    pub open_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeishuMessage {
    pub message_id: String,
    #[serde(default)]
    pub root_id: Option<String>,
    pub chat_id: String,
    pub chat_type: String,
    pub message_type: String,
    pub content: String,
    #[serde(default)]
    pub create_time: String,
    #[serde(default)]
    pub mentions: Vec<FeishuMention>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeishuMention {
    pub key: String,
    pub id: FeishuUserId,
}
