//! Resilience primitives shared by all channel adapters
//!
//! - [`ConnectionSupervisor`]: reconnect with backoff and heartbeat for
//!   long-lived connections
//! - [`CredentialCache`]: single-flight access-token refresh
//! - [`DedupWindow`]: bounded redelivery filter
//! - [`RateLimitedSender`]: bounded retry honoring server rate limits

mod credential;
mod dedup;
mod retry;
mod supervisor;

pub use credential::{
    CredentialCache, IssuedToken, TokenSource, DEFAULT_REFRESH_MARGIN, MAX_TOKEN_LIFETIME,
};
pub use dedup::{DedupWindow, DEFAULT_DEDUP_CAPACITY};
pub use retry::{retry_after_header, retry_after_secs, DeliveryPolicy, RateLimitedSender, SendFailure};
pub use supervisor::{
    dial_error, ConnectionState, ConnectionSupervisor, Dialer, FrameConnection, Heartbeat,
    LinkEvent, ReconnectPolicy, MAX_RECONNECT_DELAY_SECS,
};
