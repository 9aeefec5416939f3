//! chatgate error types

use std::time::Duration;
use thiserror::Error;

/// chatgate error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error. Fatal: the adapter refuses to start.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport error (network, dial, read). Recovered by reconnect backoff.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Authentication error. Recovered by refreshing the cached credential.
    #[error("Auth error: {0}")]
    Auth(String),

    /// The remote service kept rate limiting past the retry bound
    #[error("Rate limit exceeded: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Outbound message addressed to a channel that is not registered
    #[error("No adapter registered for channel '{0}'")]
    UnknownRoute(String),

    /// Channel reported a delivery failure
    #[error("Channel error: {0}")]
    Channel(String),

    /// Message bus error (closed queue, second subscriber)
    #[error("Bus error: {0}")]
    Bus(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl Error {
    /// Whether retrying can never succeed without operator intervention.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_))
    }
}

/// Result type alias for chatgate operations
pub type Result<T> = std::result::Result<T, Error>;
