//! Bounded retry for outbound platform requests
//!
//! Transport failures are retried after a short fixed delay; rate-limit
//! responses are retried after the wait the server asked for. Both count
//! against the same attempt bound.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// How a single send attempt failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendFailure {
    /// Network-level failure or 5xx; worth retrying
    Transport(String),
    /// Server asked the client to slow down
    RateLimited { retry_after: Option<Duration> },
    /// Credential rejected; the caller should refresh and resend
    Unauthorized(String),
    /// Request refused for a reason retrying will not fix
    Rejected(String),
}

impl SendFailure {
    /// Classify an HTTP status that is not a success
    pub fn from_status(status: reqwest::StatusCode, retry_after: Option<Duration>, body: &str) -> Self {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            SendFailure::RateLimited { retry_after }
        } else if status == reqwest::StatusCode::UNAUTHORIZED {
            SendFailure::Unauthorized(format!("{}: {}", status, body))
        } else if status.is_server_error() {
            SendFailure::Transport(format!("{}: {}", status, body))
        } else {
            SendFailure::Rejected(format!("{}: {}", status, body))
        }
    }
}

impl From<reqwest::Error> for SendFailure {
    fn from(e: reqwest::Error) -> Self {
        SendFailure::Transport(e.to_string())
    }
}

/// Parse a `Retry-After` header given in seconds
pub fn retry_after_header(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .and_then(retry_after_secs)
}

/// Convert a server-supplied wait in seconds. Negative, non-finite and
/// unrepresentable values yield `None`.
pub fn retry_after_secs(secs: f64) -> Option<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}

/// Retry limits for outbound sends
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay after a transport failure (milliseconds)
    pub retry_delay_ms: u64,
    /// Wait after a rate limit without a server-supplied duration (seconds)
    pub rate_limit_wait_secs: u64,
    /// Upper bound on any server-supplied wait (seconds)
    pub max_retry_after_secs: u64,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 1000,
            rate_limit_wait_secs: 5,
            max_retry_after_secs: 60,
        }
    }
}

/// Wraps a send function with bounded retries.
#[derive(Debug, Clone)]
pub struct RateLimitedSender {
    channel: String,
    policy: DeliveryPolicy,
}

impl RateLimitedSender {
    /// Create a sender for `channel` (used in logs)
    pub fn new(channel: &str, policy: DeliveryPolicy) -> Self {
        Self {
            channel: channel.to_string(),
            policy,
        }
    }

    /// Run `request` until it succeeds, fails terminally, or the attempt
    /// bound is reached.
    pub async fn send<T, F, Fut>(&self, operation: &str, mut request: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, SendFailure>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let failure = match request().await {
                Ok(value) => return Ok(value),
                Err(failure) => failure,
            };

            let wait = match &failure {
                SendFailure::Rejected(reason) => {
                    return Err(Error::Channel(format!("{} {} rejected: {}", self.channel, operation, reason)));
                }
                SendFailure::Unauthorized(reason) => {
                    return Err(Error::Auth(format!("{} {} unauthorized: {}", self.channel, operation, reason)));
                }
                SendFailure::Transport(_) => Duration::from_millis(self.policy.retry_delay_ms),
                SendFailure::RateLimited { retry_after } => retry_after
                    .unwrap_or_else(|| Duration::from_secs(self.policy.rate_limit_wait_secs))
                    .min(Duration::from_secs(self.policy.max_retry_after_secs)),
            };

            if attempt >= max_attempts {
                tracing::warn!(
                    channel = %self.channel,
                    operation,
                    attempt,
                    "Giving up after {} attempts: {:?}",
                    attempt,
                    failure
                );
                return Err(match failure {
                    SendFailure::RateLimited { retry_after } => Error::RateLimit {
                        message: format!("{} {} still rate limited after {} attempts", self.channel, operation, attempt),
                        retry_after,
                    },
                    other => Error::Transport(format!(
                        "{} {} failed after {} attempts: {:?}",
                        self.channel, operation, attempt, other
                    )),
                });
            }

            tracing::warn!(
                channel = %self.channel,
                operation,
                attempt,
                max_attempts,
                wait_ms = wait.as_millis() as u64,
                "Send failed, retrying: {:?}",
                failure
            );
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn sender() -> RateLimitedSender {
        RateLimitedSender::new("test", DeliveryPolicy::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_honors_retry_after_once() {
        let attempts = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let counter = attempts.clone();
        let result = sender()
            .send("sendMessage", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(SendFailure::RateLimited {
                            retry_after: Some(Duration::from_secs(2)),
                        })
                    } else {
                        Ok("sent")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, "sent");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_wait_without_retry_after() {
        let attempts = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let counter = attempts.clone();
        sender()
            .send("post", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(SendFailure::RateLimited { retry_after: None })
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_errors_exhaust_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let err = sender()
            .send("post", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(SendFailure::Transport("connection reset".to_string()))
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limits_count_against_bound() {
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let err = sender()
            .send("post", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(SendFailure::RateLimited {
                        retry_after: Some(Duration::from_secs(1)),
                    })
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::RateLimit { .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejected_is_terminal() {
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let err = sender()
            .send("post", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(SendFailure::Rejected("chat not found".to_string()))
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Channel(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_from_status() {
        use reqwest::StatusCode;
        assert_eq!(
            SendFailure::from_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(1)), ""),
            SendFailure::RateLimited {
                retry_after: Some(Duration::from_secs(1))
            }
        );
        assert!(matches!(
            SendFailure::from_status(StatusCode::BAD_GATEWAY, None, "upstream"),
            SendFailure::Transport(_)
        ));
        assert!(matches!(
            SendFailure::from_status(StatusCode::UNAUTHORIZED, None, ""),
            SendFailure::Unauthorized(_)
        ));
        assert!(matches!(
            SendFailure::from_status(StatusCode::FORBIDDEN, None, "missing scope"),
            SendFailure::Rejected(_)
        ));
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert_eq!(retry_after_header(&headers), None);

        headers.insert(reqwest::header::RETRY_AFTER, "3".parse().unwrap());
        assert_eq!(retry_after_header(&headers), Some(Duration::from_secs(3)));

        headers.insert(reqwest::header::RETRY_AFTER, "soon".parse().unwrap());
        assert_eq!(retry_after_header(&headers), None);

        headers.insert(reqwest::header::RETRY_AFTER, "1e30".parse().unwrap());
        assert_eq!(retry_after_header(&headers), None);

        headers.insert(reqwest::header::RETRY_AFTER, "-1".parse().unwrap());
        assert_eq!(retry_after_header(&headers), None);
    }

    #[test]
    fn test_retry_after_secs_bounds() {
        assert_eq!(retry_after_secs(0.5), Some(Duration::from_millis(500)));
        assert_eq!(retry_after_secs(1e30), None);
        assert_eq!(retry_after_secs(f64::NAN), None);
        assert_eq!(retry_after_secs(f64::INFINITY), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_retry_after_is_capped() {
        let attempts = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let counter = attempts.clone();
        sender()
            .send("post", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(SendFailure::RateLimited {
                            retry_after: Some(Duration::from_secs(3600)),
                        })
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        let elapsed = started.elapsed();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(elapsed >= Duration::from_secs(60));
        assert!(elapsed < Duration::from_secs(3600));
    }
}
