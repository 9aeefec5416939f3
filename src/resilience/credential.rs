//! Lazily refreshed access-token cache
//!
//! Platform APIs (Feishu tenant tokens, DingTalk OAuth tokens) hand out
//! short-lived bearer tokens. The cache keeps one per adapter and refreshes
//! it on demand. Concurrent callers that find it stale share a single
//! in-flight refresh.

use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Default safety margin subtracted from the token expiry.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Longest lifetime the cache will trust, whatever the platform reports.
pub const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// A freshly issued token and its lifetime
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub value: String,
    pub expires_in: Duration,
}

/// Platform callback that obtains a new token
#[async_trait]
pub trait TokenSource: Send + Sync + 'static {
    /// Request a new token from the platform
    async fn fetch(&self) -> Result<IssuedToken>;
}

#[derive(Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self, margin: Duration) -> bool {
        Instant::now()
            .checked_add(margin)
            .is_some_and(|deadline| deadline < self.expires_at)
    }
}

type RefreshOutcome = std::result::Result<IssuedToken, Arc<Error>>;
type RefreshFuture = Shared<BoxFuture<'static, RefreshOutcome>>;

struct CacheState {
    token: Option<CachedToken>,
    in_flight: Option<(u64, RefreshFuture)>,
    generation: u64,
}

/// Single-flight token cache
pub struct CredentialCache {
    source: Arc<dyn TokenSource>,
    margin: Duration,
    state: Mutex<CacheState>,
}

impl CredentialCache {
    /// Create a cache backed by `source`
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self::with_margin(source, DEFAULT_REFRESH_MARGIN)
    }

    /// Create a cache that treats tokens as stale `margin` before expiry
    pub fn with_margin(source: Arc<dyn TokenSource>, margin: Duration) -> Self {
        Self {
            source,
            margin,
            state: Mutex::new(CacheState {
                token: None,
                in_flight: None,
                generation: 0,
            }),
        }
    }

    /// Return a valid token, refreshing it first if needed.
    ///
    /// A refresh failure is reported to every caller waiting on that refresh
    /// as [`Error::Auth`]; the next call starts a new refresh.
    pub async fn get_token(&self) -> Result<String> {
        let (generation, refresh) = {
            let mut state = self.state.lock().await;
            if let Some(token) = state.token.as_ref().filter(|t| t.is_fresh(self.margin)) {
                return Ok(token.value.clone());
            }

            let joined = state
                .in_flight
                .as_ref()
                .map(|(generation, refresh)| (*generation, refresh.clone()));
            match joined {
                Some(joined) => joined,
                None => {
                    state.generation += 1;
                    let generation = state.generation;
                    let source = self.source.clone();
                    let refresh = async move { source.fetch().await.map_err(Arc::new) }
                        .boxed()
                        .shared();
                    state.in_flight = Some((generation, refresh.clone()));
                    tracing::debug!(generation, "Refreshing access token");
                    (generation, refresh)
                }
            }
        };

        let outcome = refresh.await;

        let mut state = self.state.lock().await;
        let owns_slot = matches!(&state.in_flight, Some((g, _)) if *g == generation);
        if owns_slot {
            state.in_flight = None;
            if let Ok(issued) = &outcome {
                let now = Instant::now();
                let lifetime = issued.expires_in.min(MAX_TOKEN_LIFETIME);
                state.token = Some(CachedToken {
                    value: issued.value.clone(),
                    expires_at: now.checked_add(lifetime).unwrap_or(now),
                });
            }
        }

        match outcome {
            Ok(issued) => Ok(issued.value),
            Err(e) => {
                if owns_slot {
                    tracing::warn!(generation, "Access token refresh failed: {}", e);
                }
                Err(Error::Auth(format!("token refresh failed: {}", e)))
            }
        }
    }

    /// Forget the cached token so the next call refreshes
    pub async fn invalidate(&self) {
        self.state.lock().await.token = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
        ttl: Duration,
        delay: Duration,
        fail_first: usize,
    }

    impl CountingSource {
        fn new(ttl: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                ttl,
                delay: Duration::from_millis(100),
                fail_first: 0,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn fetch(&self) -> Result<IssuedToken> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if n <= self.fail_first {
                return Err(Error::Transport("token endpoint unreachable".to_string()));
            }
            Ok(IssuedToken {
                value: format!("token-{}", n),
                expires_in: self.ttl,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_caches_until_margin() {
        let source = Arc::new(CountingSource::new(Duration::from_secs(3600)));
        let cache = CredentialCache::new(source.clone());

        assert_eq!(cache.get_token().await.unwrap(), "token-1");
        assert_eq!(cache.get_token().await.unwrap(), "token-1");
        assert_eq!(source.calls(), 1);

        // Inside the 60s safety margin the token counts as expired
        tokio::time::advance(Duration::from_secs(3541)).await;
        assert_eq!(cache.get_token().await.unwrap(), "token-2");
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_refresh() {
        let source = Arc::new(CountingSource::new(Duration::from_secs(3600)));
        let cache = Arc::new(CredentialCache::new(source.clone()));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get_token().await }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "token-1");
        }
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_fans_out_then_retries() {
        let source = Arc::new(CountingSource {
            fail_first: 1,
            ..CountingSource::new(Duration::from_secs(3600))
        });
        let cache = Arc::new(CredentialCache::new(source.clone()));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get_token().await }));
        }
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, Error::Auth(_)));
        }
        assert_eq!(source.calls(), 1);

        assert_eq!(cache.get_token().await.unwrap(), "token-2");
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_forces_refresh() {
        let source = Arc::new(CountingSource::new(Duration::from_secs(3600)));
        let cache = CredentialCache::new(source.clone());

        cache.get_token().await.unwrap();
        cache.invalidate().await;
        assert_eq!(cache.get_token().await.unwrap(), "token-2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_ttl_never_cached() {
        // A token living shorter than the margin is used once and refetched
        let source = Arc::new(CountingSource::new(Duration::from_secs(30)));
        let cache = CredentialCache::new(source.clone());

        assert_eq!(cache.get_token().await.unwrap(), "token-1");
        assert_eq!(cache.get_token().await.unwrap(), "token-2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_ttl_is_capped() {
        let source = Arc::new(CountingSource::new(Duration::from_secs(u64::MAX)));
        let cache = CredentialCache::new(source.clone());

        assert_eq!(cache.get_token().await.unwrap(), "token-1");
        assert_eq!(cache.get_token().await.unwrap(), "token-1");
        assert_eq!(source.calls(), 1);

        tokio::time::advance(MAX_TOKEN_LIFETIME).await;
        assert_eq!(cache.get_token().await.unwrap(), "token-2");
    }
}
