//! Bounded memory of recently seen message ids
//!
//! Platforms with at-least-once delivery (Feishu callbacks, Slack and
//! DingTalk sockets) redeliver events. Each adapter keeps its own window.

use std::collections::{HashSet, VecDeque};
use tokio::sync::Mutex;

/// Default window size when an adapter does not configure one.
pub const DEFAULT_DEDUP_CAPACITY: usize = 1000;

/// Fixed-capacity set of recent ids with FIFO eviction.
///
/// Once more than `capacity` distinct ids have been recorded, the oldest is
/// forgotten. A redelivery of a forgotten id is reported as new; a new id is
/// never reported as seen.
pub struct DedupWindow {
    inner: Mutex<WindowInner>,
}

struct WindowInner {
    ids: HashSet<String>,
    /// front = oldest, back = newest
    order: VecDeque<String>,
    capacity: usize,
}

impl DedupWindow {
    /// Create a window holding at most `capacity` ids (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(WindowInner {
                ids: HashSet::with_capacity(capacity.min(1024)),
                order: VecDeque::with_capacity(capacity.min(1024)),
                capacity,
            }),
        }
    }

    /// Record `id`; returns true if it was already in the window.
    pub async fn seen(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.ids.contains(id) {
            return true;
        }

        if inner.order.len() >= inner.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.ids.remove(&oldest);
            }
        }

        inner.ids.insert(id.to_string());
        inner.order.push_back(id.to_string());
        false
    }

    /// Number of ids currently remembered
    pub async fn len(&self) -> usize {
        self.inner.lock().await.order.len()
    }

    /// Whether the window is empty
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.order.is_empty()
    }

    /// Configured capacity
    pub async fn capacity(&self) -> usize {
        self.inner.lock().await.capacity
    }
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}
