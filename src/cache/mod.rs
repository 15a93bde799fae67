//! Marked-set message caches with TTL sweep.
//!
//! `ExpiredCache` (TTL 1h) suppresses spurious "message expired" log lines
//! for messages that were actually delivered before their TTL ran out.
//! `TransferredCache` (TTL 1min) deduplicates the `unique_transferred`
//! counter in the message handler. Both are instances of the same
//! `MarkedSet`, just with different TTLs and semantics.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

#[async_trait]
pub trait MessageCache: Send + Sync {
    async fn mark(&self, id: i64);
    async fn mark_if_not_exists(&self, id: i64) -> bool;
    async fn is_marked(&self, id: i64) -> bool;
    async fn cleanup(&self) -> usize;
    async fn len(&self) -> usize;
}

pub struct MarkedSet {
    ttl: Duration,
    entries: Mutex<HashMap<i64, Instant>>,
}

impl MarkedSet {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn expired_cache() -> Self {
        Self::new(Duration::from_secs(60 * 60))
    }

    pub fn transferred_cache() -> Self {
        Self::new(Duration::from_secs(60))
    }

    /// Spawn a periodic sweep task on the given interval. Returns a handle
    /// the caller can drop or abort to stop sweeping (typically left to run
    /// for the process lifetime).
    pub fn spawn_sweeper(self: &std::sync::Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = cache.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "marked-set sweep removed expired entries");
                }
            }
        })
    }

    fn sweep(&self) -> usize {
        let cutoff = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, marked_at| cutoff.duration_since(*marked_at) < self.ttl);
        before - entries.len()
    }
}

#[async_trait]
impl MessageCache for MarkedSet {
    async fn mark(&self, id: i64) {
        self.entries.lock().unwrap().entry(id).or_insert_with(Instant::now);
    }

    async fn mark_if_not_exists(&self, id: i64) -> bool {
        use std::collections::hash_map::Entry;
        let mut entries = self.entries.lock().unwrap();
        match entries.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(Instant::now());
                true
            }
        }
    }

    async fn is_marked(&self, id: i64) -> bool {
        let entries = self.entries.lock().unwrap();
        match entries.get(&id) {
            Some(marked_at) => Instant::now().duration_since(*marked_at) < self.ttl,
            None => false,
        }
    }

    async fn cleanup(&self) -> usize {
        self.sweep()
    }

    async fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// Backs `ENABLE_EXPIRED_CACHE=false` / `ENABLE_TRANSFERED_CACHE=false`: the
/// rest of the system stays correct (just noisier / uncounted) when caching
/// is disabled.
pub struct NoopMessageCache;

#[async_trait]
impl MessageCache for NoopMessageCache {
    async fn mark(&self, _id: i64) {}
    async fn mark_if_not_exists(&self, _id: i64) -> bool {
        true
    }
    async fn is_marked(&self, _id: i64) -> bool {
        false
    }
    async fn cleanup(&self) -> usize {
        0
    }
    async fn len(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mark_if_not_exists_is_true_only_once() {
        let cache = MarkedSet::new(Duration::from_secs(60));
        assert!(cache.mark_if_not_exists(1).await);
        assert!(!cache.mark_if_not_exists(1).await);
        assert!(!cache.mark_if_not_exists(1).await);
    }

    #[tokio::test]
    async fn is_marked_reflects_mark() {
        let cache = MarkedSet::new(Duration::from_secs(60));
        assert!(!cache.is_marked(7).await);
        cache.mark(7).await;
        assert!(cache.is_marked(7).await);
    }

    #[tokio::test]
    async fn sweep_drops_entries_past_ttl() {
        let cache = MarkedSet::new(Duration::from_millis(10));
        cache.mark(1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let removed = cache.cleanup().await;
        assert_eq!(removed, 1);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn noop_cache_never_marks() {
        let cache = NoopMessageCache;
        assert!(cache.mark_if_not_exists(1).await);
        assert!(cache.mark_if_not_exists(1).await);
        assert!(!cache.is_marked(1).await);
    }
}
