//! Connect-verify cache (§4.4): bounded LRU of `(client_id, ip, origin,
//! user_agent)` tuples with a secondary `client_id -> [keys]` index, used to
//! answer the anti-phishing `/bridge/verify` check.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EntryKey {
    client_id: String,
    ip: String,
    origin: String,
    user_agent: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyStatus {
    Ok,
    Warning,
    Danger,
    Unknown,
}

impl VerifyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VerifyStatus::Ok => "ok",
            VerifyStatus::Warning => "warning",
            VerifyStatus::Danger => "danger",
            VerifyStatus::Unknown => "unknown",
        }
    }
}

struct Inner {
    lru: LruCache<EntryKey, Instant>,
    by_client: HashMap<String, Vec<EntryKey>>,
}

pub struct ConnectVerifyCache {
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl ConnectVerifyCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            ttl,
            inner: Mutex::new(Inner {
                lru: LruCache::new(capacity),
                by_client: HashMap::new(),
            }),
        }
    }

    pub fn add(&self, client_id: &str, ip: &str, origin: &str, user_agent: &str) {
        let key = EntryKey {
            client_id: client_id.to_string(),
            ip: ip.to_string(),
            origin: origin.to_string(),
            user_agent: user_agent.to_string(),
        };
        let expires_at = Instant::now() + self.ttl;

        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.lru.get_mut(&key) {
            *existing = expires_at;
            return;
        }

        let evicted = inner.lru.push(key.clone(), expires_at);
        inner
            .by_client
            .entry(client_id.to_string())
            .or_default()
            .push(key);

        if let Some((evicted_key, _)) = evicted {
            Self::forget(&mut inner.by_client, &evicted_key);
        }
    }

    pub fn verify(&self, client_id: &str, ip: &str, origin: &str) -> VerifyStatus {
        let status = self.classify(client_id, ip, origin);
        metrics::counter!("bridge_verify_lookups_total", "status" => status.as_str()).increment(1);
        status
    }

    fn classify(&self, client_id: &str, ip: &str, origin: &str) -> VerifyStatus {
        let inner = self.inner.lock().unwrap();
        let Some(keys) = inner.by_client.get(client_id) else {
            return VerifyStatus::Unknown;
        };

        let now = Instant::now();
        let live: Vec<&EntryKey> = keys
            .iter()
            .filter(|k| inner.lru.peek(k).is_some_and(|exp| *exp > now))
            .collect();

        if live.is_empty() {
            return VerifyStatus::Unknown;
        }
        if live.iter().any(|k| k.origin == origin && k.ip == ip) {
            return VerifyStatus::Ok;
        }
        if live.iter().any(|k| k.origin == origin) {
            return VerifyStatus::Warning;
        }
        VerifyStatus::Danger
    }

    /// Walk the LRU from the tail (oldest), stopping at the first
    /// non-expired entry — a correct heuristic because a freshly-added or
    /// refreshed entry always moves to the front.
    pub fn clean_expired(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let mut removed = 0usize;

        loop {
            let Some((_, expires_at)) = inner.lru.peek_lru() else {
                break;
            };
            if *expires_at > now {
                break;
            }
            let (key, _) = inner.lru.pop_lru().expect("peeked entry must pop");
            Self::forget(&mut inner.by_client, &key);
            removed += 1;
        }

        removed
    }

    fn forget(by_client: &mut HashMap<String, Vec<EntryKey>>, key: &EntryKey) {
        if let Some(keys) = by_client.get_mut(&key.client_id) {
            keys.retain(|k| k != key);
            if keys.is_empty() {
                by_client.remove(&key.client_id);
            }
        }
    }

    pub fn spawn_sweeper(self: &std::sync::Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = cache.clean_expired();
                if removed > 0 {
                    tracing::debug!(removed, "connect-verify cache swept expired entries");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_requires_exact_origin_and_ip() {
        let cache = ConnectVerifyCache::new(100, Duration::from_secs(60));
        cache.add("client-a", "1.2.3.4", "https://a.com", "ua");
        assert_eq!(cache.verify("client-a", "1.2.3.4", "https://a.com"), VerifyStatus::Ok);
    }

    #[test]
    fn warning_on_same_origin_different_ip() {
        let cache = ConnectVerifyCache::new(100, Duration::from_secs(60));
        cache.add("client-a", "1.2.3.4", "https://a.com", "ua");
        assert_eq!(cache.verify("client-a", "9.9.9.9", "https://a.com"), VerifyStatus::Warning);
    }

    #[test]
    fn danger_on_known_client_new_origin() {
        let cache = ConnectVerifyCache::new(100, Duration::from_secs(60));
        cache.add("client-a", "1.2.3.4", "https://a.com", "ua");
        assert_eq!(cache.verify("client-a", "1.2.3.4", "https://evil.com"), VerifyStatus::Danger);
    }

    #[test]
    fn unknown_for_unseen_client() {
        let cache = ConnectVerifyCache::new(100, Duration::from_secs(60));
        assert_eq!(cache.verify("nobody", "1.2.3.4", "https://a.com"), VerifyStatus::Unknown);
    }

    #[test]
    fn expired_entries_are_ignored_by_verify() {
        let cache = ConnectVerifyCache::new(100, Duration::from_millis(5));
        cache.add("client-a", "1.2.3.4", "https://a.com", "ua");
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.verify("client-a", "1.2.3.4", "https://a.com"), VerifyStatus::Unknown);
    }

    #[test]
    fn clean_expired_evicts_from_tail() {
        let cache = ConnectVerifyCache::new(100, Duration::from_millis(5));
        cache.add("client-a", "1.2.3.4", "https://a.com", "ua");
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.clean_expired(), 1);
        assert!(cache.inner.lock().unwrap().by_client.is_empty());
    }

    #[test]
    fn lru_eviction_cleans_secondary_index() {
        let cache = ConnectVerifyCache::new(1, Duration::from_secs(60));
        cache.add("client-a", "1.1.1.1", "https://a.com", "ua");
        cache.add("client-b", "2.2.2.2", "https://b.com", "ua");
        // capacity 1 evicted client-a's only entry
        assert_eq!(cache.verify("client-a", "1.1.1.1", "https://a.com"), VerifyStatus::Unknown);
        assert_eq!(cache.verify("client-b", "2.2.2.2", "https://b.com"), VerifyStatus::Ok);
    }

    #[test]
    fn refreshing_an_entry_does_not_duplicate_secondary_index() {
        let cache = ConnectVerifyCache::new(100, Duration::from_secs(60));
        cache.add("client-a", "1.2.3.4", "https://a.com", "ua");
        cache.add("client-a", "1.2.3.4", "https://a.com", "ua");
        assert_eq!(cache.inner.lock().unwrap().by_client["client-a"].len(), 1);
    }
}
