//! In-memory storage variant: single-node pub/sub with a TTL-bounded
//! buffer, guarded by one mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::analytics::{AnalyticsEvent, AnalyticsHandle};
use crate::cache::MessageCache;
use crate::error::BridgeError;
use crate::verify::{ConnectVerifyCache, VerifyStatus};

use super::{now_epoch_secs, BufferedMessage, ConnectionEntry, SseMessage, Storage, Subscriber};

struct State {
    messages: HashMap<String, Vec<BufferedMessage>>,
    subscribers: HashMap<String, Vec<Subscriber>>,
}

pub struct MemoryStorage {
    state: Mutex<State>,
    expired_cache: Arc<dyn MessageCache>,
    verify_cache: Arc<ConnectVerifyCache>,
    analytics: Option<AnalyticsHandle>,
}

impl MemoryStorage {
    pub fn new(
        expired_cache: Arc<dyn MessageCache>,
        verify_cache: Arc<ConnectVerifyCache>,
        analytics: Option<AnalyticsHandle>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                messages: HashMap::new(),
                subscribers: HashMap::new(),
            }),
            expired_cache,
            verify_cache,
            analytics,
        })
    }

    /// Spawn the once-per-second watcher that drops expired buffered
    /// messages and logs "expired" for any that were never delivered.
    pub fn spawn_watcher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let storage = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                storage.sweep_expired().await;
            }
        })
    }

    async fn sweep_expired(&self) {
        let now = now_epoch_secs();
        let mut dropped: Vec<SseMessage> = Vec::new();

        {
            let mut state = self.state.lock().unwrap();
            for buffered in state.messages.values_mut() {
                let mut i = 0;
                while i < buffered.len() {
                    if buffered[i].expire_at <= now {
                        dropped.push(buffered.remove(i).message);
                    } else {
                        i += 1;
                    }
                }
            }
            state.messages.retain(|_, v| !v.is_empty());
        }

        for message in dropped {
            if !self.expired_cache.is_marked(message.event_id).await {
                debug!(event_id = message.event_id, to = %message.to, "message expired");
                metrics::counter!("bridge_messages_expired_total").increment(1);
                if let Some(analytics) = &self.analytics {
                    analytics.try_add(AnalyticsEvent::bridge_message_expired(&message.to, message.event_id));
                }
            }
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn publish(&self, message: SseMessage, ttl_seconds: u64) -> Result<(), BridgeError> {
        let expire_at = now_epoch_secs() + ttl_seconds as i64;
        let mut state = self.state.lock().unwrap();

        state
            .messages
            .entry(message.to.clone())
            .or_default()
            .push(BufferedMessage {
                message: message.clone(),
                expire_at,
            });

        if let Some(subs) = state.subscribers.get(&message.to) {
            for sub in subs {
                if sub.try_send(message.clone()) {
                    metrics::counter!("bridge_messages_delivered_total").increment(1);
                }
            }
        }
        drop(state);

        metrics::counter!("bridge_messages_published_total").increment(1);
        Ok(())
    }

    async fn subscribe(
        &self,
        client_ids: &[String],
        last_event_id: i64,
        subscriber: Subscriber,
    ) -> Result<(), BridgeError> {
        let now = now_epoch_secs();
        let mut state = self.state.lock().unwrap();

        for client_id in client_ids {
            if let Some(buffered) = state.messages.get(client_id) {
                for entry in buffered {
                    if entry.expire_at > now && entry.message.event_id > last_event_id && subscriber.try_send(entry.message.clone()) {
                        metrics::counter!("bridge_messages_delivered_total").increment(1);
                    }
                }
            }
            state
                .subscribers
                .entry(client_id.clone())
                .or_default()
                .push(subscriber.clone());
        }

        Ok(())
    }

    async fn unsubscribe(&self, client_ids: &[String], subscriber_id: u64) {
        let mut state = self.state.lock().unwrap();
        for client_id in client_ids {
            if let Some(subs) = state.subscribers.get_mut(client_id) {
                subs.retain(|s| s.id != subscriber_id);
                if subs.is_empty() {
                    state.subscribers.remove(client_id);
                }
            }
        }
    }

    async fn add_connection(&self, entry: ConnectionEntry, _ttl_seconds: u64) -> Result<(), BridgeError> {
        self.verify_cache.add(&entry.client_id, &entry.ip, &entry.origin, &entry.user_agent);
        Ok(())
    }

    async fn verify_connection(&self, client_id: &str, ip: &str, origin: &str) -> Result<VerifyStatus, BridgeError> {
        Ok(self.verify_cache.verify(client_id, ip, origin))
    }

    async fn health_check(&self) -> Result<(), BridgeError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MarkedSet;
    use crate::storage::test_support::make_message;
    use tokio::sync::mpsc;

    fn new_storage() -> Arc<MemoryStorage> {
        MemoryStorage::new(
            Arc::new(MarkedSet::expired_cache()),
            Arc::new(ConnectVerifyCache::new(1000, Duration::from_secs(300))),
            None,
        )
    }

    #[tokio::test]
    async fn publish_then_subscribe_replays_buffered_message() {
        let storage = new_storage();
        storage.publish(make_message(1, "bob", "hi"), 60).await.unwrap();

        let (tx, mut rx) = mpsc::channel(10);
        storage.subscribe(&["bob".to_string()], 0, Subscriber::new(tx)).await.unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got.event_id, 1);
    }

    #[tokio::test]
    async fn subscribe_skips_messages_at_or_below_cursor() {
        let storage = new_storage();
        storage.publish(make_message(5, "bob", "a"), 60).await.unwrap();
        storage.publish(make_message(10, "bob", "b"), 60).await.unwrap();

        let (tx, mut rx) = mpsc::channel(10);
        storage.subscribe(&["bob".to_string()], 5, Subscriber::new(tx)).await.unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got.event_id, 10);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn live_publish_reaches_existing_subscriber() {
        let storage = new_storage();
        let (tx, mut rx) = mpsc::channel(10);
        storage.subscribe(&["bob".to_string()], 0, Subscriber::new(tx)).await.unwrap();

        storage.publish(make_message(1, "bob", "hi"), 60).await.unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.event_id, 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_further_delivery() {
        let storage = new_storage();
        let (tx, mut rx) = mpsc::channel(10);
        let sub = Subscriber::new(tx);
        let sub_id = sub.id;
        storage.subscribe(&["bob".to_string()], 0, sub).await.unwrap();
        storage.unsubscribe(&["bob".to_string()], sub_id).await;

        storage.publish(make_message(1, "bob", "hi"), 60).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn expired_buffered_message_is_not_replayed() {
        let storage = new_storage();
        storage.publish(make_message(1, "bob", "hi"), 0).await.unwrap();
        // ttl=0 means expire_at == now; force the sweep to run once.
        tokio::time::sleep(Duration::from_millis(10)).await;
        storage.sweep_expired().await;

        let (tx, mut rx) = mpsc::channel(10);
        storage.subscribe(&["bob".to_string()], 0, Subscriber::new(tx)).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn verify_connection_round_trips_through_memory_backend() {
        let storage = new_storage();
        storage
            .add_connection(
                ConnectionEntry {
                    client_id: "alice".to_string(),
                    ip: "1.2.3.4".to_string(),
                    origin: "https://a.com".to_string(),
                    user_agent: "ua".to_string(),
                },
                300,
            )
            .await
            .unwrap();

        let status = storage.verify_connection("alice", "1.2.3.4", "https://a.com").await.unwrap();
        assert_eq!(status, VerifyStatus::Ok);
    }
}
