//! Single-node Valkey/Redis storage backend: a `get_async_pubsub` +
//! `on_message` listener generalized from one fixed channel to dynamic
//! per-client-id subscriptions, with fan-out to local SSE sinks and
//! Fibonacci-backoff reconnect.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::backoff::FibonacciBackoff;
use crate::error::BridgeError;
use crate::verify::VerifyStatus;

use super::{now_epoch_secs, ConnectionEntry, SseMessage, Storage, Subscriber};

const CONN_TTL_HEADROOM_SECS: u64 = 60;

fn channel_for(client_id: &str) -> String {
    format!("client:{client_id}")
}

fn buffer_key_for(client_id: &str) -> String {
    format!("client:{client_id}")
}

/// Collision-free key for a (ip, origin) pair: the pair's own content is
/// kept in the hash fields, the key only needs to round-trip identity, and
/// origins routinely contain the `:` that would make a naive
/// `ip:origin`-in-the-key scheme ambiguous to split.
fn conn_full_key(client_id: &str, ip: &str, origin: &str) -> String {
    let digest = Sha256::digest(format!("{ip}|{origin}").as_bytes());
    format!("conn:full:{client_id}:{}", hex::encode(digest))
}

fn conn_index_key(client_id: &str) -> String {
    format!("conn:idx:{client_id}")
}

enum PubSubCommand {
    Subscribe(String),
    Unsubscribe(String),
}

type LocalSubs = Arc<Mutex<HashMap<String, Vec<Subscriber>>>>;

pub struct ValkeyStorage {
    conn: ConnectionManager,
    local: LocalSubs,
    cmd_tx: mpsc::UnboundedSender<PubSubCommand>,
}

impl ValkeyStorage {
    pub async fn connect(uri: &str) -> Result<Arc<Self>, BridgeError> {
        let client = redis::Client::open(uri).map_err(|e| BridgeError::Storage(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BridgeError::Storage(e.to_string()))?;

        let local: LocalSubs = Arc::new(Mutex::new(HashMap::new()));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        spawn_pubsub_listener(client, local.clone(), cmd_rx);

        Ok(Arc::new(Self { conn, local, cmd_tx }))
    }

    fn dispatch_locally(local: &LocalSubs, client_id: &str, message: &SseMessage) {
        let subs = local.lock().unwrap();
        if let Some(list) = subs.get(client_id) {
            for sub in list {
                sub.try_send(message.clone());
            }
        }
    }
}

/// Background task owning the dedicated pub/sub connection. One connection
/// per listener, but supports adding and removing channel subscriptions at
/// runtime via `cmd_rx`, and reconnects with a Fibonacci backoff,
/// re-subscribing every client id that still has local subscribers.
fn spawn_pubsub_listener(client: redis::Client, local: LocalSubs, mut cmd_rx: mpsc::UnboundedReceiver<PubSubCommand>) {
    tokio::spawn(async move {
        let mut backoff = FibonacciBackoff::new();
        loop {
            match client.get_async_pubsub().await {
                Ok(mut pubsub) => {
                    backoff.reset();
                    let channels: Vec<String> = {
                        let guard = local.lock().unwrap();
                        guard.keys().map(|cid| channel_for(cid)).collect()
                    };
                    for channel in &channels {
                        if let Err(e) = pubsub.subscribe(channel).await {
                            warn!(channel, error = %e, "failed to re-subscribe after reconnect");
                        }
                    }

                    run_listener(&mut pubsub, &local, &mut cmd_rx).await;
                }
                Err(e) => error!(error = %e, "failed to open valkey pub/sub connection"),
            }

            if backoff.exhausted() {
                backoff.reset();
            }
            tokio::time::sleep(backoff.next_delay()).await;
        }
    });
}

async fn run_listener(
    pubsub: &mut redis::aio::PubSub,
    local: &LocalSubs,
    cmd_rx: &mut mpsc::UnboundedReceiver<PubSubCommand>,
) {
    loop {
        // `on_message` is a zero-state adaptor over the connection; rebuilding
        // it each iteration lets us interleave subscribe/unsubscribe commands
        // without holding a live borrow of `pubsub` across the select.
        let next_message = async {
            let mut stream = pubsub.on_message();
            stream.next().await
        };

        tokio::select! {
            biased;
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(PubSubCommand::Subscribe(channel)) => {
                        if let Err(e) = pubsub.subscribe(&channel).await {
                            warn!(channel, error = %e, "subscribe failed");
                            return;
                        }
                    }
                    Some(PubSubCommand::Unsubscribe(channel)) => {
                        if let Err(e) = pubsub.unsubscribe(&channel).await {
                            warn!(channel, error = %e, "unsubscribe failed");
                        }
                    }
                    None => return,
                }
            }
            msg = next_message => {
                let Some(msg) = msg else {
                    warn!("valkey pub/sub connection closed, reconnecting");
                    return;
                };
                let channel: String = msg.get_channel_name().to_string();
                let Some(client_id) = channel.strip_prefix("client:") else { continue };
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => { warn!(error = %e, "bad pub/sub payload"); continue; }
                };
                match serde_json::from_slice::<SseMessage>(&payload) {
                    Ok(sse) => ValkeyStorage::dispatch_locally(local, client_id, &sse),
                    Err(e) => warn!(error = %e, "failed to decode pub/sub message"),
                }
            }
        }
    }
}

#[async_trait]
impl Storage for ValkeyStorage {
    async fn publish(&self, message: SseMessage, ttl_seconds: u64) -> Result<(), BridgeError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_vec(&message).map_err(|e| BridgeError::Storage(e.to_string()))?;
        let channel = channel_for(&message.to);
        let key = buffer_key_for(&message.to);
        let expire_at = now_epoch_secs() + ttl_seconds as i64;

        let _: i64 = conn
            .publish(&channel, payload.clone())
            .await
            .map_err(|e| BridgeError::Storage(e.to_string()))?;
        let _: i64 = conn
            .zadd(&key, payload, expire_at)
            .await
            .map_err(|e| BridgeError::Storage(e.to_string()))?;
        let _: bool = conn
            .expire(&key, ttl_seconds as i64 + CONN_TTL_HEADROOM_SECS as i64)
            .await
            .map_err(|e| BridgeError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn subscribe(
        &self,
        client_ids: &[String],
        last_event_id: i64,
        subscriber: Subscriber,
    ) -> Result<(), BridgeError> {
        let now = now_epoch_secs();
        let mut conn = self.conn.clone();

        for client_id in client_ids {
            let key = buffer_key_for(client_id);
            let _: i64 = conn
                .zrembyscore(&key, 0, now)
                .await
                .map_err(|e| BridgeError::Storage(e.to_string()))?;
            let raw: Vec<Vec<u8>> = conn
                .zrange(&key, 0, -1)
                .await
                .map_err(|e| BridgeError::Storage(e.to_string()))?;

            for bytes in raw {
                if let Ok(msg) = serde_json::from_slice::<SseMessage>(&bytes) {
                    if msg.event_id > last_event_id {
                        subscriber.try_send(msg);
                    }
                }
            }

            let first_for_client = {
                let mut local = self.local.lock().unwrap();
                let list = local.entry(client_id.clone()).or_default();
                let was_empty = list.is_empty();
                list.push(subscriber.clone());
                was_empty
            };
            if first_for_client {
                let _ = self.cmd_tx.send(PubSubCommand::Subscribe(channel_for(client_id)));
            }
        }

        Ok(())
    }

    async fn unsubscribe(&self, client_ids: &[String], subscriber_id: u64) {
        for client_id in client_ids {
            let now_empty = {
                let mut local = self.local.lock().unwrap();
                if let Some(list) = local.get_mut(client_id) {
                    list.retain(|s| s.id != subscriber_id);
                    let empty = list.is_empty();
                    if empty {
                        local.remove(client_id);
                    }
                    empty
                } else {
                    false
                }
            };
            if now_empty {
                let _ = self.cmd_tx.send(PubSubCommand::Unsubscribe(channel_for(client_id)));
            }
        }
    }

    async fn add_connection(&self, entry: ConnectionEntry, ttl_seconds: u64) -> Result<(), BridgeError> {
        let mut conn = self.conn.clone();
        let full_key = conn_full_key(&entry.client_id, &entry.ip, &entry.origin);
        let idx_key = conn_index_key(&entry.client_id);

        let _: () = conn
            .hset_multiple(
                &full_key,
                &[
                    ("ip", entry.ip.as_str()),
                    ("origin", entry.origin.as_str()),
                    ("user_agent", entry.user_agent.as_str()),
                ],
            )
            .await
            .map_err(|e| BridgeError::Storage(e.to_string()))?;
        let _: bool = conn
            .expire(&full_key, ttl_seconds as i64)
            .await
            .map_err(|e| BridgeError::Storage(e.to_string()))?;
        let _: i64 = conn
            .sadd(&idx_key, &full_key)
            .await
            .map_err(|e| BridgeError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn verify_connection(&self, client_id: &str, ip: &str, origin: &str) -> Result<VerifyStatus, BridgeError> {
        let mut conn = self.conn.clone();
        let full_key = conn_full_key(client_id, ip, origin);

        let exact_len: i64 = conn.hlen(&full_key).await.map_err(|e| BridgeError::Storage(e.to_string()))?;
        if exact_len > 0 {
            return Ok(VerifyStatus::Ok);
        }

        let idx_key = conn_index_key(client_id);
        let members: Vec<String> = conn.smembers(&idx_key).await.map_err(|e| BridgeError::Storage(e.to_string()))?;

        let mut saw_any = false;
        for member in members {
            let origin_field: Option<String> = conn
                .hget(&member, "origin")
                .await
                .map_err(|e| BridgeError::Storage(e.to_string()))?;
            let Some(seen_origin) = origin_field else {
                continue; // key expired, stale index entry
            };
            saw_any = true;
            if seen_origin == origin {
                return Ok(VerifyStatus::Warning);
            }
        }

        Ok(if saw_any { VerifyStatus::Danger } else { VerifyStatus::Unknown })
    }

    async fn health_check(&self) -> Result<(), BridgeError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| BridgeError::Storage(e.to_string()))?;
        Ok(())
    }
}

impl std::fmt::Debug for ValkeyStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValkeyStorage").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_full_key_is_stable_and_delimiter_safe() {
        let a = conn_full_key("client-1", "1.2.3.4", "https://a.com:8080");
        let b = conn_full_key("client-1", "1.2.3.4", "https://a.com:8080");
        assert_eq!(a, b);
        assert!(a.starts_with("conn:full:client-1:"));
    }

    #[test]
    fn different_origins_produce_different_keys() {
        let a = conn_full_key("c", "1.2.3.4", "https://a.com");
        let b = conn_full_key("c", "1.2.3.4", "https://b.com");
        assert_ne!(a, b);
    }

    #[test]
    fn channel_and_buffer_key_share_namespace_by_design() {
        // Redis keyspace and pub/sub channels are distinct namespaces, so
        // reusing "client:<id>" for both is safe.
        assert_eq!(channel_for("abc"), buffer_key_for("abc"));
    }
}
