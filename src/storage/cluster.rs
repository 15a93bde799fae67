//! Valkey/Redis Cluster storage backend (§4.7): data commands are routed
//! cluster-aware via `redis::cluster_async`, while pub/sub runs in one of
//! two modes selected by `ClusterPubSubMode`:
//!
//! - `Regular`: plain PUBLISH/SUBSCRIBE. The cluster bus fans a published
//!   message out to every node regardless of slot, so a single connection
//!   to any one node receives every message — mechanically identical to
//!   the single-node listener in [`super::valkey`].
//! - `Sharded`: SPUBLISH/SSUBSCRIBE. A message only reaches the node(s)
//!   owning the channel's slot, so we discover shard topology with
//!   `CLUSTER SLOTS` and keep one listener per shard, routing each
//!   client id's channel through [`super::crc16::slot_for_key`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::AsyncCommands;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::backoff::FibonacciBackoff;
use crate::config::ClusterPubSubMode;
use crate::error::BridgeError;
use crate::verify::VerifyStatus;

use super::{now_epoch_secs, crc16, ConnectionEntry, SseMessage, Storage, Subscriber};

fn channel_for(client_id: &str) -> String {
    format!("client:{client_id}")
}

fn conn_full_key(client_id: &str, ip: &str, origin: &str) -> String {
    let digest = Sha256::digest(format!("{ip}|{origin}").as_bytes());
    format!("conn:full:{{{client_id}}}:{}", hex::encode(digest))
}

fn conn_index_key(client_id: &str) -> String {
    format!("conn:idx:{{{client_id}}}")
}

enum PubSubCommand {
    Subscribe(String),
    Unsubscribe(String),
}

type LocalSubs = Arc<Mutex<HashMap<String, Vec<Subscriber>>>>;

/// One shard's dedicated listener plus the node address it was opened
/// against, used to pick a target when (re-)subscribing a channel.
struct ShardRoute {
    slot_start: u16,
    slot_end: u16,
    cmd_tx: mpsc::UnboundedSender<PubSubCommand>,
}

pub struct ClusterStorage {
    data: ClusterConnection,
    local: LocalSubs,
    mode: ClusterPubSubMode,
    /// Populated only in `Sharded` mode.
    shards: Mutex<Vec<ShardRoute>>,
    /// Populated only in `Regular` mode.
    regular_tx: Option<mpsc::UnboundedSender<PubSubCommand>>,
    seed_urls: Vec<String>,
}

impl ClusterStorage {
    pub async fn connect(urls: Vec<String>, mode: ClusterPubSubMode) -> Result<Arc<Self>, BridgeError> {
        let client = ClusterClient::new(urls.clone()).map_err(|e| BridgeError::Storage(e.to_string()))?;
        let data = client
            .get_async_connection()
            .await
            .map_err(|e| BridgeError::Storage(e.to_string()))?;

        let local: LocalSubs = Arc::new(Mutex::new(HashMap::new()));

        let (regular_tx, shards) = match mode {
            ClusterPubSubMode::Regular => {
                let seed = urls.first().cloned().ok_or_else(|| BridgeError::Storage("no cluster seed".into()))?;
                let (tx, rx) = mpsc::unbounded_channel();
                spawn_node_listener(seed, local.clone(), rx, false);
                (Some(tx), Mutex::new(Vec::new()))
            }
            ClusterPubSubMode::Sharded => {
                let routes = discover_shards(&urls).await?;
                let mut routed = Vec::with_capacity(routes.len());
                for (slot_start, slot_end, addr) in routes {
                    let (tx, rx) = mpsc::unbounded_channel();
                    spawn_node_listener(addr, local.clone(), rx, true);
                    routed.push(ShardRoute { slot_start, slot_end, cmd_tx: tx });
                }
                (None, Mutex::new(routed))
            }
        };

        Ok(Arc::new(Self {
            data,
            local,
            mode,
            shards,
            regular_tx,
            seed_urls: urls,
        }))
    }

    fn route_for_channel(&self, channel: &str) -> Option<mpsc::UnboundedSender<PubSubCommand>> {
        match self.mode {
            ClusterPubSubMode::Regular => self.regular_tx.clone(),
            ClusterPubSubMode::Sharded => {
                let slot = crc16::slot_for_key(channel);
                self.shards
                    .lock()
                    .unwrap()
                    .iter()
                    .find(|r| slot >= r.slot_start && slot <= r.slot_end)
                    .map(|r| r.cmd_tx.clone())
            }
        }
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

/// `CLUSTER SLOTS` discovery with Fibonacci-backoff retry, returning
/// `(slot_start, slot_end, node_addr)` triples.
async fn discover_shards(urls: &[String]) -> Result<Vec<(u16, u16, String)>, BridgeError> {
    let mut backoff = FibonacciBackoff::new();
    loop {
        for url in urls {
            if let Ok(client) = redis::Client::open(url.as_str()) {
                if let Ok(mut conn) = client.get_multiplexed_async_connection().await {
                    if let Ok(slots) = query_cluster_slots(&mut conn).await {
                        return Ok(slots);
                    }
                }
            }
        }
        if backoff.exhausted() {
            return Err(BridgeError::Storage("cluster slot discovery failed".into()));
        }
        tokio::time::sleep(backoff.next_delay()).await;
    }
}

async fn query_cluster_slots(conn: &mut redis::aio::MultiplexedConnection) -> Result<Vec<(u16, u16, String)>, redis::RedisError> {
    let raw: redis::Value = redis::cmd("CLUSTER").arg("SLOTS").query_async(conn).await?;
    let mut out = Vec::new();
    if let redis::Value::Array(rows) = raw {
        for row in rows {
            if let redis::Value::Array(fields) = row {
                if fields.len() >= 3 {
                    let start = match &fields[0] {
                        redis::Value::Int(n) => *n as u16,
                        _ => continue,
                    };
                    let end = match &fields[1] {
                        redis::Value::Int(n) => *n as u16,
                        _ => continue,
                    };
                    if let redis::Value::Array(node) = &fields[2] {
                        if let Some(redis::Value::BulkString(host)) = node.first() {
                            if let Some(redis::Value::Int(port)) = node.get(1) {
                                let host = String::from_utf8_lossy(host);
                                out.push((start, end, format!("redis://{host}:{port}")));
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(out)
}

fn spawn_node_listener(
    url: String,
    local: LocalSubs,
    mut cmd_rx: mpsc::UnboundedReceiver<PubSubCommand>,
    sharded: bool,
) {
    tokio::spawn(async move {
        let mut backoff = FibonacciBackoff::new();
        loop {
            let client = match redis::Client::open(url.as_str()) {
                Ok(c) => c,
                Err(e) => {
                    error!(url, error = %e, "bad cluster node url");
                    return;
                }
            };
            match client.get_async_pubsub().await {
                Ok(mut pubsub) => {
                    backoff.reset();
                    let channels: Vec<String> = {
                        let guard = local.lock().unwrap();
                        guard.keys().map(|cid| channel_for(cid)).collect()
                    };
                    for channel in &channels {
                        let result = if sharded {
                            pubsub.ssubscribe(channel).await
                        } else {
                            pubsub.subscribe(channel).await
                        };
                        if let Err(e) = result {
                            warn!(channel, error = %e, "failed to re-subscribe after reconnect");
                        }
                    }

                    run_listener(&mut pubsub, &local, &mut cmd_rx, sharded).await;
                }
                Err(e) => error!(url, error = %e, "failed to open cluster node pub/sub"),
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
    sharded: bool,
) {
    loop {
        let next_message = async {
            let mut stream = pubsub.on_message();
            stream.next().await
        };

        tokio::select! {
            biased;
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(PubSubCommand::Subscribe(channel)) => {
                        let result = if sharded { pubsub.ssubscribe(&channel).await } else { pubsub.subscribe(&channel).await };
                        if let Err(e) = result {
                            warn!(channel, error = %e, "subscribe failed");
                            return;
                        }
                    }
                    Some(PubSubCommand::Unsubscribe(channel)) => {
                        let result = if sharded { pubsub.sunsubscribe(&channel).await } else { pubsub.unsubscribe(&channel).await };
                        if let Err(e) = result {
                            warn!(channel, error = %e, "unsubscribe failed");
                        }
                    }
                    None => return,
                }
            }
            msg = next_message => {
                let Some(msg) = msg else {
                    warn!("cluster node pub/sub connection closed, reconnecting");
                    return;
                };
                let channel: String = msg.get_channel_name().to_string();
                let Some(client_id) = channel.strip_prefix("client:") else { continue };
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => { warn!(error = %e, "bad pub/sub payload"); continue; }
                };
                match serde_json::from_slice::<SseMessage>(&payload) {
                    Ok(sse) => ClusterStorage::dispatch_locally(local, client_id, &sse),
                    Err(e) => warn!(error = %e, "failed to decode pub/sub message"),
                }
            }
        }
    }
}

#[async_trait]
impl Storage for ClusterStorage {
    async fn publish(&self, message: SseMessage, ttl_seconds: u64) -> Result<(), BridgeError> {
        let mut data = self.data.clone();
        let payload = serde_json::to_vec(&message).map_err(|e| BridgeError::Storage(e.to_string()))?;
        let channel = channel_for(&message.to);
        let key = format!("client:{{{}}}", message.to);
        let expire_at = now_epoch_secs() + ttl_seconds as i64;

        match self.mode {
            ClusterPubSubMode::Regular => {
                let _: i64 = data.publish(&channel, payload.clone()).await.map_err(|e| BridgeError::Storage(e.to_string()))?;
            }
            ClusterPubSubMode::Sharded => {
                let _: i64 = redis::cmd("SPUBLISH")
                    .arg(&channel)
                    .arg(payload.clone())
                    .query_async(&mut data)
                    .await
                    .map_err(|e| BridgeError::Storage(e.to_string()))?;
            }
        }

        let _: i64 = data.zadd(&key, payload, expire_at).await.map_err(|e| BridgeError::Storage(e.to_string()))?;
        let _: bool = data
            .expire(&key, ttl_seconds as i64 + 60)
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
        let mut data = self.data.clone();

        for client_id in client_ids {
            let key = format!("client:{{{client_id}}}");
            let _: i64 = data.zrembyscore(&key, 0, now).await.map_err(|e| BridgeError::Storage(e.to_string()))?;
            let raw: Vec<Vec<u8>> = data.zrange(&key, 0, -1).await.map_err(|e| BridgeError::Storage(e.to_string()))?;

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
                if let Some(tx) = self.route_for_channel(&channel_for(client_id)) {
                    let _ = tx.send(PubSubCommand::Subscribe(channel_for(client_id)));
                }
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
                if let Some(tx) = self.route_for_channel(&channel_for(client_id)) {
                    let _ = tx.send(PubSubCommand::Unsubscribe(channel_for(client_id)));
                }
            }
        }
    }

    async fn add_connection(&self, entry: ConnectionEntry, ttl_seconds: u64) -> Result<(), BridgeError> {
        let mut data = self.data.clone();
        let full_key = conn_full_key(&entry.client_id, &entry.ip, &entry.origin);
        let idx_key = conn_index_key(&entry.client_id);

        let _: () = data
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
        let _: bool = data.expire(&full_key, ttl_seconds as i64).await.map_err(|e| BridgeError::Storage(e.to_string()))?;
        let _: i64 = data.sadd(&idx_key, &full_key).await.map_err(|e| BridgeError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn verify_connection(&self, client_id: &str, ip: &str, origin: &str) -> Result<VerifyStatus, BridgeError> {
        let mut data = self.data.clone();
        let full_key = conn_full_key(client_id, ip, origin);

        let exact_len: i64 = data.hlen(&full_key).await.map_err(|e| BridgeError::Storage(e.to_string()))?;
        if exact_len > 0 {
            return Ok(VerifyStatus::Ok);
        }

        let idx_key = conn_index_key(client_id);
        let members: Vec<String> = data.smembers(&idx_key).await.map_err(|e| BridgeError::Storage(e.to_string()))?;

        let mut saw_any = false;
        for member in members {
            let origin_field: Option<String> = data.hget(&member, "origin").await.map_err(|e| BridgeError::Storage(e.to_string()))?;
            let Some(seen_origin) = origin_field else { continue };
            saw_any = true;
            if seen_origin == origin {
                return Ok(VerifyStatus::Warning);
            }
        }

        Ok(if saw_any { VerifyStatus::Danger } else { VerifyStatus::Unknown })
    }

    async fn health_check(&self) -> Result<(), BridgeError> {
        let mut data = self.data.clone();
        let _: String = redis::cmd("PING").query_async(&mut data).await.map_err(|e| BridgeError::Storage(e.to_string()))?;
        Ok(())
    }
}

impl std::fmt::Debug for ClusterStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterStorage")
            .field("mode", &self.mode)
            .field("seeds", &self.seed_urls)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashtagged_keys_keep_conn_keys_on_one_slot() {
        let full = conn_full_key("abc", "1.2.3.4", "https://x.com");
        assert!(full.contains("{abc}"));
    }
}
