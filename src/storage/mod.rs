//! Pub/sub storage abstraction (§4.5–§4.7): the capability set
//! `{Pub, Sub, Unsub, AddConnection, VerifyConnection, HealthCheck}`, with
//! `MemoryStorage`, `ValkeyStorage` (single-node), and cluster variants
//! built on top of it.

pub mod cluster;
pub mod crc16;
pub mod memory;
pub mod valkey;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::BridgeError;
use crate::verify::VerifyStatus;

/// A message routed to `to`, tagged with its globally-unique event id. The
/// `payload` is the already-serialized envelope bytes (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseMessage {
    pub event_id: i64,
    pub to: String,
    pub payload: Vec<u8>,
}

/// Buffered copy of a published message, owned by storage until it expires.
#[derive(Debug, Clone)]
pub struct BufferedMessage {
    pub message: SseMessage,
    pub expire_at: i64,
}

#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub client_id: String,
    pub ip: String,
    pub origin: String,
    pub user_agent: String,
}

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// A session's inbound sink, registered with storage under every client id
/// it subscribes to. `id` lets `unsubscribe` remove the exact registration
/// without requiring `Sender` to implement equality.
#[derive(Clone)]
pub struct Subscriber {
    pub id: u64,
    pub tx: mpsc::Sender<SseMessage>,
}

impl Subscriber {
    pub fn new(tx: mpsc::Sender<SseMessage>) -> Self {
        Self {
            id: NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    /// Non-blocking delivery. A full sink means the message is simply
    /// dropped — replay will pick it up again on reconnect, live messages
    /// are best-effort.
    pub fn try_send(&self, message: SseMessage) -> bool {
        self.tx.try_send(message).is_ok()
    }
}

pub fn now_epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Publish to subscribers of `message.to` and buffer for `ttl_seconds`
    /// so later subscribers can replay it.
    async fn publish(&self, message: SseMessage, ttl_seconds: u64) -> Result<(), BridgeError>;

    /// Register `subscriber` for each client id, synchronously replaying
    /// every buffered non-expired message with `event_id > last_event_id`.
    async fn subscribe(
        &self,
        client_ids: &[String],
        last_event_id: i64,
        subscriber: Subscriber,
    ) -> Result<(), BridgeError>;

    /// Remove this exact subscriber registration from each client id.
    async fn unsubscribe(&self, client_ids: &[String], subscriber_id: u64);

    async fn add_connection(&self, entry: ConnectionEntry, ttl_seconds: u64) -> Result<(), BridgeError>;

    async fn verify_connection(&self, client_id: &str, ip: &str, origin: &str) -> Result<VerifyStatus, BridgeError>;

    async fn health_check(&self) -> Result<(), BridgeError>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn make_message(event_id: i64, to: &str, payload: &str) -> SseMessage {
        SseMessage {
            event_id,
            to: to.to_string(),
            payload: payload.as_bytes().to_vec(),
        }
    }
}
