//! Analytics collector: producers call `try_add`, a single background task
//! batches and flushes on a timer, failures are logged and dropped.
//! Analytics backpressure must never propagate into the routing core, so
//! `try_add` never blocks and never returns an error callers need to act
//! on.

use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::warn;

const DEFAULT_CAPACITY: usize = 200;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(500);
const HIGH_WATERMARK_RATIO: f64 = 0.9;
const MAX_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum AnalyticsEvent {
    #[serde(rename = "bridge-message-expired")]
    BridgeMessageExpired { client_id: String, event_id: i64 },
    #[serde(rename = "bridge-message-sent")]
    BridgeMessageSent { from: String, to: String, event_id: i64 },
}

impl AnalyticsEvent {
    pub fn bridge_message_expired(client_id: &str, event_id: i64) -> Self {
        AnalyticsEvent::BridgeMessageExpired {
            client_id: client_id.to_string(),
            event_id,
        }
    }

    pub fn bridge_message_sent(from: &str, to: &str, event_id: i64) -> Self {
        AnalyticsEvent::BridgeMessageSent {
            from: from.to_string(),
            to: to.to_string(),
            event_id,
        }
    }
}

#[derive(Clone)]
pub struct AnalyticsHandle {
    tx: mpsc::Sender<AnalyticsEvent>,
    capacity: usize,
}

impl AnalyticsHandle {
    /// Returns `false` on overflow rather than blocking the caller.
    pub fn try_add(&self, event: AnalyticsEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(capacity = self.capacity, "analytics buffer full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("analytics collector task is gone, dropping event");
                false
            }
        }
    }
}

pub struct AnalyticsCollector {
    rx: mpsc::Receiver<AnalyticsEvent>,
    endpoint: Option<String>,
    client: reqwest::Client,
    capacity: usize,
}

impl AnalyticsCollector {
    pub fn spawn(endpoint: Option<String>) -> AnalyticsHandle {
        let (tx, rx) = mpsc::channel(DEFAULT_CAPACITY);
        let collector = AnalyticsCollector {
            rx,
            endpoint,
            client: reqwest::Client::new(),
            capacity: DEFAULT_CAPACITY,
        };

        tokio::spawn(async move { collector.run().await });

        AnalyticsHandle {
            tx,
            capacity: DEFAULT_CAPACITY,
        }
    }

    async fn run(mut self) {
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        let mut ticker = tokio::time::interval(DEFAULT_FLUSH_INTERVAL);
        let high_watermark = (self.capacity as f64 * HIGH_WATERMARK_RATIO) as usize;

        loop {
            tokio::select! {
                event = self.rx.recv() => {
                    match event {
                        Some(e) => {
                            batch.push(e);
                            if batch.len() >= MAX_BATCH_SIZE || self.rx.len() >= high_watermark {
                                self.flush(&mut batch).await;
                            }
                        }
                        None => {
                            self.flush(&mut batch).await;
                            return;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                }
            }
        }
    }

    async fn flush(&self, batch: &mut Vec<AnalyticsEvent>) {
        if batch.is_empty() {
            return;
        }
        let events: Vec<AnalyticsEvent> = batch.drain(..).collect();

        let Some(endpoint) = &self.endpoint else {
            return;
        };

        if let Err(e) = self.client.post(endpoint).json(&events).send().await {
            warn!(error = %e, count = events.len(), "failed to ship analytics batch");
        }
    }
}

/// Fire-and-forget webhook fan-out and `COPY_TO_URL` mirroring. Both
/// share a "swallow the error, warn, move on" policy.
#[derive(Clone)]
pub struct ExternalSinks {
    client: reqwest::Client,
    webhook_urls: Vec<String>,
    copy_to_url: Option<String>,
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    topic: &'a str,
    hash: &'a str,
}

impl ExternalSinks {
    pub fn new(webhook_urls: Vec<String>, copy_to_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_urls,
            copy_to_url,
        }
    }

    pub fn fire_webhooks(&self, client_id: &str, topic: &str, body: &[u8]) {
        if self.webhook_urls.is_empty() {
            return;
        }
        let hash = hex::encode(Sha256::digest(body));
        for base in self.webhook_urls.clone() {
            let client = self.client.clone();
            let url = format!("{}/{}", base.trim_end_matches('/'), client_id);
            let payload = WebhookBody { topic, hash: &hash };
            let payload_json = serde_json::to_string(&payload).unwrap_or_default();
            tokio::spawn(async move {
                match client
                    .post(&url)
                    .header("content-type", "application/json")
                    .body(payload_json)
                    .send()
                    .await
                {
                    Ok(resp) if !resp.status().is_success() => {
                        warn!(url, status = %resp.status(), "webhook returned non-200");
                    }
                    Err(e) => warn!(url, error = %e, "webhook delivery failed"),
                    _ => {}
                }
            });
        }
    }

    pub fn copy_to(&self, body: Vec<u8>) {
        let Some(url) = self.copy_to_url.clone() else {
            return;
        };
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(e) = client.post(&url).body(body).send().await {
                warn!(url, error = %e, "copy-to-url delivery failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn try_add_succeeds_under_capacity() {
        let handle = AnalyticsCollector::spawn(None);
        assert!(handle.try_add(AnalyticsEvent::bridge_message_sent("a", "b", 1)));
    }

    #[test]
    fn webhook_hash_is_deterministic() {
        let sinks = ExternalSinks::new(vec![], None);
        let _ = sinks; // construction should not panic without a webhook URL
        let a = hex::encode(Sha256::digest(b"payload"));
        let b = hex::encode(Sha256::digest(b"payload"));
        assert_eq!(a, b);
    }
}
