//! `POST /bridge/message` (§4.9): validate, dedupe, fan out to external
//! sinks, seal the request source, and publish through storage.

use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{ok_message_body, BridgeError};
use crate::ids::{LocalClock, TimeProvider};
use crate::realip;
use crate::storage::SseMessage;
use crate::crypto;

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct MessageParams {
    pub client_id: String,
    pub to: String,
    pub ttl: u64,
    pub topic: Option<String>,
    pub trace_id: Option<String>,
    pub no_request_source: Option<bool>,
}

#[derive(Serialize)]
struct ConnectSource {
    ip: String,
}

#[derive(Serialize)]
struct BridgeEnvelope {
    from: String,
    message: String,
    trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_source: Option<String>,
    connect_source: ConnectSource,
}

const MAX_TTL_SECONDS: u64 = 300;

pub async fn send_message(
    State(state): State<AppState>,
    Query(params): Query<MessageParams>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl axum::response::IntoResponse, BridgeError> {
    if params.client_id.trim().is_empty() {
        return Err(BridgeError::Validation("client_id is required".into()));
    }
    if params.to.trim().is_empty() {
        return Err(BridgeError::Validation("to is required".into()));
    }
    if params.ttl > MAX_TTL_SECONDS {
        return Err(BridgeError::Validation(format!("ttl must be <= {MAX_TTL_SECONDS}")));
    }
    if body.len() > state.config.max_body_size {
        return Err(BridgeError::Validation("body exceeds max_body_size".into()));
    }

    let bypass = state
        .bypass_tokens
        .check(headers.get("authorization").and_then(|v| v.to_str().ok()));
    if !bypass {
        state.rps.check()?;
    }

    let message_id = message_id_for(&body, &params.client_id);
    let first_seen = state.transferred_cache.mark_if_not_exists(message_id).await;
    if first_seen {
        metrics::counter!("bridge_unique_transferred_total").increment(1);
    }

    if let Some(copy_url) = state.config.copy_to_url.as_ref() {
        if !copy_url.is_empty() {
            state.sinks.copy_to(body.to_vec());
        }
    }
    if let Some(topic) = params.topic.as_deref() {
        state.sinks.fire_webhooks(&params.client_id, topic, &body);
    }

    let forwarded_for = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok());
    let ip = realip::extract(forwarded_for, remote.ip(), &state.trusted_proxy_ranges).to_string();
    let origin = headers.get("origin").and_then(|v| v.to_str().ok()).unwrap_or("").to_string();
    let user_agent = headers.get("user-agent").and_then(|v| v.to_str().ok()).unwrap_or("").to_string();

    let request_source = if params.no_request_source != Some(true) {
        let now_ms = LocalClock.now_ms();
        Some(BASE64.encode(crypto::seal_request_source(&params.to, &origin, &ip, &user_agent, now_ms)?))
    } else {
        None
    };

    let trace_id = params
        .trace_id
        .as_deref()
        .and_then(|t| Uuid::parse_str(t).ok())
        .unwrap_or_else(Uuid::now_v7)
        .to_string();

    let envelope = BridgeEnvelope {
        from: params.client_id.clone(),
        message: BASE64.encode(&body),
        trace_id,
        request_source,
        connect_source: ConnectSource { ip },
    };
    let payload = serde_json::to_vec(&envelope).map_err(|e| BridgeError::Validation(e.to_string()))?;

    let ttl = disconnect_ttl_override(
        params.topic.as_deref(),
        payload.len(),
        state.config.disconnect_event_max_size,
        state.config.disconnect_events_ttl,
    )
    .unwrap_or(params.ttl);

    let event_id = state.ids.next_id();
    state
        .storage
        .publish(
            SseMessage {
                event_id,
                to: params.to.clone(),
                payload,
            },
            ttl,
        )
        .await?;

    if let Some(analytics) = &state.analytics {
        analytics.try_add(crate::analytics::AnalyticsEvent::bridge_message_sent(&params.client_id, &params.to, event_id));
    }

    Ok(ok_message_body())
}

/// Small disconnect-notification payloads get the longer disconnect TTL
/// instead of whatever `ttl` the caller requested, so long as the payload
/// stays under the configured size ceiling.
fn disconnect_ttl_override(topic: Option<&str>, payload_len: usize, max_size: usize, disconnect_ttl: u64) -> Option<u64> {
    if topic == Some("disconnect") && payload_len < max_size {
        Some(disconnect_ttl)
    } else {
        None
    }
}

fn message_id_for(body: &[u8], client_id: &str) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hasher.update(client_id.as_bytes());
    let digest = hasher.finalize();
    i64::from_be_bytes(digest[0..8].try_into().expect("sha256 digest is 32 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_is_deterministic() {
        let a = message_id_for(b"hello", "client-a");
        let b = message_id_for(b"hello", "client-a");
        assert_eq!(a, b);
    }

    #[test]
    fn message_id_depends_on_client_id() {
        let a = message_id_for(b"hello", "client-a");
        let b = message_id_for(b"hello", "client-b");
        assert_ne!(a, b);
    }

    #[test]
    fn disconnect_topic_under_size_ceiling_gets_longer_ttl() {
        let ttl = disconnect_ttl_override(Some("disconnect"), 100, 512, 86400);
        assert_eq!(ttl, Some(86400));
    }

    #[test]
    fn disconnect_topic_over_size_ceiling_keeps_requested_ttl() {
        let ttl = disconnect_ttl_override(Some("disconnect"), 1000, 512, 86400);
        assert_eq!(ttl, None);
    }

    #[test]
    fn non_disconnect_topic_never_overridden() {
        let ttl = disconnect_ttl_override(Some("other"), 10, 512, 86400);
        assert_eq!(ttl, None);
        let ttl = disconnect_ttl_override(None, 10, 512, 86400);
        assert_eq!(ttl, None);
    }
}
