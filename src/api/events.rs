//! `GET /bridge/events`: the SSE streaming handler. A client-id-routed
//! relay with no authentication, replay-by-cursor, and a configurable
//! heartbeat, built around an `mpsc::Receiver<Event>` filled by a
//! background task.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream::Stream;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

use crate::error::BridgeError;
use crate::realip;
use crate::session::{Session, SessionV1};

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct EventsParams {
    pub client_id: String,
    pub last_event_id: Option<i64>,
    pub trace_id: Option<String>,
    pub heartbeat: Option<String>,
    pub enable_queue_done_event: Option<bool>,
}

#[derive(Clone, Copy)]
enum HeartbeatStyle {
    Legacy,
    Message,
}

fn parse_heartbeat(raw: Option<&str>) -> Result<HeartbeatStyle, BridgeError> {
    match raw {
        None | Some("legacy") => Ok(HeartbeatStyle::Legacy),
        Some("message") => Ok(HeartbeatStyle::Message),
        Some(other) => Err(BridgeError::Validation(format!("unknown heartbeat style: {other}"))),
    }
}

/// Per §4.9: parameters come from a JSON body when `Content-Type:
/// application/json`, otherwise from the query string.
fn parse_events_params(uri: &Uri, headers: &HeaderMap, body: &[u8]) -> Result<EventsParams, BridgeError> {
    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));

    if is_json && !body.is_empty() {
        serde_json::from_slice(body).map_err(|e| BridgeError::Validation(format!("invalid json body: {e}")))
    } else {
        serde_urlencoded::from_str(uri.query().unwrap_or(""))
            .map_err(|e| BridgeError::Validation(format!("invalid query params: {e}")))
    }
}

/// Merges a session's message channel and a heartbeat ticker into one SSE
/// event stream.
struct BridgeEventStream {
    rx: mpsc::Receiver<Event>,
}

impl Stream for BridgeEventStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(Ok(event))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Same wrapper shape as `BridgeEventStream`, but for the legacy v1 path's
/// pre-framed raw bytes rather than axum's `Event` builder.
struct RawFrameStream {
    rx: mpsc::Receiver<Result<Bytes, Infallible>>,
}

impl Stream for RawFrameStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

pub async fn stream_events(
    State(state): State<AppState>,
    uri: Uri,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, BridgeError> {
    let params = parse_events_params(&uri, &headers, &body)?;

    let client_ids: Vec<String> = params
        .client_id
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if client_ids.is_empty() {
        return Err(BridgeError::Validation("client_id is required".into()));
    }

    let heartbeat_style = parse_heartbeat(params.heartbeat.as_deref())?;

    let last_event_id = params
        .last_event_id
        .or_else(|| {
            headers
                .get("last-event-id")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
        })
        .unwrap_or(0);

    let _trace_id = params
        .trace_id
        .as_deref()
        .and_then(|t| Uuid::parse_str(t).ok())
        .unwrap_or_else(Uuid::now_v7);

    let forwarded_for = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok());
    let ip = realip::extract(forwarded_for, remote.ip(), &state.trusted_proxy_ranges).to_string();
    let origin = headers.get("origin").and_then(|v| v.to_str().ok()).unwrap_or("").to_string();
    let user_agent = headers.get("user-agent").and_then(|v| v.to_str().ok()).unwrap_or("").to_string();

    let bypass = state
        .bypass_tokens
        .check(headers.get("authorization").and_then(|v| v.to_str().ok()));
    let lease = if bypass { None } else { Some(state.connections.lease(&ip)?) };

    for client_id in &client_ids {
        state
            .storage
            .add_connection(
                crate::storage::ConnectionEntry {
                    client_id: client_id.clone(),
                    ip: ip.clone(),
                    origin: origin.clone(),
                    user_agent: user_agent.clone(),
                },
                state.config.connect_cache_ttl.as_secs(),
            )
            .await?;
    }

    if params.enable_queue_done_event.unwrap_or(false) {
        return Ok(stream_events_v1(state, client_ids, last_event_id, heartbeat_style, lease));
    }

    let session = Arc::new(Session::new(state.storage.clone(), client_ids.clone(), last_event_id));
    session.start().await?;

    let (out_tx, out_rx) = mpsc::channel(64);
    let heartbeat_interval = state.config.heartbeat_interval;
    let expired_cache = state.expired_cache.clone();

    tokio::spawn(async move {
        // `lease` and `session` live for the whole task; dropping them on
        // every exit path releases the connection slot and unsubscribes.
        let _lease = lease;
        let mut messages = session.messages();
        let mut ticker = tokio::time::interval(heartbeat_interval);
        ticker.tick().await; // first tick is immediate, skip it

        loop {
            tokio::select! {
                biased;
                msg = messages.recv() => {
                    match msg {
                        Some(m) => {
                            expired_cache.mark(m.event_id).await;
                            let data = String::from_utf8_lossy(&m.payload).to_string();
                            let event = Event::default().id(m.event_id.to_string()).event("message").data(data);
                            if out_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    let event = match heartbeat_style {
                        HeartbeatStyle::Legacy => Event::default().event("heartbeat").data(""),
                        HeartbeatStyle::Message => Event::default().event("message").data("heartbeat"),
                    };
                    if out_tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
        }

        debug!("sse stream ended, closing session");
        session.close().await;
    });

    Ok((
        StatusCode::OK,
        Sse::new(BridgeEventStream { rx: out_rx }).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))),
    )
        .into_response())
}

/// Legacy v1 path (`enable_queue_done_event=true`, §4.8/§9): raw pre-framed
/// bytes straight from [`SessionV1`], rather than axum's `Event` builder,
/// since the historical-drain and heartbeat producers already emit
/// complete SSE frames. A forwarding task bridges `SessionV1`'s frame
/// channel to the HTTP body stream and flips the `closer` watch the moment
/// the client goes away, so both producers observe cancellation instead of
/// running until the process exits.
fn stream_events_v1(
    state: AppState,
    client_ids: Vec<String>,
    last_event_id: i64,
    heartbeat_style: HeartbeatStyle,
    lease: Option<crate::limiter::ConnectionLease>,
) -> Response {
    let heartbeat_frame = match heartbeat_style {
        HeartbeatStyle::Legacy => b"event: heartbeat\n\n".to_vec(),
        HeartbeatStyle::Message => b"event: message\r\ndata: heartbeat\r\n\r\n".to_vec(),
    };

    let session = SessionV1::new(
        state.storage.clone(),
        client_ids,
        last_event_id,
        state.config.heartbeat_interval,
        true,
    );
    let (closer_tx, closer_rx) = watch::channel(false);
    let mut frames = session.run(heartbeat_frame, closer_rx);

    let (body_tx, body_rx) = mpsc::channel::<Result<Bytes, Infallible>>(64);
    tokio::spawn(async move {
        let _lease = lease;
        while let Some(frame) = frames.recv().await {
            if body_tx.send(Ok(Bytes::from(frame))).await.is_err() {
                let _ = closer_tx.send(true);
                break;
            }
        }
    });

    let mut response = Response::new(axum::body::Body::from_stream(RawFrameStream { rx: body_rx }));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("private, no-cache, no-transform"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_params_from_query_by_default() {
        let uri: Uri = "/bridge/events?client_id=a,b&last_event_id=5".parse().unwrap();
        let headers = HeaderMap::new();
        let params = parse_events_params(&uri, &headers, b"").unwrap();
        assert_eq!(params.client_id, "a,b");
        assert_eq!(params.last_event_id, Some(5));
    }

    #[test]
    fn parses_params_from_json_body_when_content_type_matches() {
        let uri: Uri = "/bridge/events".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let body = br#"{"client_id":"a","last_event_id":7}"#;
        let params = parse_events_params(&uri, &headers, body).unwrap();
        assert_eq!(params.client_id, "a");
        assert_eq!(params.last_event_id, Some(7));
    }

    #[test]
    fn falls_back_to_query_when_json_content_type_but_empty_body() {
        let uri: Uri = "/bridge/events?client_id=a".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let params = parse_events_params(&uri, &headers, b"").unwrap();
        assert_eq!(params.client_id, "a");
    }

    #[test]
    fn rejects_malformed_json_body() {
        let uri: Uri = "/bridge/events".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let result = parse_events_params(&uri, &headers, b"{not json");
        assert!(result.is_err());
    }

    #[test]
    fn heartbeat_style_defaults_to_legacy() {
        assert!(matches!(parse_heartbeat(None).unwrap(), HeartbeatStyle::Legacy));
        assert!(matches!(parse_heartbeat(Some("message")).unwrap(), HeartbeatStyle::Message));
        assert!(parse_heartbeat(Some("bogus")).is_err());
    }
}
