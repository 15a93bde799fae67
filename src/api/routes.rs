use axum::routing::{get, post};
use axum::Router;

use super::{events, health, message, verify, AppState};

/// Bridge routes. No session/API-key auth: peers are identified only by
/// opaque client ids, per §1.
pub fn bridge_routes() -> Router<AppState> {
    Router::new()
        .route("/bridge/events", get(events::stream_events))
        .route("/bridge/message", post(message::send_message))
        .route("/bridge/verify", post(verify::verify_connect))
}

pub fn ops_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::ping))
        .route("/ready", get(health::ready))
        .route("/version", get(health::version))
        .route("/metrics", get(health::metrics))
}
