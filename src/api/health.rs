//! `/health`, `/ready`, `/version`, `/metrics`: liveness never touches
//! storage, readiness does.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use super::AppState;

#[derive(Serialize)]
pub struct PingResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct VersionResponse {
    pub version: &'static str,
}

/// Liveness probe — returns 200 immediately, no storage round-trip.
pub async fn ping() -> Json<PingResponse> {
    Json(PingResponse { status: "ok" })
}

/// Readiness probe — exercises the configured storage backend's
/// `health_check`, timing out after 5s so a wedged backend fails fast.
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let healthy = tokio::time::timeout(std::time::Duration::from_secs(5), state.storage.health_check())
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);

    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(ReadyResponse {
            status: if healthy { "ok" } else { "unhealthy" },
        }),
    )
}

pub async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Prometheus exposition. The recorder is installed once at startup
/// (see `main.rs`); this handler only renders its current snapshot.
pub async fn metrics(State(state): State<AppState>) -> String {
    state.metrics_handle.render()
}
