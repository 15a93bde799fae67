//! `POST /bridge/verify` (§4.9, §4.4): anti-phishing connect-verify check.
//! Always returns 200; unknown params are the only path to a 400.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::realip;

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct VerifyParams {
    pub client_id: String,
    pub url: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[derive(Serialize)]
pub struct VerifyResponse {
    pub status: &'static str,
}

pub async fn verify_connect(
    State(state): State<AppState>,
    Query(params): Query<VerifyParams>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<VerifyResponse>, BridgeError> {
    if let Some(kind) = params.kind.as_deref() {
        if kind != "connect" {
            return Err(BridgeError::Validation(format!("unsupported verify type: {kind}")));
        }
    }
    if params.client_id.trim().is_empty() || params.url.trim().is_empty() {
        return Err(BridgeError::Validation("client_id and url are required".into()));
    }

    let forwarded_for = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok());
    let ip = realip::extract(forwarded_for, remote.ip(), &state.trusted_proxy_ranges).to_string();

    let status = state.storage.verify_connection(&params.client_id, &ip, &params.url).await?;

    Ok(Json(VerifyResponse { status: status.as_str() }))
}
