//! Bridge error taxonomy.
//!
//! A single JSON-serializable error type that every handler converts into
//! via `?`, shaped to the two wire formats actually used:
//! `{"message": "...", "statusCode": n}` for `/bridge/message` and
//! `/bridge/events`, and a bare `{"status": "..."}` for `/bridge/verify`
//! (verify never surfaces a `BridgeError`; it always returns 200).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("{0}")]
    Validation(String),

    #[error("too many streaming connections")]
    ConnectionLimited,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("streaming not supported")]
    StreamingUnsupported,

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Serialize)]
struct MessageBody {
    message: String,
    #[serde(rename = "statusCode")]
    status_code: u16,
}

impl BridgeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            BridgeError::Validation(_) | BridgeError::Crypto(_) => StatusCode::BAD_REQUEST,
            BridgeError::ConnectionLimited | BridgeError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            BridgeError::StreamingUnsupported => StatusCode::INTERNAL_SERVER_ERROR,
            BridgeError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = MessageBody {
            message: self.to_string(),
            status_code: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

/// Success body for `POST /bridge/message`: `{"message":"OK","statusCode":200}`.
pub fn ok_message_body() -> impl IntoResponse {
    Json(MessageBody {
        message: "OK".to_string(),
        status_code: 200,
    })
}
