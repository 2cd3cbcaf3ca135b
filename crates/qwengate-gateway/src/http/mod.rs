pub mod chat;
pub mod health;
pub mod models;
pub mod refresh;
pub mod ui;

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde_json::json;

use qwengate_core::GateError;
use qwengate_upstream::UpstreamError;

/// JSON error body: `{error, details, requestId}` with the taxonomy status.
pub fn error_response(err: &GateError, request_id: &str) -> Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::BAD_GATEWAY);
    let body = json!({
        "error": err.code(),
        "details": err.to_string(),
        "requestId": request_id,
    });
    (status, Json(body)).into_response()
}

/// Fold an upstream failure into the client-facing taxonomy.
pub fn gate_error(err: UpstreamError) -> GateError {
    match err {
        UpstreamError::Invalid(message) => GateError::BadRequest(message),
        UpstreamError::CreateChat(message) => GateError::CreateChatFailed(message),
        UpstreamError::Api { status, message } => GateError::Upstream { status, message },
        UpstreamError::Translation(message) => GateError::Translation(message),
        UpstreamError::Http(e) => GateError::UpstreamUnavailable(e.to_string()),
        UpstreamError::Parse(message) => GateError::UpstreamUnavailable(message),
        UpstreamError::Unavailable(message) => GateError::UpstreamUnavailable(message),
        UpstreamError::Cancelled => GateError::UpstreamUnavailable("request cancelled".to_string()),
    }
}
