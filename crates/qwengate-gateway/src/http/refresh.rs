use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use qwengate_core::config::AuthMode;

use crate::app::AppState;
use crate::auth;
use crate::http::error_response;

/// POST /refresh-token — force a cookie → token exchange across the pool
/// and report per-identity outcomes.
pub async fn refresh_token_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if state.config.auth.mode == AuthMode::Server {
        if let Err(e) = auth::check_api_key(&state.config, &headers, &query, None) {
            return error_response(&e, "refresh-token");
        }
    }

    let warn_secs = (state.config.refresh.warn_window_days * 86_400) as i64;
    let outcomes = state
        .pool
        .refresh_expired(&*state.exchanger, warn_secs, true)
        .await;

    let refreshed = outcomes.iter().filter(|o| o.refreshed).count();
    Json(json!({
        "refreshed": refreshed,
        "failed": outcomes.len() - refreshed,
        "results": outcomes,
    }))
    .into_response()
}
