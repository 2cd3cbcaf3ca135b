use axum::{extract::State, Json};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /health — liveness probe with identity-pool aggregates and token
/// freshness.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let pool = state.pool.status();
    let now = Utc::now().timestamp();

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": now - state.started_at,
        "auth_mode": state.config.auth.mode,
        "upstream": state.qwen.base_url(),
        "vision_fallback_model": state.config.upstream.vision_fallback_model,
        "active_requests": state.active_requests.len(),
        "token_fresh": pool.soonest_expiry.map(|exp| exp > now),
        "identity_pool": pool,
    }))
}
