use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use qwengate_core::config::{GateConfig, MAX_BODY_BYTES};
use qwengate_pool::IdentityPool;
use qwengate_upstream::{CookieTokenExchanger, QwenClient};

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: GateConfig,
    pub pool: Arc<IdentityPool>,
    pub qwen: QwenClient,
    pub exchanger: Arc<CookieTokenExchanger>,
    pub started_at: i64,
    /// In-flight completions: request id -> cancellation for the upstream
    /// pump. Entries are removed when the response finishes or the client
    /// disconnects.
    pub active_requests: DashMap<String, CancellationToken>,
}

impl AppState {
    pub fn new(
        config: GateConfig,
        pool: Arc<IdentityPool>,
        qwen: QwenClient,
        exchanger: Arc<CookieTokenExchanger>,
    ) -> Self {
        Self {
            config,
            pool,
            qwen,
            exchanger,
            started_at: Utc::now().timestamp(),
            active_requests: DashMap::new(),
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(crate::http::ui::ui_handler))
        .route("/health", get(crate::http::health::health_handler))
        .route("/v1/models", get(crate::http::models::list_models))
        .route(
            "/v1/chat/completions",
            post(crate::http::chat::chat_completions),
        )
        .route(
            "/refresh-token",
            post(crate::http::refresh::refresh_token_handler),
        )
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
}
