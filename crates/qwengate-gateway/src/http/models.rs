//! GET /v1/models — the upstream catalogue with feature-suffix variants
//! synthesized per model, plus a static fallback so clients stay usable
//! when the catalogue is unreachable.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use qwengate_core::config::AuthMode;
use qwengate_pool::Identity;
use qwengate_upstream::wire::CatalogueModel;

use crate::app::AppState;
use crate::auth;
use crate::http::error_response;

#[derive(Serialize)]
struct ModelEntry {
    id: String,
    object: &'static str,
    created: i64,
    owned_by: &'static str,
}

pub async fn list_models(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let ident: Option<Identity> = match state.config.auth.mode {
        AuthMode::Server => {
            if let Err(e) = auth::check_api_key(&state.config, &headers, &query, None) {
                return error_response(&e, "models");
            }
            state.pool.acquire()
        }
        // without per-request credentials the static list still answers
        AuthMode::Client => auth::client_identity(&state.config, &headers).ok(),
    };

    let catalogue = match &ident {
        Some(ident) => match state.qwen.list_models(ident).await {
            Ok(models) => models,
            Err(e) => {
                debug!(error = %e, "model catalogue fetch failed, using fallback");
                Vec::new()
            }
        },
        None => Vec::new(),
    };

    let ids = if catalogue.is_empty() {
        fallback_model_ids()
    } else {
        expand_variants(&catalogue)
    };

    let created = Utc::now().timestamp();
    let data: Vec<ModelEntry> = ids
        .into_iter()
        .map(|id| ModelEntry {
            id,
            object: "model",
            created,
            owned_by: "qwen",
        })
        .collect();

    Json(json!({ "object": "list", "data": data })).into_response()
}

/// Emit each catalogue model followed by its synthetic suffix variants.
fn expand_variants(models: &[CatalogueModel]) -> Vec<String> {
    let mut ids = Vec::new();
    for model in models {
        ids.push(model.id.clone());

        let meta = &model.info.meta;
        if meta.capabilities.thinking {
            ids.push(format!("{}-thinking", model.id));
        }
        if meta.chat_type.iter().any(|t| t == "search") {
            ids.push(format!("{}-search", model.id));
        }
        if meta.chat_type.iter().any(|t| t == "t2i") {
            ids.push(format!("{}-image", model.id));
            ids.push(format!("{}-image_edit", model.id));
        }
        if meta.chat_type.iter().any(|t| t == "image_edit") {
            let variant = format!("{}-image_edit", model.id);
            if !ids.contains(&variant) {
                ids.push(variant);
            }
        }
    }
    ids
}

/// Known-good model ids served when the live catalogue is empty or
/// unreachable.
fn fallback_model_ids() -> Vec<String> {
    [
        "qwen3-max",
        "qwen3-max-thinking",
        "qwen-max-latest",
        "qwen-max-latest-search",
        "qwen-plus",
        "qwen-turbo",
        "qwen-long",
        "qwen3-coder",
        "qwen3-vl-plus",
        "qwen3-max-image",
        "qwen3-max-image_edit",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
