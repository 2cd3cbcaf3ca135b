//! Background maintenance: periodic token refresh across the pool and
//! best-effort housekeeping of old upstream chats. Both loops are
//! fire-and-forget and survive individual iteration errors.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::app::AppState;

pub fn spawn_schedulers(state: Arc<AppState>) {
    spawn_token_refresh(state.clone());
    spawn_chat_cleanup(state);
}

fn spawn_token_refresh(state: Arc<AppState>) {
    let period = Duration::from_secs(state.config.refresh.interval_hours.max(1) * 3600);
    let warn_secs = (state.config.refresh.warn_window_days * 86_400) as i64;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // startup already admitted identities with fresh tokens
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let outcomes = state
                .pool
                .refresh_expired(&*state.exchanger, warn_secs, false)
                .await;
            if !outcomes.is_empty() {
                let refreshed = outcomes.iter().filter(|o| o.refreshed).count();
                info!(
                    refreshed,
                    failed = outcomes.len() - refreshed,
                    "token refresh sweep complete"
                );
            }
        }
    });
}

fn spawn_chat_cleanup(state: Arc<AppState>) {
    let period = Duration::from_secs(state.config.cleanup.interval_minutes.max(1) * 60);
    let page_size = state.config.cleanup.page_size;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(ident) = state.pool.healthy_identity() else {
                debug!("no healthy identity, skipping chat cleanup");
                continue;
            };
            if let Err(e) = state.qwen.delete_old_chats(&ident, page_size).await {
                warn!(error = %e, "chat cleanup sweep failed");
            }
        }
    });
}
