use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use qwengate_core::config::{AuthMode, GateConfig};
use qwengate_pool::IdentityPool;
use qwengate_upstream::{CookieTokenExchanger, QwenClient};

mod app;
mod auth;
mod http;
mod sched;

#[derive(Parser)]
#[command(name = "qwengate", about = "OpenAI-compatible proxy for the Qwen web chat")]
struct Args {
    /// Path to qwengate.toml (default: QWENGATE_CONFIG, then ~/.qwengate/qwengate.toml).
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "qwengate=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();
    let config_path = args.config.or_else(|| std::env::var("QWENGATE_CONFIG").ok());
    let config = GateConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        GateConfig::default()
    });

    let qwen = QwenClient::new(&config.upstream.base_url)?;
    let exchanger = Arc::new(CookieTokenExchanger::new(&config.upstream.base_url)?);

    let pool = Arc::new(IdentityPool::new());
    let pairs = config.identity_pairs();
    if pairs.is_empty() && config.auth.mode == AuthMode::Server {
        warn!("no upstream credentials configured; server-mode requests will fail");
    }
    pool.initialize(pairs, &*exchanger).await;

    let bind = config.server.bind.clone();
    let port = config.server.port;
    let state = Arc::new(app::AppState::new(config, pool, qwen, exchanger));
    sched::spawn_schedulers(state.clone());
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!("qwengate listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
