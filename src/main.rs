//! Server entry point.
//!
//! Initializes logging, loads the configuration, and serves the tunnel
//! router until a shutdown signal arrives.

use std::net::SocketAddr;
use std::path::PathBuf;

use tracing::info;

use chara_tunnel::config::ServerConfig;
use chara_tunnel::error::Result;
use chara_tunnel::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Structured logging with env-filter support. Default level is `info`
    // for this crate; override with `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chara_tunnel=info".into()),
        )
        .init();

    // Config file path: env var first, then the first CLI argument.
    let config_path = std::env::var_os("CHARA_TUNNEL_CONFIG")
        .map(PathBuf::from)
        .or_else(|| std::env::args().nth(1).map(PathBuf::from));
    let config = ServerConfig::load(config_path.as_ref())?;
    info!(
        domain = %config.domain,
        control = %config.control_domain(),
        replacements = config.replacements.len(),
        "configuration loaded"
    );

    let state = AppState::new(config)?;

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    info!("🚇 chara tunnel listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        chara_tunnel::app(state.clone()).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Fail whatever is still in flight so every resolver fires before exit.
    state.drain();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received, draining sessions");
}
