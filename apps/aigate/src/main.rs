use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use aigate_common::GlobalConfigPatch;
use aigate_monitor::MemoryMonitor;
use aigate_relay::{AppState, AsyncConsumer, PassthroughHandler, RelayEngine};

mod cli;
mod seed;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = cli::Cli::parse();
    let mut patch = GlobalConfigPatch::default();
    patch.overlay(cli::env_patch());
    patch.overlay(cli.as_patch());
    let config = patch.into_config()?;

    let state = Arc::new(AppState::new(config.clone()));
    seed::apply(&state, seed::load(&cli.seed)?);

    let monitor = Arc::new(MemoryMonitor::default());
    let consumer = AsyncConsumer::spawn();
    let handler = Arc::new(PassthroughHandler::new()?);
    let engine = Arc::new(RelayEngine::new(
        state,
        monitor,
        Arc::new(consumer.sink()),
        handler,
    ));

    let app = axum::Router::new()
        .merge(aigate_router::relay_router(engine.clone()))
        .nest("/admin", aigate_router::admin_router(engine));

    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(event = "listening", bind = %bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    // Let the recorder drain before the process exits.
    consumer.shutdown().await;
    Ok(())
}
