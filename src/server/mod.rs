pub mod api;

use anyhow::{Context, Result};
use colored::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::RelayConfig;
use crate::health::spawn_reaper;
use crate::relay::Relay;
use crate::storage;

pub use api::{router, ApiState};

/// Serve the relay rooted at `path` on `port`, using its `config.toml` for
/// everything else.
pub async fn start(port: u16, path: PathBuf) -> Result<()> {
    let relay_path = storage::relay_dir(&path);
    let mut config = RelayConfig::load(&relay_path)?;
    config.server.port = port;
    serve(config, &relay_path).await
}

pub async fn serve(config: RelayConfig, relay_path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(relay_path)
        .await
        .with_context(|| format!("failed to create {}", relay_path.display()))?;

    let relay = Arc::new(Relay::open(relay_path, &config).context("failed to open relay store")?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = spawn_reaper(relay.health_monitor(), shutdown_rx);

    let app = router(relay, &config.server.prefix);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    println!(
        "{} Relay running at {}{}",
        "✓".green(),
        format!("http://{}", addr).bright_blue(),
        config.server.prefix.bright_black()
    );
    tracing::info!(%addr, prefix = %config.server.prefix, "relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = reaper.await;
    tracing::info!("relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
