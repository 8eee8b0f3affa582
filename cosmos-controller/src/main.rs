use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing_subscriber::prelude::*;

use cosmos_controller::app::App;
use cosmos_controller::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true),
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    tracing::info!(
        http_port = %cfg.http_port,
        grpc_port = %cfg.grpc_port,
        data_path = %cfg.data_path,
        tls = %cfg.tls_enabled(),
        "starting Cosmos controller",
    );

    let (shutdown_tx, _) = broadcast::channel(1);
    if let Err(err) = App::new(cfg, shutdown_tx.clone()).await?.spawn().await {
        tracing::error!(error = ?err);
        let _res = shutdown_tx.send(());
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}
