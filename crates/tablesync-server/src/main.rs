//! # tablesync server
//!
//! Hosts tables for remote tablesync clients.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! tablesync
//!
//! # Run with custom config
//! tablesync --config /path/to/tablesync.toml
//!
//! # Run with environment variables
//! TABLESYNC_PORT=8080 TABLESYNC_HOST=0.0.0.0 tablesync
//! ```

use anyhow::{Context, Result};
use tablesync_server::{metrics, Config, Server};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tablesync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match config_path()? {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    tracing::info!("Starting tablesync server on {}:{}", config.host, config.port);

    if config.metrics.enabled {
        metrics::init_metrics();
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            tracing::error!("Failed to start metrics server: {}", e);
        }
    }

    let listener = TcpListener::bind(config.bind_addr()?).await?;
    let server = Server::new(config);

    let mut serving = tokio::spawn({
        let server = server.clone();
        async move { server.serve(listener).await }
    });

    tokio::select! {
        result = &mut serving => return result?,
        signal = tokio::signal::ctrl_c() => signal.context("Failed to listen for ctrl-c")?,
    }

    tracing::info!("Shutdown signal received");
    server.shutdown().await;
    serving.await?
}

/// `--config <path>`, if given.
fn config_path() -> Result<Option<String>> {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None => Ok(None),
        Some("--config" | "-c") => args.next().map(Some).context("--config requires a path"),
        Some(other) => anyhow::bail!("Unknown argument: {other}"),
    }
}
