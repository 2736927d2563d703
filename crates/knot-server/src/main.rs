//! # knot-server
//!
//! Gateway binary: loads settings, starts the WebSocket listener and runs
//! the bounded shutdown on ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use knot_gateway::config::{BroadcastConfig, ServerConfig, SessionConfig};
use knot_gateway::server::GatewayServer;
use knot_gateway::{Registry, ShutdownOutcome};
use knot_settings::GatewaySettings;

/// Team-grouped WebSocket gateway.
#[derive(Parser, Debug)]
#[command(name = "knot-gateway", about = "Team-grouped WebSocket gateway")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the settings file (default `~/.knot/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// How long shutdown waits for sessions to close (overrides settings).
    #[arg(long)]
    shutdown_timeout_ms: Option<u64>,

    /// Log filter, e.g. `info` or `knot_gateway=debug` (overrides settings).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    /// Load settings from the chosen file and apply command-line overrides.
    fn resolve_settings(&self) -> Result<GatewaySettings> {
        let path = self
            .settings
            .clone()
            .unwrap_or_else(knot_settings::loader::settings_path);
        let mut settings = knot_settings::loader::load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;

        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(timeout_ms) = self.shutdown_timeout_ms {
            settings.shutdown.timeout_ms = timeout_ms;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        settings.validate().context("Invalid settings")?;
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = args.resolve_settings()?;

    knot_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);
    let metrics_handle =
        knot_gateway::metrics::install_recorder().context("Failed to install metrics recorder")?;

    let registry = match BroadcastConfig::from_settings(&settings) {
        Some(broadcast) => {
            tracing::info!(interval = ?broadcast.interval, "team broadcast enabled");
            Registry::with_broadcast(broadcast).context("Invalid broadcast config")?
        }
        None => Registry::new(),
    };

    let server = GatewayServer::new(
        ServerConfig::from(&settings),
        SessionConfig::from(&settings),
        registry,
    )
    .with_metrics(metrics_handle);

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("knot gateway listening on ws://{addr}");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    let timeout = Duration::from_millis(settings.shutdown.timeout_ms);
    match server.close(timeout).await {
        ShutdownOutcome::Completed { sessions } => {
            tracing::info!(sessions, "all sessions closed");
        }
        ShutdownOutcome::TimedOut => {
            tracing::warn!(?timeout, "shutdown timed out with sessions still closing");
        }
        ShutdownOutcome::Failed => {
            tracing::error!("session shutdown failed");
        }
    }
    let _ = handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
