//! # tether-server
//!
//! Demo server binary: loads settings, starts logging, serves until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tether_logging::{LogFormat, init_subscriber};
use tether_server::server::TetherServer;
use tether_server::settings::load_settings;
use tracing::info;

/// Tether demo server.
#[derive(Parser, Debug)]
#[command(name = "tether-server", about = "Tether demo WebSocket server")]
struct Cli {
    /// Path to a JSON settings file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(short, long)]
    port: Option<u16>,

    /// Log filter directive (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = load_settings(cli.config.as_deref()).context("Failed to load settings")?;
    if let Some(host) = cli.host {
        settings.server.host = host;
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if let Some(level) = cli.log_level {
        settings.logging.level = level;
    }
    if cli.json_logs {
        settings.logging.format = LogFormat::Json;
    }

    init_subscriber(&settings.logging);

    let server = TetherServer::new(settings);
    let listener = server.bind().await.with_context(|| {
        format!(
            "Failed to bind {}:{}",
            server.settings().server.host,
            server.settings().server.port
        )
    })?;

    let shutdown = server.shutdown().clone();
    drop(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl-C, shutting down");
            shutdown.shutdown();
        }
    }));

    server.serve(listener).await.context("Server error")?;
    Ok(())
}
