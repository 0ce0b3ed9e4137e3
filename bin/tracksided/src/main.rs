//! ---
//! ts_section: "01-core-functionality"
//! ts_subsection: "binary"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "Binary entrypoint for the link daemon."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use trackside_common::{init_tracing, AppConfig, LogFormat};
use trackside_link::SessionManager;
use trackside_metrics::{new_registry, spawn_http_server, LinkMetrics};
use trackside_net::WebSocketServerBuilder;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Trackside link daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "ADDR", help = "Override the WebSocket listen address")]
    listen: Option<SocketAddr>,

    #[arg(
        long,
        value_name = "ENDPOINT",
        help = "Open this endpoint on startup (serial path or TEST)"
    )]
    endpoint: Option<String>,

    #[arg(long, value_name = "FORMAT", help = "Stdout log format: json or pretty")]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/trackside.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    if let Some(endpoint) = cli.endpoint {
        config.link.auto_open = Some(endpoint);
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    init_tracing("tracksided", &config.logging)?;

    match &loaded.source {
        Some(path) => info!(path = %path.display(), "configuration loaded"),
        None => info!("no configuration file found; using defaults"),
    }

    run_daemon(config).await
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let registry = new_registry();
    let metrics = LinkMetrics::new(registry.clone())?;

    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(registry, config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let sessions = SessionManager::from_config(&config, Some(metrics));
    let server = WebSocketServerBuilder::new(config.server.listen, sessions.clone())
        .spawn()
        .await
        .context("failed to start websocket server")?;

    if let Some(endpoint) = &config.link.auto_open {
        if let Err(err) = sessions.open(endpoint).await {
            warn!(endpoint = %endpoint, error = %err, "auto-open failed");
        }
    }

    info!(address = %server.local_addr(), "daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");

    sessions.close().await;
    server.shutdown().await?;
    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}
