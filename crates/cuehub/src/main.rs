use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cueconf::CueConfig;
use cueproto::{Listener, WsConnector};
use tokio_util::sync::CancellationToken;

use cuehub::{telemetry, web, BridgeConfig, Orchestrator};

/// The cue hub: keeps bridges in sync with the show
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file (replaces ./cue.toml in the search order)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port bridges dial in on
    #[arg(short, long)]
    port: Option<u16>,

    /// Port for the HTTP status endpoint (0 disables it)
    #[arg(long)]
    http_port: Option<u16>,

    /// OTLP gRPC endpoint for OpenTelemetry (e.g., "127.0.0.1:4317")
    #[arg(long)]
    otlp_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, sources) =
        CueConfig::load_with_sources_from(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(port) = cli.port {
        config.infra.bind.hub_port = port;
    }
    if let Some(port) = cli.http_port {
        config.infra.bind.http_port = port;
    }
    if let Some(endpoint) = cli.otlp_endpoint {
        config.infra.telemetry.otlp_endpoint = endpoint;
    }

    let telemetry_config = &config.infra.telemetry;
    let telemetry = telemetry::init(
        &telemetry_config.log_level,
        telemetry_config
            .otlp_enabled()
            .then_some(telemetry_config.otlp_endpoint.as_str()),
    )
    .context("Failed to initialize telemetry")?;

    for file in &sources.files {
        tracing::info!("   config: {}", file.display());
    }
    if !sources.env_overrides.is_empty() {
        tracing::info!("   env overrides: {}", sources.env_overrides.join(", "));
    }

    let addr = format!("0.0.0.0:{}", config.infra.bind.hub_port);
    let (listener, incoming) = Listener::bind(addr, Arc::new(WsConnector))
        .await
        .context("Failed to start bridge listener")?;

    let bound = listener.local_addr();
    let (orchestrator, orchestrator_task) = Orchestrator::spawn(listener, incoming);

    let bridges: Vec<BridgeConfig> = config
        .bootstrap
        .bridges
        .iter()
        .map(BridgeConfig::from)
        .collect();
    tracing::info!("🎚️ {} bridges configured", bridges.len());
    orchestrator
        .set_bridges(bridges)
        .context("Orchestrator stopped during startup")?;

    let shutdown = CancellationToken::new();

    if config.infra.bind.http_port != 0 {
        let port = config.infra.bind.http_port;
        let handle = orchestrator.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = web::serve(port, handle, token).await {
                tracing::error!("status endpoint failed: {:#}", e);
            }
        });
    }

    match bound {
        Some(addr) => tracing::info!("🎬 hub ready on {}", addr),
        None => tracing::info!("🎬 hub ready on port {}", config.infra.bind.hub_port),
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    tracing::info!("Received SIGINT (Ctrl+C), shutting down gracefully...");

    shutdown.cancel();
    orchestrator.shutdown();
    let _ = orchestrator_task.await;

    tracing::info!("Shutdown complete");
    telemetry.shutdown();
    Ok(())
}
