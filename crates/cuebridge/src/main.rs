use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cueconf::CueConfig;
use cueproto::{Listener, WsConnector};
use tracing_subscriber::EnvFilter;

use cuebridge::{BridgeAgent, BuiltinFactory, DeviceManager};

/// A cue bridge: drives devices on behalf of a hub
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file (replaces ./cue.toml in the search order)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port the hub dials in on
    #[arg(short, long)]
    port: Option<u16>,

    /// Bridge id (the hub assigns one when unset)
    #[arg(long)]
    id: Option<String>,

    /// Dial the hub at this URL (e.g., "ws://hub:5400")
    #[arg(long)]
    hub_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, sources) =
        CueConfig::load_with_sources_from(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(port) = cli.port {
        config.infra.bind.bridge_port = port;
    }
    if cli.id.is_some() {
        config.bootstrap.bridge.id = cli.id;
    }
    if cli.hub_url.is_some() {
        config.bootstrap.bridge.hub_url = cli.hub_url;
    }

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.infra.telemetry.log_level)),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    tracing::info!("cuebridge {} starting", env!("CARGO_PKG_VERSION"));
    for file in &sources.files {
        tracing::info!("   config: {}", file.display());
    }
    if !sources.env_overrides.is_empty() {
        tracing::info!("   env overrides: {}", sources.env_overrides.join(", "));
    }

    let addr = format!("0.0.0.0:{}", config.infra.bind.bridge_port);
    let (listener, incoming) = Listener::bind(addr, Arc::new(WsConnector))
        .await
        .context("Failed to start hub listener")?;

    let bound = listener.local_addr();
    let (manager, device_events, manager_task) = DeviceManager::spawn(Arc::new(BuiltinFactory));
    let (agent, agent_task) = BridgeAgent::spawn(
        listener,
        incoming,
        manager,
        device_events,
        config.bootstrap.bridge.id.clone(),
    );

    if let Some(url) = config.bootstrap.bridge.hub_url.as_deref().filter(|u| !u.is_empty()) {
        agent.dial_hub(url).context("Agent stopped during startup")?;
    }

    match bound {
        Some(addr) => tracing::info!("🌉 bridge ready on {}", addr),
        None => tracing::info!("🌉 bridge ready on port {}", config.infra.bind.bridge_port),
    }

    // Log each id the hub assigns
    let mut identity = agent.watch_identity();
    tokio::spawn(async move {
        while identity.changed().await.is_ok() {
            if let Some(id) = identity.borrow_and_update().as_deref() {
                tracing::info!("🪪 bridge id is now {}", id);
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    tracing::info!("Received SIGINT (Ctrl+C), shutting down gracefully...");

    agent.shutdown();
    let _ = agent_task.await;
    let _ = manager_task.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
