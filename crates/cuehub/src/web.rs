//! Read-only HTTP status endpoint.

use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::orchestrator::OrchestratorHandle;
use crate::status::HubStatus;

#[derive(Clone)]
pub struct WebState {
    pub orchestrator: OrchestratorHandle,
    pub start_time: Instant,
}

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/bridges", get(bridges_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<WebState>) -> Json<Value> {
    let status = state.orchestrator.status();
    let connected = status.values().filter(|b| b.connected).count();

    Json(json!({
        "status": "healthy",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "bridges": {
            "total": status.len(),
            "connected": connected,
        }
    }))
}

async fn bridges_handler(State(state): State<WebState>) -> Json<HubStatus> {
    Json(state.orchestrator.status())
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(port: u16, orchestrator: OrchestratorHandle, shutdown: CancellationToken) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind status endpoint on {}", addr))?;

    let app = router(WebState {
        orchestrator,
        start_time: Instant::now(),
    });

    info!("🌐 status endpoint on http://{}/bridges", addr);
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown.cancelled().await;
    });

    if let Err(e) = server.await {
        error!("status endpoint stopped with error: {:?}", e);
    }
    Ok(())
}
