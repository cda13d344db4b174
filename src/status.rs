//! HTTP status endpoints for the agent.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Json, Router, extract::State, response::IntoResponse, routing::get};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::agent::Agent;

/// Build the router with `/health` and `/api/status`.
pub fn status_routes(agent: Arc<Agent>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .with_state(agent)
}

/// Bind `addr` and serve the status routes in the background.
pub async fn spawn_status_server(
    agent: Arc<Agent>,
    addr: SocketAddr,
) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!(addr = %local, "Status server listening");

    let app = status_routes(agent);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Status server stopped");
        }
    });
    Ok((local, handle))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "governor-agent"
    }))
}

// ── Status ──────────────────────────────────────────────────────────────

async fn status(State(agent): State<Arc<Agent>>) -> impl IntoResponse {
    Json(agent.status().await)
}
