use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;

use crate::api::handlers;
use crate::registry::AgentRegistry;
use crate::safety::SafetyOrchestrator;
use crate::shutdown::Shutdown;
use crate::types::WorkflowSnapshot;

#[derive(Clone)]
pub struct AppState {
    pub safety: Arc<SafetyOrchestrator>,
    pub registry: Arc<AgentRegistry>,
    pub workflow: watch::Receiver<WorkflowSnapshot>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/safety", get(handlers::get_safety))
        .route("/workflow", get(handlers::get_workflow))
        .route("/agents", get(handlers::list_agents))
        .route("/agents/:id", get(handlers::get_agent))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16, mut shutdown: Shutdown) -> Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    log::info!("Status API listening on port {}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;
    Ok(())
}
