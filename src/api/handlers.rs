use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::api::server::AppState;
use crate::safety::SafetyStatus;
use crate::types::{AgentInfo, WorkflowSnapshot};

#[derive(Debug, Deserialize)]
pub struct AgentQuery {
    pub capability: Option<String>,
}

pub async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.workflow.borrow().clone();
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "agent_id": snapshot.agent_id,
        "state": snapshot.state,
        "safe": state.safety.is_safe_to_proceed(),
    }))
}

pub async fn get_safety(State(state): State<AppState>) -> Json<SafetyStatus> {
    Json(state.safety.get_comprehensive_safety_status())
}

pub async fn get_workflow(State(state): State<AppState>) -> Json<WorkflowSnapshot> {
    Json(state.workflow.borrow().clone())
}

pub async fn list_agents(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
) -> Result<Json<Vec<AgentInfo>>, ApiError> {
    let capability = query.capability.as_deref().map(str::trim);
    if capability == Some("") {
        return Err(ApiError::BadRequest("capability must not be empty".into()));
    }
    let agents = state.registry.discover(capability).await?;
    Ok(Json(agents))
}

pub async fn get_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<AgentInfo>, ApiError> {
    state
        .registry
        .discover(None)
        .await?
        .into_iter()
        .find(|a| a.agent_id == agent_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("agent {} is not live", agent_id)))
}
