use std::time::Duration;

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use tangle_core::models::{Agent, AgentReply, AgentTask, SpawnRequest};
use tangle_core::{AppState, ServerError};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_agents).post(spawn_agent))
        .route("/{id}", get(get_agent))
        .route("/{id}/invoke", post(invoke_agent))
        .route("/{id}/terminate", post(terminate_agent))
        .route("/{id}/restart", post(restart_agent))
}

async fn list_agents(State(state): State<AppState>) -> Json<serde_json::Value> {
    let agents = state.agents.list().await;
    Json(serde_json::json!({
        "agents": agents,
        "active": state.agents.active_count().await,
        "max": state.agents.max_agents(),
    }))
}

async fn get_agent(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Result<Json<Agent>, ServerError> {
    state
        .agents
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| ServerError::NotFound(format!("Agent {} not found", id)))
}

async fn spawn_agent(
    State(state): State<AppState>,
    Json(body): Json<SpawnRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let agent_id = state.agents.spawn(body).await?;
    Ok(Json(serde_json::json!({ "agent_id": agent_id })))
}

#[derive(Debug, Deserialize)]
struct InvokeRequest {
    prompt: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    context: serde_json::Value,
    timeout_secs: Option<u64>,
}

/// POST /api/agents/{id}/invoke - hand one task to an idle agent.
async fn invoke_agent(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
    Json(body): Json<InvokeRequest>,
) -> Result<Json<AgentReply>, ServerError> {
    let task = AgentTask {
        prompt: body.prompt,
        payload: body.payload,
        context: body.context,
        timeout: body.timeout_secs.map(Duration::from_secs),
        ..Default::default()
    };
    Ok(Json(state.agents.invoke(&id, task).await?))
}

#[derive(Debug, Deserialize)]
struct TerminateQuery {
    reason: Option<String>,
}

async fn terminate_agent(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
    Query(query): Query<TerminateQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let reason = query.reason.as_deref().unwrap_or("terminated via API");
    state.agents.terminate(&id, reason).await?;
    Ok(Json(serde_json::json!({ "terminated": true })))
}

async fn restart_agent(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let agent_id = state.agents.restart(&id).await?;
    Ok(Json(serde_json::json!({ "agent_id": agent_id, "previous_id": id })))
}
