use std::time::Duration;

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use tangle_core::models::{Execution, Variables};
use tangle_core::{AppState, ServerError, StartOptions, Workflow};

/// Upper bound for `GET /{id}/wait`.
const MAX_WAIT_MS: u64 = 300_000;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_executions).post(start_execution))
        .route("/{id}", get(get_execution))
        .route("/{id}/wait", get(wait_execution))
        .route("/{id}/cancel", post(cancel_execution))
        .route("/{id}/pause", post(pause_execution))
        .route("/{id}/resume", post(resume_execution))
        .route("/{id}/signal", post(signal_execution))
}

#[derive(Debug, Deserialize)]
struct ListExecutionsQuery {
    workflow_id: Option<String>,
}

async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<ListExecutionsQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let executions = state
        .engine
        .list_executions(query.workflow_id.as_deref())
        .await?;
    Ok(Json(serde_json::json!({ "executions": executions })))
}

#[derive(Debug, Deserialize)]
struct StartExecutionRequest {
    workflow_id: Option<String>,
    workflow: Option<Workflow>,
    #[serde(default)]
    input: Variables,
    user_id: Option<String>,
}

/// POST /api/executions - start a registered workflow, or an inline one.
async fn start_execution(
    State(state): State<AppState>,
    Json(body): Json<StartExecutionRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let options = StartOptions {
        user_id: body.user_id,
    };
    let execution_id = match (body.workflow_id, body.workflow) {
        (Some(id), None) => state.engine.start_by_id(&id, body.input, options).await?,
        (None, Some(workflow)) => state.engine.start(workflow, body.input, options).await?,
        _ => {
            return Err(ServerError::BadRequest(
                "Exactly one of workflow_id or workflow is required".to_string(),
            ))
        }
    };

    Ok(Json(serde_json::json!({ "execution_id": execution_id })))
}

async fn get_execution(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Result<Json<Execution>, ServerError> {
    Ok(Json(state.engine.get_status(&id).await?))
}

#[derive(Debug, Deserialize)]
struct WaitQuery {
    timeout_ms: Option<u64>,
}

/// GET /api/executions/{id}/wait - block until the execution is terminal.
async fn wait_execution(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
    Query(query): Query<WaitQuery>,
) -> Result<Json<Execution>, ServerError> {
    let timeout = Duration::from_millis(query.timeout_ms.unwrap_or(30_000).min(MAX_WAIT_MS));
    Ok(Json(state.engine.wait_for(&id, timeout).await?))
}

#[derive(Debug, Deserialize)]
struct ActorQuery {
    user_id: Option<String>,
}

async fn cancel_execution(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
    Query(query): Query<ActorQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state.engine.cancel(&id, query.user_id.as_deref()).await?;
    Ok(Json(serde_json::json!({ "cancelled": true })))
}

async fn pause_execution(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
    Query(query): Query<ActorQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state.engine.pause(&id, query.user_id.as_deref()).await?;
    Ok(Json(serde_json::json!({ "paused": true })))
}

async fn resume_execution(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
    Query(query): Query<ActorQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state.engine.resume(&id, query.user_id.as_deref()).await?;
    Ok(Json(serde_json::json!({ "resumed": true })))
}

#[derive(Debug, Deserialize)]
struct SignalRequest {
    name: String,
    #[serde(default)]
    payload: serde_json::Value,
    user_id: Option<String>,
}

async fn signal_execution(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
    Json(body): Json<SignalRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state
        .engine
        .signal(&id, &body.name, body.payload, body.user_id.as_deref())
        .await?;
    Ok(Json(serde_json::json!({ "delivered": body.name })))
}
