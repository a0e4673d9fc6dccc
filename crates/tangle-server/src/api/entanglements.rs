use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use tangle_core::models::{CoordinationMode, Entanglement};
use tangle_core::{AppState, ServerError};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_entanglements).post(create_entanglement))
        .route("/{id}", get(get_entanglement))
        .route("/{id}/state", get(read_state))
        .route("/{id}/update", post(update_state))
        .route("/{id}/join", post(join_entanglement))
        .route("/{id}/leave", post(leave_entanglement))
        .route("/{id}/dissolve", post(dissolve_entanglement))
}

async fn list_entanglements(State(state): State<AppState>) -> Json<serde_json::Value> {
    let entanglements = state.entanglements.list().await;
    Json(serde_json::json!({ "entanglements": entanglements }))
}

#[derive(Debug, Deserialize)]
struct CreateEntanglementRequest {
    name: Option<String>,
    agent_ids: Vec<String>,
    mode: Option<CoordinationMode>,
}

async fn create_entanglement(
    State(state): State<AppState>,
    Json(body): Json<CreateEntanglementRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let mode = body.mode.unwrap_or(CoordinationMode::LastWriterWins);
    let id = state
        .entanglements
        .create(body.name, &body.agent_ids, mode)
        .await?;
    Ok(Json(serde_json::json!({ "entanglement_id": id })))
}

async fn get_entanglement(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Result<Json<Entanglement>, ServerError> {
    Ok(Json(state.entanglements.get(&id).await?))
}

#[derive(Debug, Deserialize)]
struct ReadStateQuery {
    agent_id: Option<String>,
}

/// GET /api/entanglements/{id}/state - shared state snapshot. Reading as a
/// participant marks the current version as seen by that agent.
async fn read_state(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
    Query(query): Query<ReadStateQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let shared = match query.agent_id {
        Some(ref agent_id) => state.entanglements.read_as(&id, agent_id).await?,
        None => state.entanglements.read(&id).await?,
    };
    Ok(Json(serde_json::json!({ "shared_state": shared })))
}

#[derive(Debug, Deserialize)]
struct UpdateRequest {
    agent_id: String,
    patch: serde_json::Value,
}

async fn update_state(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
    Json(body): Json<UpdateRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let shared = state
        .entanglements
        .update(&id, &body.agent_id, body.patch)
        .await?;
    Ok(Json(serde_json::json!({ "shared_state": shared })))
}

#[derive(Debug, Deserialize)]
struct MembershipRequest {
    agent_id: String,
}

async fn join_entanglement(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
    Json(body): Json<MembershipRequest>,
) -> Result<Json<Entanglement>, ServerError> {
    state.entanglements.join(&id, &body.agent_id).await?;
    Ok(Json(state.entanglements.get(&id).await?))
}

async fn leave_entanglement(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
    Json(body): Json<MembershipRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state.entanglements.leave(&id, &body.agent_id).await?;
    Ok(Json(serde_json::json!({ "left": body.agent_id })))
}

async fn dissolve_entanglement(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state.entanglements.dissolve(&id).await?;
    Ok(Json(serde_json::json!({ "dissolved": true })))
}
