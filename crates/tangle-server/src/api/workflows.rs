use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use tangle_core::{AppState, ServerError, Workflow};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_workflows).post(register_workflow))
        .route("/{id}", get(get_workflow))
}

async fn list_workflows(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let workflows: Vec<serde_json::Value> = state
        .engine
        .list_workflows()
        .await
        .iter()
        .map(|w| {
            serde_json::json!({
                "id": w.id,
                "name": w.name,
                "description": w.description,
                "version": w.version,
                "steps": w.total_steps(),
            })
        })
        .collect();

    Ok(Json(serde_json::json!({ "workflows": workflows })))
}

async fn get_workflow(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Result<Json<Workflow>, ServerError> {
    let workflow = state.engine.get_workflow(&id).await?;
    Ok(Json(workflow.as_ref().clone()))
}

/// Either a YAML document or an inline JSON definition.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RegisterBody {
    Yaml { yaml: String },
    Inline(Workflow),
}

#[derive(Debug, Deserialize)]
struct ActorQuery {
    user_id: Option<String>,
}

/// POST /api/workflows - validate and register a definition.
async fn register_workflow(
    State(state): State<AppState>,
    Query(query): Query<ActorQuery>,
    Json(body): Json<RegisterBody>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let workflow = match body {
        RegisterBody::Yaml { yaml } => Workflow::from_yaml(&yaml)?,
        RegisterBody::Inline(workflow) => workflow,
    };
    let name = workflow.name.clone();
    let id = state
        .engine
        .register(workflow, query.user_id.as_deref())
        .await?;

    Ok(Json(serde_json::json!({ "id": id, "name": name })))
}
