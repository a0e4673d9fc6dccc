use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};

use tangle_core::audit::AuditQuery;
use tangle_core::{AppState, ServerError};

const DEFAULT_LIMIT: usize = 100;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(query_audit))
}

/// GET /api/audit?target_type=execution&target_id=...&action=step.
async fn query_audit(
    State(state): State<AppState>,
    Query(mut query): Query<AuditQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    query.limit = Some(query.limit.unwrap_or(DEFAULT_LIMIT));
    let events = state.audit.query(&query).await?;
    Ok(Json(serde_json::json!({ "events": events })))
}
