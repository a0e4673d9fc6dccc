pub mod agents;
pub mod audit;
pub mod entanglements;
pub mod events;
pub mod executions;
pub mod health;
pub mod workflows;

use axum::Router;

use tangle_core::AppState;

/// Build the complete API router with all sub-routes.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/api/workflows", workflows::router())
        .nest("/api/executions", executions::router())
        .nest("/api/agents", agents::router())
        .nest("/api/entanglements", entanglements::router())
        .nest("/api/events", events::router())
        .nest("/api/audit", audit::router())
        .nest("/api/health", health::router())
}
