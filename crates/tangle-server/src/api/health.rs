use axum::{extract::State, routing::get, Json, Router};
use sysinfo::System;

use tangle_core::events::HealthPayload;
use tangle_core::health::health_report;
use tangle_core::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(get_health))
}

/// Host memory and CPU figures attached to the health payload.
fn system_resources() -> serde_json::Value {
    let mut sys = System::new_all();
    sys.refresh_memory();

    let total_memory = sys.total_memory();
    let used_memory = sys.used_memory();
    let usage_percentage = if total_memory > 0 {
        (used_memory as f64 / total_memory as f64 * 100.0) as u64
    } else {
        0
    };

    serde_json::json!({
        "memory_used_mb": used_memory / 1024 / 1024,
        "memory_total_mb": total_memory / 1024 / 1024,
        "memory_available_mb": sys.available_memory() / 1024 / 1024,
        "memory_usage_percentage": usage_percentage,
        "cpu_count": sys.cpus().len(),
        "load_average": System::load_average().one,
    })
}

/// GET /api/health - status ladder, blockers and host resources.
async fn get_health(State(state): State<AppState>) -> Json<HealthPayload> {
    let stats = state.engine.stats().await;
    let resources = tokio::task::spawn_blocking(system_resources)
        .await
        .unwrap_or(serde_json::Value::Null);

    Json(
        health_report(
            &state.config.service_name,
            stats,
            &state.agents,
            &state.notifier,
            resources,
        )
        .await,
    )
}
