//! Error types for the Tangle core.
//!
//! `CoreError` carries the orchestration failure taxonomy and is what every
//! engine, executor, agent and entanglement operation returns.
//! `ServerError` is the transport-facing shape; when the `axum` feature is
//! enabled it implements `IntoResponse` so it can be used directly as an
//! axum handler error type.

/// Domain errors raised by the orchestration core.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    /// Malformed workflow or step graph. Rejected before execution, never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A `{{path}}` reference could not be resolved and had no default.
    #[error("Interpolation error: unresolved reference '{path}'")]
    Interpolation { path: String },

    /// The step's underlying action failed.
    #[error("Step execution error: {0}")]
    StepExecution(String),

    /// A step failed for a deterministic reason; retrying cannot help.
    #[error("Step execution error: {0}")]
    StepFatal(String),

    #[error("Agent spawn error: {0}")]
    AgentSpawn(String),

    #[error("Agent unavailable: {0}")]
    AgentUnavailable(String),

    #[error("Agent timed out after {timeout_secs}s: {agent_id}")]
    AgentTimeout { agent_id: String, timeout_secs: u64 },

    /// Unresolved concurrent write on an entanglement's shared state.
    #[error("Entanglement conflict on {entanglement_id}: {}", keys.join(", "))]
    EntanglementConflict {
        entanglement_id: String,
        keys: Vec<String>,
    },

    /// Step or execution wall-clock exceeded.
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Audit write failed. Fatal to the triggering operation.
    #[error("Audit error: {0}")]
    Audit(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Whether the step retry loop may re-enter `running` after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::StepExecution(_)
                | CoreError::AgentSpawn(_)
                | CoreError::AgentUnavailable(_)
                | CoreError::AgentTimeout { .. }
                | CoreError::EntanglementConflict { .. }
                | CoreError::Timeout(_)
        )
    }

    /// Stable snake_case identifier stored on step results and event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation_error",
            CoreError::Interpolation { .. } => "interpolation_error",
            CoreError::StepExecution(_) | CoreError::StepFatal(_) => "step_execution_error",
            CoreError::AgentSpawn(_) => "agent_spawn_error",
            CoreError::AgentUnavailable(_) => "agent_unavailable_error",
            CoreError::AgentTimeout { .. } => "agent_timeout_error",
            CoreError::EntanglementConflict { .. } => "entanglement_conflict",
            CoreError::Timeout(_) => "timeout_error",
            CoreError::Cancelled(_) => "cancelled",
            CoreError::Audit(_) => "audit_error",
            CoreError::NotFound(_) => "not_found",
            CoreError::Database(_) => "database_error",
            CoreError::Internal(_) => "internal_error",
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        CoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Internal(format!("JSON error: {}", e))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Transport-facing error returned by API adapters.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<CoreError> for ServerError {
    fn from(e: CoreError) -> Self {
        let message = e.to_string();
        match e {
            CoreError::Validation(_) | CoreError::Interpolation { .. } => {
                ServerError::BadRequest(message)
            }
            CoreError::NotFound(_) => ServerError::NotFound(message),
            CoreError::AgentSpawn(_)
            | CoreError::AgentUnavailable(_)
            | CoreError::EntanglementConflict { .. } => ServerError::Conflict(message),
            CoreError::AgentTimeout { .. } | CoreError::Timeout(_) => ServerError::Timeout(message),
            CoreError::Database(_) => ServerError::Database(message),
            _ => ServerError::Internal(message),
        }
    }
}

// ---------------------------------------------------------------------------
// axum integration (opt-in via feature flag)
// ---------------------------------------------------------------------------

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for ServerError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let (status, message) = match &self {
            ServerError::Database(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            ServerError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ServerError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ServerError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            ServerError::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, msg.clone()),
            ServerError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CoreError::StepExecution("boom".into()).is_retryable());
        assert!(CoreError::Timeout("step".into()).is_retryable());
        assert!(!CoreError::Validation("cycle".into()).is_retryable());
        assert!(!CoreError::Interpolation { path: "a.b".into() }.is_retryable());
        assert!(!CoreError::StepFatal("guard".into()).is_retryable());
    }

    #[test]
    fn test_conflict_maps_to_409_shape() {
        let err: ServerError = CoreError::EntanglementConflict {
            entanglement_id: "e1".into(),
            keys: vec!["plan.owner".into()],
        }
        .into();
        assert!(matches!(err, ServerError::Conflict(_)));
        assert!(err.to_string().contains("plan.owner"));
    }
}
