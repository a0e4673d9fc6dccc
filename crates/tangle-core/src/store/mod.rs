pub mod agent_store;
pub mod audit_store;
pub mod entanglement_store;
pub mod execution_store;
pub mod workflow_store;

pub use agent_store::AgentStore;
pub use audit_store::AuditStore;
pub use entanglement_store::EntanglementStore;
pub use execution_store::ExecutionStore;
pub use workflow_store::WorkflowStore;

use chrono::{DateTime, Utc};

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}
