//! Audit trail of every state transition.
//!
//! `AuditRecorder::record` is fail-closed: it returns only after the sink has
//! durably accepted the event, and any sink error surfaces as
//! `CoreError::Audit`, which callers treat as fatal to the operation that
//! produced the event.

pub mod jsonl;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{CoreError, CoreResult};
use crate::models::audit::{AuditEvent, TargetType};

pub use jsonl::JsonlAuditSink;

/// Filter for audit queries. Results are newest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub target_type: Option<TargetType>,
    #[serde(default)]
    pub target_id: Option<String>,
    /// Exact action, or a prefix ending in `.` (e.g. `agent.`)
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(tt) = self.target_type {
            if event.target_type != tt {
                return false;
            }
        }
        if let Some(ref id) = self.target_id {
            if &event.target_id != id {
                return false;
            }
        }
        if let Some(ref action) = self.action {
            let hit = if action.ends_with('.') {
                event.action.starts_with(action.as_str())
            } else {
                &event.action == action
            };
            if !hit {
                return false;
            }
        }
        true
    }
}

/// Durable append-only storage for audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Must not return before the event is durable.
    async fn append(&self, event: &AuditEvent) -> CoreResult<()>;

    async fn query(&self, query: &AuditQuery) -> CoreResult<Vec<AuditEvent>>;
}

#[derive(Clone)]
pub struct AuditRecorder {
    sink: Arc<dyn AuditSink>,
}

impl AuditRecorder {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryAuditSink::new()))
    }

    pub async fn record(&self, event: AuditEvent) -> CoreResult<()> {
        match self.sink.append(&event).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(
                    "[Audit] Failed to record {} on {} {}: {}",
                    event.action,
                    event.target_type.as_str(),
                    event.target_id,
                    e
                );
                Err(match e {
                    CoreError::Audit(_) => e,
                    other => CoreError::Audit(other.to_string()),
                })
            }
        }
    }

    pub async fn query(&self, query: &AuditQuery) -> CoreResult<Vec<AuditEvent>> {
        self.sink.query(query).await
    }
}

/// In-process sink. `set_failing(true)` makes every append fail.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: RwLock<Vec<AuditEvent>>,
    failing: AtomicBool,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, event: &AuditEvent) -> CoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CoreError::Audit("audit sink unavailable".to_string()));
        }
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> CoreResult<Vec<AuditEvent>> {
        let events = self.events.read().await;
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(events
            .iter()
            .rev()
            .filter(|e| query.matches(e))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::audit::Actor;

    #[tokio::test]
    async fn test_record_and_query_newest_first() {
        let recorder = AuditRecorder::in_memory();
        for action in ["agent.spawned", "agent.terminated", "execution.started"] {
            recorder
                .record(AuditEvent::new(Actor::system(), action, TargetType::Agent, "a1"))
                .await
                .unwrap();
        }
        let agent_events = recorder
            .query(&AuditQuery {
                action: Some("agent.".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(agent_events.len(), 2);
        assert_eq!(agent_events[0].action, "agent.terminated");

        let limited = recorder
            .query(&AuditQuery {
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited[0].action, "execution.started");
    }

    #[tokio::test]
    async fn test_failing_sink_surfaces_audit_error() {
        let sink = Arc::new(MemoryAuditSink::new());
        sink.set_failing(true);
        let recorder = AuditRecorder::new(sink.clone());
        let err = recorder
            .record(AuditEvent::new(Actor::system(), "x", TargetType::Workflow, "w"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Audit(_)));
        assert!(sink.events().await.is_empty());
    }
}
