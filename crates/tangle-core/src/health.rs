//! Health report assembly.

use chrono::Utc;
use serde_json::Value;

use crate::agents::AgentManager;
use crate::events::{EventNotifier, HealthPayload};
use crate::models::agent::AgentStatus;
use crate::workflow::EngineStats;

pub const STATUS_OK: u8 = 1;
pub const STATUS_ATTENTION: u8 = 2;
pub const STATUS_BLOCKED: u8 = 3;

/// Build the health payload. `system_resources` is supplied by the host
/// process (the core does not sample the machine).
pub async fn health_report(
    service_name: &str,
    stats: EngineStats,
    agents: &AgentManager,
    notifier: &EventNotifier,
    system_resources: Value,
) -> HealthPayload {
    let all_agents = agents.list().await;
    let active_agents = all_agents.iter().filter(|a| a.status.is_active()).count();
    let errored: Vec<&str> = all_agents
        .iter()
        .filter(|a| a.status == AgentStatus::Error)
        .map(|a| a.name.as_str())
        .collect();
    let dropped = notifier.stats().dropped_total;

    let mut reasons = Vec::new();
    if !errored.is_empty() {
        reasons.push(format!("agents in error: {}", errored.join(", ")));
    }
    if dropped > 0 {
        reasons.push(format!("{} event(s) dropped by slow subscribers", dropped));
    }

    let blocked = !stats.blockers.is_empty();
    let status_id = if blocked {
        STATUS_BLOCKED
    } else if !reasons.is_empty() {
        STATUS_ATTENTION
    } else {
        STATUS_OK
    };
    let workflow_state = if blocked {
        "blocked"
    } else if stats.active > 0 {
        "running"
    } else {
        "idle"
    };

    HealthPayload {
        agent_name: service_name.to_string(),
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
        status_id,
        workflow_state: workflow_state.to_string(),
        active_workflows: stats.active,
        workflow_blockers: stats.blockers,
        requires_attention: !reasons.is_empty(),
        attention_reason: (!reasons.is_empty()).then(|| reasons.join("; ")),
        active_agents,
        system_resources,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditRecorder;
    use crate::config::CoreConfig;
    use crate::events::WorkflowBlocker;

    #[tokio::test]
    async fn test_status_ladder() {
        let config = CoreConfig::default();
        let notifier = EventNotifier::new(4);
        let agents = AgentManager::new(&config, notifier.clone(), AuditRecorder::in_memory(), None);

        let idle = health_report("tangle", EngineStats::default(), &agents, &notifier, Value::Null).await;
        assert_eq!(idle.status_id, STATUS_OK);
        assert_eq!(idle.workflow_state, "idle");
        assert!(!idle.requires_attention);

        let stats = EngineStats {
            active: 1,
            paused: 1,
            blockers: vec![WorkflowBlocker {
                execution_id: "e1".into(),
                workflow_name: "w".into(),
                step_id: None,
                reason: "paused".into(),
            }],
        };
        let blocked = health_report("tangle", stats, &agents, &notifier, Value::Null).await;
        assert_eq!(blocked.status_id, STATUS_BLOCKED);
        assert_eq!(blocked.workflow_state, "blocked");
        assert_eq!(blocked.active_workflows, 1);
    }
}
