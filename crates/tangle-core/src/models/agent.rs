use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Spawning,
    Idle,
    Working,
    Error,
    Terminated,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Error => "error",
            Self::Terminated => "terminated",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "spawning" => Some(Self::Spawning),
            "idle" => Some(Self::Idle),
            "working" => Some(Self::Working),
            "error" => Some(Self::Error),
            "terminated" => Some(Self::Terminated),
            _ => None,
        }
    }

    /// `spawning → idle ⇄ working → terminated`; `error` only from
    /// `spawning` or `working`, and left only by termination.
    pub fn can_transition_to(&self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (self, next),
            (Spawning, Idle)
                | (Spawning, Error)
                | (Spawning, Terminated)
                | (Idle, Working)
                | (Idle, Terminated)
                | (Working, Idle)
                | (Working, Error)
                | (Working, Terminated)
                | (Error, Terminated)
        )
    }

    pub fn is_active(&self) -> bool {
        *self != Self::Terminated
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub agent_type: String,
    pub status: AgentStatus,
    /// Owning execution, for agents spawned by a step
    #[serde(default)]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    /// Kinds of tasks the agent accepts
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(request: &SpawnRequest) -> Self {
        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();
        let name = request
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", request.agent_type, &id[..8]));
        Self {
            id,
            name,
            agent_type: request.agent_type.clone(),
            status: AgentStatus::Spawning,
            execution_id: request.execution_id.clone(),
            user_id: request.user_id.clone(),
            capabilities: request.capabilities.clone(),
            config: request.config.clone(),
            current_step: None,
            last_error: None,
            termination_reason: None,
            created_at: now,
            updated_at: now,
            last_active_at: now,
        }
    }

    /// Apply a status change if the state machine allows it.
    pub fn transition(&mut self, next: AgentStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        let now = Utc::now();
        self.updated_at = now;
        if matches!(next, AgentStatus::Idle | AgentStatus::Working) {
            self.last_active_at = now;
        }
        true
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_active_at).to_std().unwrap_or_default()
    }

    /// The spawn request that would recreate this agent.
    pub fn respawn_request(&self) -> SpawnRequest {
        SpawnRequest {
            agent_type: self.agent_type.clone(),
            name: Some(self.name.clone()),
            config: self.config.clone(),
            capabilities: self.capabilities.clone(),
            execution_id: self.execution_id.clone(),
            user_id: self.user_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub agent_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl SpawnRequest {
    pub fn new(agent_type: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            ..Default::default()
        }
    }
}

/// Work handed to an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentTask {
    pub prompt: String,
    #[serde(default)]
    pub payload: Value,
    /// Shared state when the task runs inside an entanglement
    #[serde(default)]
    pub context: Value,
    #[serde(default)]
    pub step_id: Option<String>,
    #[serde(default)]
    pub execution_id: Option<String>,
    /// Overrides the configured agent timeout when shorter
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl AgentTask {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UsageInfo {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentReply {
    pub content: String,
    /// Parsed JSON content when the reply is JSON, else the text
    pub output: Value,
    /// Patch to apply to the task's entanglement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_patch: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageInfo>,
}

impl AgentReply {
    /// Build from raw text, lifting `state_patch` out of JSON object replies.
    pub fn from_text(content: impl Into<String>) -> Self {
        let content = content.into();
        let mut output = serde_json::from_str::<Value>(content.trim())
            .unwrap_or_else(|_| Value::String(content.clone()));
        let state_patch = output
            .as_object_mut()
            .and_then(|map| map.remove("state_patch"));
        Self {
            content,
            output,
            state_patch,
            model: None,
            usage: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_machine() {
        let mut agent = Agent::new(&SpawnRequest::new("echo"));
        assert_eq!(agent.status, AgentStatus::Spawning);
        assert!(!agent.transition(AgentStatus::Working));
        assert!(agent.transition(AgentStatus::Idle));
        assert!(!agent.transition(AgentStatus::Error));
        assert!(agent.transition(AgentStatus::Working));
        assert!(agent.transition(AgentStatus::Error));
        assert!(!agent.transition(AgentStatus::Idle));
        assert!(agent.transition(AgentStatus::Terminated));
        assert!(!agent.transition(AgentStatus::Idle));
    }

    #[test]
    fn test_reply_lifts_state_patch() {
        let reply = AgentReply::from_text(r#"{"answer": 42, "state_patch": {"plan": "x"}}"#);
        assert_eq!(reply.output, json!({"answer": 42}));
        assert_eq!(reply.state_patch, Some(json!({"plan": "x"})));

        let plain = AgentReply::from_text("hello");
        assert_eq!(plain.output, json!("hello"));
        assert!(plain.state_patch.is_none());
    }
}
