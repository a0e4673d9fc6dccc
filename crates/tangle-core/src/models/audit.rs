use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActorKind {
    Agent,
    User,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Actor {
    pub kind: ActorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Actor {
    pub fn system() -> Self {
        Self {
            kind: ActorKind::System,
            id: None,
        }
    }

    pub fn agent(id: impl Into<String>) -> Self {
        Self {
            kind: ActorKind::Agent,
            id: Some(id.into()),
        }
    }

    /// A user actor, or system when no user is known.
    pub fn user_or_system(user_id: Option<&str>) -> Self {
        match user_id {
            Some(id) => Self {
                kind: ActorKind::User,
                id: Some(id.to_string()),
            },
            None => Self::system(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Workflow,
    Execution,
    Step,
    Agent,
    Entanglement,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workflow => "workflow",
            Self::Execution => "execution",
            Self::Step => "step",
            Self::Agent => "agent",
            Self::Entanglement => "entanglement",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "workflow" => Some(Self::Workflow),
            "execution" => Some(Self::Execution),
            "step" => Some(Self::Step),
            "agent" => Some(Self::Agent),
            "entanglement" => Some(Self::Entanglement),
            _ => None,
        }
    }
}

/// Immutable record of one state transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub actor: Actor,
    /// Dotted verb, e.g. `execution.started`, `agent.terminated`
    pub action: String,
    pub target_type: TargetType,
    pub target_id: String,
    #[serde(default)]
    pub metadata: Value,
}

impl AuditEvent {
    pub fn new(
        actor: Actor,
        action: impl Into<String>,
        target_type: TargetType,
        target_id: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            actor,
            action: action.into(),
            target_type,
            target_id: target_id.into(),
            metadata: Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}
