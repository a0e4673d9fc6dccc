use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationMode {
    #[serde(alias = "last-writer-wins")]
    LastWriterWins,
    Merge,
}

impl CoordinationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LastWriterWins => "last_writer_wins",
            Self::Merge => "merge",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "last_writer_wins" | "last-writer-wins" => Some(Self::LastWriterWins),
            "merge" => Some(Self::Merge),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entanglement {
    pub id: String,
    pub name: String,
    pub participants: BTreeSet<String>,
    /// Always a JSON object
    pub shared_state: Value,
    pub mode: CoordinationMode,
    /// Bumped on every committed update
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entanglement {
    pub fn new(name: String, participants: BTreeSet<String>, mode: CoordinationMode) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            participants,
            shared_state: Value::Object(Default::default()),
            mode,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}
