use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, CoreResult};
use crate::workflow::schema::Workflow;

/// Execution variables: caller input plus `<step_id>: {output}` entries.
pub type Variables = Map<String, Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    /// Allowed moves. `failed → running` is a retry; bounding it by the
    /// attempt budget is the executor's job.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Running)
                | (Failed, Cancelled)
        )
    }
}

/// Per-execution result of one step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub step_id: String,
    /// Key of the enclosing loop or parallel step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    /// Why the step never ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepResult {
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            parent: None,
            status: StepStatus::Pending,
            output: None,
            error: None,
            error_kind: None,
            skip_reason: None,
            attempts: 0,
            started_at: None,
            finished_at: None,
        }
    }

    fn transition(&mut self, next: StepStatus) -> CoreResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::Internal(format!(
                "step '{}' cannot move from {} to {}",
                self.step_id,
                self.status.as_str(),
                next.as_str()
            )));
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Enter `running` for attempt number `attempt`.
    pub fn begin_attempt(&mut self, attempt: u32) -> CoreResult<()> {
        self.transition(StepStatus::Running)?;
        self.attempts = attempt;
        self.finished_at = None;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn complete(&mut self, output: Value) -> CoreResult<()> {
        self.transition(StepStatus::Completed)?;
        self.output = Some(output);
        self.error = None;
        self.error_kind = None;
        Ok(())
    }

    pub fn fail(&mut self, error: &CoreError) -> CoreResult<()> {
        self.transition(StepStatus::Failed)?;
        self.error = Some(error.to_string());
        self.error_kind = Some(error.kind().to_string());
        Ok(())
    }

    pub fn skip(&mut self, reason: &str) -> CoreResult<()> {
        self.transition(StepStatus::Skipped)?;
        self.error_kind = None;
        self.output = None;
        self.skip_reason = Some(reason.to_string());
        Ok(())
    }

    /// Cancel, keeping any earlier error. `reason` is only stored when none exists.
    pub fn cancel(&mut self, reason: &str) -> CoreResult<()> {
        self.transition(StepStatus::Cancelled)?;
        if self.error.is_none() && !reason.is_empty() {
            self.error = Some(reason.to_string());
            self.error_kind = Some("cancelled".to_string());
        }
        Ok(())
    }

    pub fn has_error(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.is_empty())
    }
}

/// One run of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub status: ExecutionStatus,
    pub variables: Variables,
    pub step_results: BTreeMap<String, StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub total_steps: usize,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn new(workflow: &Workflow, input: Variables, user_id: Option<String>) -> Self {
        let step_results = workflow
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepResult::pending(&s.id)))
            .collect();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow.id.clone(),
            workflow_name: workflow.name.clone(),
            user_id,
            status: ExecutionStatus::Pending,
            variables: input,
            step_results,
            error: None,
            total_steps: workflow.total_steps(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Bind a completed step's output as `<key>.output`. Existing keys are
    /// never overwritten.
    pub fn bind_output(&mut self, key: &str, output: Value) {
        if !bind_output(&mut self.variables, key, output) {
            tracing::warn!(
                "[Engine] Execution {}: variable '{}' already bound, keeping first value",
                self.id,
                key
            );
        }
    }

    /// Completed top-level steps.
    pub fn steps_completed(&self) -> usize {
        self.step_results
            .values()
            .filter(|r| r.parent.is_none() && r.status == StepStatus::Completed)
            .count()
    }

    pub fn duration_ms(&self) -> Option<u64> {
        let started = self.started_at?;
        let finished = self.finished_at.unwrap_or_else(Utc::now);
        Some((finished - started).num_milliseconds().max(0) as u64)
    }

    /// First recorded step error, top-level first.
    pub fn first_step_error(&self) -> Option<(String, String)> {
        let mut nested = None;
        for (key, result) in &self.step_results {
            if result.status == StepStatus::Failed || result.has_error() {
                if let Some(err) = result.error.clone() {
                    if result.parent.is_none() {
                        return Some((key.clone(), err));
                    }
                    nested.get_or_insert((key.clone(), err));
                }
            }
        }
        nested
    }
}

/// Insert `{"output": value}` under `key` unless the key is taken.
pub fn bind_output(variables: &mut Variables, key: &str, output: Value) -> bool {
    if variables.contains_key(key) {
        return false;
    }
    let mut wrapper = Map::new();
    wrapper.insert("output".to_string(), output);
    variables.insert(key.to_string(), Value::Object(wrapper));
    true
}
