//! Schema types for workflow definitions.
//!
//! A workflow is a DAG of typed steps, loaded from YAML or JSON:
//!
//! ```yaml
//! name: "Triage"
//! description: "Classify an incoming ticket and notify the owner"
//!
//! steps:
//!   - id: classify
//!     type: agent_task
//!     config:
//!       agent_type: echo
//!       prompt: "Classify: {{ticket.title}}"
//!     retry:
//!       max_attempts: 3
//!
//!   - id: urgent
//!     type: condition
//!     depends_on: [classify]
//!     config:
//!       expression: "classify.output.content == 'urgent'"
//!       else_steps: [digest]
//!
//!   - id: page
//!     type: notification
//!     depends_on: [urgent]
//!     config:
//!       channel: pager
//!       message: "Urgent ticket {{ticket.id}}"
//!
//!   - id: digest
//!     type: webhook
//!     depends_on: [urgent]
//!     config:
//!       event: ticket.digest
//!       payload: "{{classify.output}}"
//! ```
//!
//! The per-type `config` block is converted into a typed [`StepKind`] while
//! parsing, so a definition with a malformed config never reaches the engine.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::workflow::transform::TransformFn;

/// Top-level workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Assigned on load when absent
    #[serde(default = "new_workflow_id")]
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default = "default_version")]
    pub version: String,

    pub steps: Vec<StepDef>,
}

fn new_workflow_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Workflow {
    /// Parse a workflow from YAML (JSON is accepted too).
    pub fn from_yaml(yaml: &str) -> CoreResult<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| CoreError::Validation(format!("Failed to parse workflow: {}", e)))
    }

    /// Load a workflow definition file.
    pub fn from_file(path: &str) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Validation(format!("Failed to read workflow file '{}': {}", path, e))
        })?;
        Self::from_yaml(&content)
    }

    /// Top-level step by id.
    pub fn step(&self, id: &str) -> Option<&StepDef> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }
}

/// What happens to the execution when a step exhausts its attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Halt dispatch and fail the execution (default)
    #[default]
    Abort,
    /// Keep running independent steps; the execution still ends `failed`
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Fixed,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(default)]
    pub strategy: BackoffStrategy,
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_initial_ms() -> u64 {
    200
}

fn default_max_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::default(),
            initial_ms: default_initial_ms(),
            max_ms: default_max_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl Backoff {
    /// Delay before the attempt following failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let ms = match self.strategy {
            BackoffStrategy::None => 0,
            BackoffStrategy::Fixed => self.initial_ms,
            BackoffStrategy::Exponential => {
                let exp = attempt.saturating_sub(1).min(32) as i32;
                let raw = self.initial_ms as f64 * self.multiplier.max(1.0).powi(exp);
                raw.min(self.max_ms as f64) as u64
            }
        };
        Duration::from_millis(ms.min(self.max_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::default(),
        }
    }
}

/// Step type tag as written in definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    AgentTask,
    ApiCall,
    Condition,
    Loop,
    Parallel,
    Wait,
    Transform,
    Webhook,
    Notification,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentTask => "agent_task",
            Self::ApiCall => "api_call",
            Self::Condition => "condition",
            Self::Loop => "loop",
            Self::Parallel => "parallel",
            Self::Wait => "wait",
            Self::Transform => "transform",
            Self::Webhook => "webhook",
            Self::Notification => "notification",
        }
    }

    /// Composite steps orchestrate other steps and do not hold a dispatch permit.
    pub fn is_composite(&self) -> bool {
        matches!(self, Self::Loop | Self::Parallel)
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTaskConfig {
    /// Invoke an existing agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Spawn an ephemeral agent of this type for the step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entanglement_id: Option<String>,
    /// Provider config for ephemeral agents (model, base_url, ...)
    #[serde(default)]
    pub agent_config: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCallConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    /// Jinja expression over the execution variables
    pub expression: String,
    /// Dependents that run only when the expression is false
    #[serde(default)]
    pub else_steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Template or literal coerced to the list of items
    pub over: Value,
    #[serde(default = "default_item_var")]
    pub item_var: String,
    pub body: Vec<StepDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<usize>,
    /// Checked after each iteration; true stops the loop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<String>,
}

fn default_item_var() -> String {
    "item".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    FailFast,
    BestEffort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelConfig {
    pub branches: Vec<StepDef>,
    /// Required: there is no default
    pub failure_policy: FailurePolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    /// Only meaningful with `signal` and no `duration_ms`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformConfig {
    #[serde(deserialize_with = "crate::workflow::transform::deserialize_fn")]
    pub function: TransformFn,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Extra target on top of the configured webhook URLs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_channel")]
    pub channel: String,
    pub message: String,
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_channel() -> String {
    "default".to_string()
}

fn default_level() -> String {
    "info".to_string()
}

/// Typed step configuration, one variant per step type.
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    AgentTask(AgentTaskConfig),
    ApiCall(ApiCallConfig),
    Condition(ConditionConfig),
    Loop(LoopConfig),
    Parallel(ParallelConfig),
    Wait(WaitConfig),
    Transform(TransformConfig),
    Webhook(WebhookConfig),
    Notification(NotificationConfig),
}

impl StepKind {
    pub fn step_type(&self) -> StepType {
        match self {
            Self::AgentTask(_) => StepType::AgentTask,
            Self::ApiCall(_) => StepType::ApiCall,
            Self::Condition(_) => StepType::Condition,
            Self::Loop(_) => StepType::Loop,
            Self::Parallel(_) => StepType::Parallel,
            Self::Wait(_) => StepType::Wait,
            Self::Transform(_) => StepType::Transform,
            Self::Webhook(_) => StepType::Webhook,
            Self::Notification(_) => StepType::Notification,
        }
    }

    /// Config as written in a definition.
    pub fn config_value(&self) -> Value {
        let result = match self {
            Self::AgentTask(c) => serde_json::to_value(c),
            Self::ApiCall(c) => serde_json::to_value(c),
            Self::Condition(c) => serde_json::to_value(c),
            Self::Loop(c) => serde_json::to_value(c),
            Self::Parallel(c) => serde_json::to_value(c),
            Self::Wait(c) => serde_json::to_value(c),
            Self::Transform(c) => serde_json::to_value(c),
            Self::Webhook(c) => serde_json::to_value(c),
            Self::Notification(c) => serde_json::to_value(c),
        };
        result.unwrap_or(Value::Null)
    }

    fn from_config(step_type: StepType, config: Value) -> Result<Self, serde_json::Error> {
        Ok(match step_type {
            StepType::AgentTask => Self::AgentTask(serde_json::from_value(config)?),
            StepType::ApiCall => Self::ApiCall(serde_json::from_value(config)?),
            StepType::Condition => Self::Condition(serde_json::from_value(config)?),
            StepType::Loop => Self::Loop(serde_json::from_value(config)?),
            StepType::Parallel => Self::Parallel(serde_json::from_value(config)?),
            StepType::Wait => Self::Wait(serde_json::from_value(config)?),
            StepType::Transform => Self::Transform(serde_json::from_value(config)?),
            StepType::Webhook => Self::Webhook(serde_json::from_value(config)?),
            StepType::Notification => Self::Notification(serde_json::from_value(config)?),
        })
    }
}

/// A single step definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawStep", into = "RawStep")]
pub struct StepDef {
    /// Unique across the whole workflow, nested steps included
    pub id: String,
    pub name: Option<String>,
    pub kind: StepKind,
    pub depends_on: Vec<String>,
    pub retry: Option<RetryPolicy>,
    pub on_failure: OnFailure,
    pub timeout_secs: Option<u64>,
}

impl StepDef {
    pub fn step_type(&self) -> StepType {
        self.kind.step_type()
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Wire shape of a step: `type` plus an untyped `config` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawStep {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(rename = "type")]
    step_type: StepType,
    #[serde(default)]
    config: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retry: Option<RetryPolicy>,
    #[serde(default)]
    on_failure: OnFailure,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_secs: Option<u64>,
}

impl TryFrom<RawStep> for StepDef {
    type Error = String;

    fn try_from(raw: RawStep) -> Result<Self, Self::Error> {
        let config = match raw.config {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        let kind = StepKind::from_config(raw.step_type, config).map_err(|e| {
            format!("step '{}': invalid {} config: {}", raw.id, raw.step_type, e)
        })?;
        Ok(StepDef {
            id: raw.id,
            name: raw.name,
            kind,
            depends_on: raw.depends_on,
            retry: raw.retry,
            on_failure: raw.on_failure,
            timeout_secs: raw.timeout_secs,
        })
    }
}

impl From<StepDef> for RawStep {
    fn from(step: StepDef) -> Self {
        RawStep {
            step_type: step.kind.step_type(),
            config: step.kind.config_value(),
            id: step.id,
            name: step.name,
            depends_on: step.depends_on,
            retry: step.retry,
            on_failure: step.on_failure,
            timeout_secs: step.timeout_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
name: sample
steps:
  - id: fetch
    type: api_call
    config:
      url: "https://example.test/items"
    retry:
      max_attempts: 4
      backoff: { strategy: fixed, initial_ms: 10 }
  - id: fan
    type: parallel
    depends_on: [fetch]
    on_failure: continue
    config:
      failure_policy: best_effort
      branches:
        - id: left
          type: transform
          config: { function: uppercase, input: "{{fetch.output.body}}" }
        - id: right
          type: wait
          config: { duration_ms: 5 }
"#;

    #[test]
    fn test_parse_typed_configs() {
        let wf = Workflow::from_yaml(YAML).unwrap();
        assert_eq!(wf.name, "sample");
        assert_eq!(wf.version, "1.0");
        assert!(!wf.id.is_empty());

        let fetch = wf.step("fetch").unwrap();
        match &fetch.kind {
            StepKind::ApiCall(c) => assert_eq!(c.method, "GET"),
            other => panic!("unexpected kind: {:?}", other),
        }
        let retry = fetch.retry.as_ref().unwrap();
        assert_eq!(retry.max_attempts, 4);
        assert_eq!(retry.backoff.delay(3), Duration::from_millis(10));

        let fan = wf.step("fan").unwrap();
        assert_eq!(fan.on_failure, OnFailure::Continue);
        match &fan.kind {
            StepKind::Parallel(p) => {
                assert_eq!(p.failure_policy, FailurePolicy::BestEffort);
                assert_eq!(p.branches.len(), 2);
                assert_eq!(p.branches[1].step_type(), StepType::Wait);
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn test_parallel_requires_failure_policy() {
        let yaml = r#"
name: bad
steps:
  - id: p
    type: parallel
    config:
      branches: []
"#;
        let err = Workflow::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("failure_policy"), "{}", err);
    }

    #[test]
    fn test_unknown_step_type_rejected() {
        let yaml = "name: bad\nsteps:\n  - id: x\n    type: teleport\n";
        assert!(matches!(Workflow::from_yaml(yaml), Err(CoreError::Validation(_))));
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let backoff = Backoff {
            strategy: BackoffStrategy::Exponential,
            initial_ms: 100,
            max_ms: 1_000,
            multiplier: 2.0,
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_step_serializes_back_to_wire_shape() {
        let wf = Workflow::from_yaml(YAML).unwrap();
        let json = serde_json::to_value(wf.step("fetch").unwrap()).unwrap();
        assert_eq!(json["type"], "api_call");
        assert_eq!(json["config"]["url"], "https://example.test/items");
        let back: StepDef = serde_json::from_value(json).unwrap();
        assert_eq!(&back, wf.step("fetch").unwrap());
    }
}
