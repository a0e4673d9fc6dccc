//! Core configuration.
//!
//! Loaded from a YAML file (every field optional), with `${ENV_VAR}` and
//! `${ENV_VAR:-default}` references expanded, then overridden by `TANGLE_*`
//! environment variables:
//!
//! ```yaml
//! max_concurrent_workflows: 10
//! max_concurrent_agents: 8
//! agent_timeout_secs: 300
//! workflow_timeout_secs: 3600
//! auto_retry_failed: false
//! max_retry_attempts: 3
//! webhook_urls:
//!   - "${DASHBOARD_WEBHOOK_URL}"
//! ```

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

static ENV_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("env reference pattern is valid"));

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Service name reported in health payloads
    pub service_name: String,
    /// Step-dispatch permits shared by all executions
    pub max_concurrent_workflows: usize,
    /// Upper bound on non-terminated agents
    pub max_concurrent_agents: usize,
    /// Per-invocation agent response timeout
    pub agent_timeout_secs: u64,
    /// Wall-clock ceiling for a whole execution
    pub workflow_timeout_secs: u64,
    /// Retry steps without an explicit retry policy
    pub auto_retry_failed: bool,
    /// Attempts used when `auto_retry_failed` applies
    pub max_retry_attempts: u32,
    /// Idle agents older than this are reaped
    pub agent_session_timeout_secs: u64,
    /// How long in-flight steps get to wind down after cancellation
    pub cancel_grace_period_ms: u64,
    /// Per-subscriber event buffer (oldest dropped on overflow)
    pub event_buffer_size: usize,
    /// Default timeout for api_call steps without their own
    pub default_step_timeout_secs: u64,
    /// Loop guard when a loop step has no `max_iterations`
    pub max_loop_iterations: usize,
    /// Endpoints receiving workflow/agent event payloads
    pub webhook_urls: Vec<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            service_name: "tangle".to_string(),
            max_concurrent_workflows: 10,
            max_concurrent_agents: 8,
            agent_timeout_secs: 300,
            workflow_timeout_secs: 3600,
            auto_retry_failed: false,
            max_retry_attempts: 3,
            agent_session_timeout_secs: 1800,
            cancel_grace_period_ms: 5000,
            event_buffer_size: 256,
            default_step_timeout_secs: 300,
            max_loop_iterations: 1000,
            webhook_urls: Vec::new(),
        }
    }
}

impl CoreConfig {
    /// Parse a config from a YAML string, expanding env references.
    pub fn from_yaml(yaml: &str) -> CoreResult<Self> {
        let expanded = resolve_env_vars(yaml);
        serde_yaml::from_str(&expanded)
            .map_err(|e| CoreError::Validation(format!("Failed to parse config YAML: {}", e)))
    }

    /// Load a config file, then apply `TANGLE_*` overrides.
    pub fn from_file(path: &str) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Validation(format!("Failed to read config '{}': {}", path, e)))?;
        let mut config = Self::from_yaml(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Override fields from `TANGLE_*` environment variables.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        fn parse<T: std::str::FromStr>(key: &str) -> Option<T> {
            let raw = std::env::var(key).ok()?;
            match raw.trim().parse::<T>() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!("[Config] Ignoring invalid value for {}: {}", key, raw);
                    None
                }
            }
        }

        if let Ok(name) = std::env::var("TANGLE_SERVICE_NAME") {
            self.service_name = name;
        }
        if let Some(v) = parse("TANGLE_MAX_CONCURRENT_WORKFLOWS") {
            self.max_concurrent_workflows = v;
        }
        if let Some(v) = parse("TANGLE_MAX_CONCURRENT_AGENTS") {
            self.max_concurrent_agents = v;
        }
        if let Some(v) = parse("TANGLE_AGENT_TIMEOUT_SECS") {
            self.agent_timeout_secs = v;
        }
        if let Some(v) = parse("TANGLE_WORKFLOW_TIMEOUT_SECS") {
            self.workflow_timeout_secs = v;
        }
        if let Some(v) = parse("TANGLE_AUTO_RETRY_FAILED") {
            self.auto_retry_failed = v;
        }
        if let Some(v) = parse("TANGLE_MAX_RETRY_ATTEMPTS") {
            self.max_retry_attempts = v;
        }
        if let Some(v) = parse("TANGLE_AGENT_SESSION_TIMEOUT_SECS") {
            self.agent_session_timeout_secs = v;
        }
        if let Ok(urls) = std::env::var("TANGLE_WEBHOOK_URLS") {
            self.webhook_urls = urls
                .split(',')
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty())
                .collect();
        }
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn workflow_timeout(&self) -> Duration {
        Duration::from_secs(self.workflow_timeout_secs)
    }

    pub fn agent_session_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_session_timeout_secs)
    }

    pub fn cancel_grace_period(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_period_ms)
    }

    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_secs(self.default_step_timeout_secs)
    }
}

/// Resolve environment variable references in a string.
/// Supports `${ENV_VAR}` and `${ENV_VAR:-default}` syntax; unknown
/// variables without a default are left untouched.
pub fn resolve_env_vars(input: &str) -> String {
    ENV_REF
        .replace_all(input, |caps: &regex::Captures| {
            let var_expr = &caps[1];
            if let Some(idx) = var_expr.find(":-") {
                let var_name = &var_expr[..idx];
                let default_val = &var_expr[idx + 2..];
                std::env::var(var_name).unwrap_or_else(|_| default_val.to_string())
            } else {
                std::env::var(var_expr).unwrap_or_else(|_| format!("${{{}}}", var_expr))
            }
        })
        .to_string()
}
