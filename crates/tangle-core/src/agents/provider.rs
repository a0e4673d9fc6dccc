//! Completion providers - the inference backends behind agents.
//!
//! A provider is registered per `agent_type`. The HTTP provider calls the
//! LLM API directly (Anthropic Messages API or any OpenAI-compatible chat
//! completions endpoint); `EchoProvider` answers locally.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::config::resolve_env_vars;
use crate::models::agent::{Agent, AgentReply, AgentTask, UsageInfo};

/// How a provider call failed. `Fatal` moves the agent to `error`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("{0}")]
    Recoverable(String),
    #[error("{0}")]
    Fatal(String),
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Called while the agent is `spawning`. An error leaves it in `error`.
    async fn start(&self, _agent: &Agent) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn complete(&self, agent: &Agent, task: &AgentTask) -> Result<AgentReply, ProviderError>;

    async fn stop(&self, _agent: &Agent) {}
}

/// Render the task into the single user message sent to a model.
pub fn render_prompt(task: &AgentTask) -> String {
    let mut prompt = task.prompt.clone();
    if !task.payload.is_null() {
        prompt.push_str("\n\nInput:\n");
        prompt.push_str(&pretty(&task.payload));
    }
    if !task.context.is_null() {
        prompt.push_str("\n\nShared state:\n");
        prompt.push_str(&pretty(&task.context));
        prompt.push_str(
            "\n\nTo change the shared state, reply with a JSON object containing a `state_patch` field.",
        );
    }
    prompt
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Replies with the rendered prompt. With `{"reply": ...}` in the agent
/// config it returns that value instead, which is handy for dry runs.
pub struct EchoProvider;

#[async_trait]
impl CompletionProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn complete(&self, agent: &Agent, task: &AgentTask) -> Result<AgentReply, ProviderError> {
        let mut reply = match agent.config.get("reply") {
            Some(Value::String(text)) => AgentReply::from_text(text.clone()),
            Some(value) => AgentReply::from_text(value.to_string()),
            None => AgentReply::from_text(render_prompt(task)),
        };
        reply.model = Some("echo".to_string());
        Ok(reply)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFlavor {
    /// POST {base_url}/v1/messages
    Anthropic,
    /// POST {base_url}/chat/completions
    OpenAiCompatible,
}

/// Per-agent settings read from `Agent.config`; `${ENV}` references resolve.
#[derive(Debug, Clone, Default, Deserialize)]
struct ProviderSettings {
    base_url: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    #[serde(default)]
    system_prompt: String,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
}

struct ResolvedSettings {
    base_url: String,
    api_key: String,
    model: String,
    system_prompt: String,
    temperature: Option<f64>,
    max_tokens: u32,
}

pub struct HttpCompletionProvider {
    flavor: ApiFlavor,
    client: reqwest::Client,
}

impl HttpCompletionProvider {
    pub fn new(flavor: ApiFlavor) -> Self {
        Self {
            flavor,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(300))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    pub fn anthropic() -> Self {
        Self::new(ApiFlavor::Anthropic)
    }

    pub fn openai_compatible() -> Self {
        Self::new(ApiFlavor::OpenAiCompatible)
    }

    fn settings(&self, agent: &Agent) -> Result<ResolvedSettings, ProviderError> {
        let raw: ProviderSettings = if agent.config.is_null() {
            ProviderSettings::default()
        } else {
            serde_json::from_value(agent.config.clone())
                .map_err(|e| ProviderError::Fatal(format!("invalid agent config: {}", e)))?
        };
        let (default_url, key_var, default_model) = match self.flavor {
            ApiFlavor::Anthropic => (
                "https://api.anthropic.com",
                "ANTHROPIC_API_KEY",
                "claude-sonnet-4-20250514",
            ),
            ApiFlavor::OpenAiCompatible => ("https://api.openai.com/v1", "OPENAI_API_KEY", "gpt-4o"),
        };

        let api_key = match raw.api_key {
            Some(key) => resolve_env_vars(&key),
            None => std::env::var(key_var).unwrap_or_default(),
        };
        if api_key.is_empty() || api_key.starts_with("${") {
            return Err(ProviderError::Fatal(format!(
                "no API key configured (set api_key or {})",
                key_var
            )));
        }

        Ok(ResolvedSettings {
            base_url: resolve_env_vars(raw.base_url.as_deref().unwrap_or(default_url)),
            api_key,
            model: resolve_env_vars(raw.model.as_deref().unwrap_or(default_model)),
            system_prompt: resolve_env_vars(&raw.system_prompt),
            temperature: raw.temperature,
            max_tokens: raw.max_tokens.unwrap_or(8192),
        })
    }

    async fn post(&self, request: reqwest::RequestBuilder) -> Result<Value, ProviderError> {
        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Recoverable(format!("HTTP request failed: {}", e)))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::Recoverable(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            let message = format!("API returned {}: {}", status, text);
            // Auth and malformed-request failures will not fix themselves.
            return Err(match status.as_u16() {
                400 | 401 | 403 | 404 => ProviderError::Fatal(message),
                _ => ProviderError::Recoverable(message),
            });
        }

        serde_json::from_str(&text)
            .map_err(|e| ProviderError::Recoverable(format!("Failed to parse response JSON: {}", e)))
    }

    async fn call_anthropic(&self, s: &ResolvedSettings, prompt: &str) -> Result<AgentReply, ProviderError> {
        let url = format!("{}/v1/messages", s.base_url.trim_end_matches('/'));
        let mut body = serde_json::json!({
            "model": s.model,
            "max_tokens": s.max_tokens,
            "messages": [{ "role": "user", "content": prompt }]
        });
        if !s.system_prompt.is_empty() {
            body["system"] = Value::String(s.system_prompt.clone());
        }
        if let Some(temp) = s.temperature {
            body["temperature"] = Value::from(temp);
        }

        tracing::info!("[AgentManager] Calling Anthropic API: {} (model: {})", url, s.model);
        let json = self
            .post(
                self.client
                    .post(&url)
                    .header("x-api-key", &s.api_key)
                    .header("anthropic-version", "2023-06-01")
                    .json(&body),
            )
            .await?;

        let content = json
            .get("content")
            .and_then(|c| c.as_array())
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();
        let usage = json.get("usage").map(|u| UsageInfo {
            input_tokens: u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            output_tokens: u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        });
        Ok(finish_reply(content, &json, &s.model, usage))
    }

    async fn call_openai(&self, s: &ResolvedSettings, prompt: &str) -> Result<AgentReply, ProviderError> {
        let url = format!("{}/chat/completions", s.base_url.trim_end_matches('/'));
        let mut messages = Vec::new();
        if !s.system_prompt.is_empty() {
            messages.push(serde_json::json!({ "role": "system", "content": s.system_prompt }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": prompt }));
        let mut body = serde_json::json!({ "model": s.model, "messages": messages });
        if let Some(temp) = s.temperature {
            body["temperature"] = Value::from(temp);
        }

        tracing::info!("[AgentManager] Calling chat completions API: {} (model: {})", url, s.model);
        let json = self
            .post(
                self.client
                    .post(&url)
                    .header("Authorization", format!("Bearer {}", s.api_key))
                    .json(&body),
            )
            .await?;

        let content = json
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_string();
        let usage = json.get("usage").map(|u| UsageInfo {
            input_tokens: u
                .get("prompt_tokens")
                .or_else(|| u.get("input_tokens"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            output_tokens: u
                .get("completion_tokens")
                .or_else(|| u.get("output_tokens"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
        });
        Ok(finish_reply(content, &json, &s.model, usage))
    }
}

fn finish_reply(content: String, json: &Value, fallback_model: &str, usage: Option<UsageInfo>) -> AgentReply {
    let mut reply = AgentReply::from_text(content);
    reply.model = Some(
        json.get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(fallback_model)
            .to_string(),
    );
    reply.usage = usage;
    reply
}

#[async_trait]
impl CompletionProvider for HttpCompletionProvider {
    fn name(&self) -> &str {
        match self.flavor {
            ApiFlavor::Anthropic => "anthropic",
            ApiFlavor::OpenAiCompatible => "openai",
        }
    }

    async fn start(&self, agent: &Agent) -> Result<(), ProviderError> {
        self.settings(agent).map(|_| ())
    }

    async fn complete(&self, agent: &Agent, task: &AgentTask) -> Result<AgentReply, ProviderError> {
        let settings = self.settings(agent)?;
        let prompt = render_prompt(task);
        match self.flavor {
            ApiFlavor::Anthropic => self.call_anthropic(&settings, &prompt).await,
            ApiFlavor::OpenAiCompatible => self.call_openai(&settings, &prompt).await,
        }
    }
}
