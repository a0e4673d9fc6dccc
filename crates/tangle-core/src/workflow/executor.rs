//! StepExecutor - runs one step definition to a terminal [`StepResult`].
//!
//! The executor:
//! 1. Drives the retry loop (`pending → running → failed → running …`)
//! 2. Renders `{{path}}` templates against the variables visible to the step
//! 3. Dispatches by step type (agent, HTTP, condition, loop, parallel, wait,
//!    transform, webhook, notification)
//! 4. Reports every transition to a [`StepObserver`] before committing it
//!
//! Loop bodies and parallel branches are run through the graph driver in
//! [`crate::workflow::engine::graph`], so nesting works at any depth.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::agents::AgentManager;
use crate::config::CoreConfig;
use crate::entanglement::EntanglementCoordinator;
use crate::error::{CoreError, CoreResult};
use crate::events::{Event, EventNotifier, NotificationEventPayload, WebhookEventPayload};
use crate::models::agent::{AgentReply, AgentTask, SpawnRequest};
use crate::models::execution::{StepResult, StepStatus, Variables};
use crate::workflow::cancel::CancelSignal;
use crate::workflow::engine::graph::{drive_graph, FailureMode, Halt};
use crate::workflow::expression;
use crate::workflow::http::{HttpClient, HttpRequest};
use crate::workflow::schema::{
    AgentTaskConfig, ApiCallConfig, FailurePolicy, LoopConfig, NotificationConfig,
    ParallelConfig, RetryPolicy, StepDef, StepKind, WaitConfig, WebhookConfig,
};
use crate::workflow::signals::SignalHub;
use crate::workflow::template::{render_string, render_value};
use crate::workflow::validate::{ERRORS_KEY, LOOP_VAR};

/// Receives step transitions. An error (typically a failed audit write)
/// means the transition must not be committed.
#[async_trait]
pub trait StepObserver: Send + Sync {
    async fn step_updated(&self, key: &str, step: &StepDef, result: &StepResult) -> CoreResult<()>;

    /// A failed attempt that will be retried after `delay`.
    async fn step_retrying(
        &self,
        key: &str,
        step: &StepDef,
        result: &StepResult,
        delay: Duration,
    ) -> CoreResult<()>;

    /// A top-level output was bound into the execution variables.
    async fn output_bound(&self, name: &str, output: &Value) -> CoreResult<()>;
}

pub struct NoopObserver;

#[async_trait]
impl StepObserver for NoopObserver {
    async fn step_updated(&self, _: &str, _: &StepDef, _: &StepResult) -> CoreResult<()> {
        Ok(())
    }

    async fn step_retrying(&self, _: &str, _: &StepDef, _: &StepResult, _: Duration) -> CoreResult<()> {
        Ok(())
    }

    async fn output_bound(&self, _: &str, _: &Value) -> CoreResult<()> {
        Ok(())
    }
}

/// Everything a step needs from the execution that runs it.
#[derive(Clone)]
pub struct StepContext {
    pub execution_id: String,
    pub workflow_id: String,
    pub user_id: Option<String>,
    /// Prefix for result keys: empty at top level, `each[2]/` in loop bodies
    pub scope: String,
    /// Key of the enclosing loop or parallel step
    pub parent: Option<String>,
    pub variables: Variables,
    /// Soft stop: halts dispatch and interrupts waits and backoff
    pub cancel: CancelSignal,
    /// Hard stop: abandons the running attempt
    pub force: CancelSignal,
    pub pause: watch::Receiver<bool>,
    pub signals: SignalHub,
    pub observer: Arc<dyn StepObserver>,
    /// Execution wall-clock ceiling
    pub deadline: Option<Instant>,
}

impl StepContext {
    /// Standalone context with no pause control and a no-op observer.
    pub fn new(execution_id: impl Into<String>, workflow_id: impl Into<String>, variables: Variables) -> Self {
        let (_tx, pause) = watch::channel(false);
        Self {
            execution_id: execution_id.into(),
            workflow_id: workflow_id.into(),
            user_id: None,
            scope: String::new(),
            parent: None,
            variables,
            cancel: CancelSignal::new(),
            force: CancelSignal::new(),
            pause,
            signals: SignalHub::new(),
            observer: Arc::new(NoopObserver),
            deadline: None,
        }
    }

    pub fn key(&self, step_id: &str) -> String {
        format!("{}{}", self.scope, step_id)
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Error for an interrupted step: a timeout once the deadline has
    /// passed, otherwise a cancellation.
    pub fn interruption(&self) -> CoreError {
        if self.deadline_passed() {
            CoreError::Timeout("workflow deadline exceeded".to_string())
        } else {
            CoreError::Cancelled("execution cancelled".to_string())
        }
    }

    fn nested(&self, scope: String, parent: &str, variables: Variables) -> Self {
        Self {
            scope,
            parent: Some(parent.to_string()),
            variables,
            ..self.clone()
        }
    }
}

struct ExecutorInner {
    agents: AgentManager,
    entanglements: EntanglementCoordinator,
    notifier: EventNotifier,
    http: Arc<dyn HttpClient>,
    permits: Arc<Semaphore>,
    config: CoreConfig,
}

#[derive(Clone)]
pub struct StepExecutor {
    inner: Arc<ExecutorInner>,
}

impl StepExecutor {
    pub fn new(
        config: &CoreConfig,
        agents: AgentManager,
        entanglements: EntanglementCoordinator,
        notifier: EventNotifier,
        http: Arc<dyn HttpClient>,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                agents,
                entanglements,
                notifier,
                http,
                permits: Arc::new(Semaphore::new(config.max_concurrent_workflows.max(1))),
                config: config.clone(),
            }),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.inner.config
    }

    /// Dispatch permits not currently held by a running step.
    pub fn available_permits(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Run `step` through its retry policy and return the terminal result.
    pub fn execute<'a>(&'a self, step: &'a StepDef, ctx: StepContext) -> BoxFuture<'a, StepResult> {
        Box::pin(self.run(step, ctx))
    }

    fn retry_policy(&self, step: &StepDef) -> RetryPolicy {
        match &step.retry {
            Some(policy) => policy.clone(),
            None if self.inner.config.auto_retry_failed => RetryPolicy {
                max_attempts: self.inner.config.max_retry_attempts.max(1),
                ..RetryPolicy::once()
            },
            None => RetryPolicy::once(),
        }
    }

    async fn run(&self, step: &StepDef, ctx: StepContext) -> StepResult {
        let key = ctx.key(&step.id);
        let policy = self.retry_policy(step);
        let mut result = StepResult::pending(&key);
        result.parent = ctx.parent.clone();
        if ctx.cancel.is_cancelled() {
            let reason = ctx.interruption().to_string();
            if result.cancel(&reason).is_ok() {
                if let Err(e) = ctx.observer.step_updated(&key, step, &result).await {
                    tracing::error!("[StepExecutor] Cancellation of '{}' not recorded: {}", key, e);
                }
            }
            return result;
        }
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut next = result.clone();
            if let Err(e) = next.begin_attempt(attempt) {
                return self.abandon(result, e, step, &ctx, &key).await;
            }
            if let Err(e) = ctx.observer.step_updated(&key, step, &next).await {
                // Could not record the start; fail the attempt we were about to make.
                result = next;
                return self.abandon(result, e, step, &ctx, &key).await;
            }
            result = next;
            tracing::debug!(
                "[StepExecutor] {} '{}' attempt {}/{}",
                step.step_type(),
                key,
                attempt,
                policy.max_attempts
            );

            let outcome = tokio::select! {
                biased;
                _ = ctx.force.cancelled() => Err(ctx.interruption()),
                r = self.attempt(step, &ctx, &key) => r,
            };

            let error = match outcome {
                Ok(output) => {
                    let mut next = result.clone();
                    if let Err(e) = next.complete(output) {
                        return self.abandon(result, e, step, &ctx, &key).await;
                    }
                    return match ctx.observer.step_updated(&key, step, &next).await {
                        Ok(()) => next,
                        Err(e) => self.abandon(result, e, step, &ctx, &key).await,
                    };
                }
                Err(e) => e,
            };

            if let CoreError::Cancelled(reason) = &error {
                let mut next = result.clone();
                if next.cancel(reason).is_ok() {
                    if let Err(e) = ctx.observer.step_updated(&key, step, &next).await {
                        return self.abandon(result, e, step, &ctx, &key).await;
                    }
                    result = next;
                }
                return result;
            }

            let interrupted = ctx.cancel.is_cancelled() || ctx.force.is_cancelled();
            if error.is_retryable() && attempt < policy.max_attempts && !interrupted {
                let delay = policy.backoff.delay(attempt);
                let mut next = result.clone();
                if let Err(e) = next.fail(&error) {
                    return self.abandon(result, e, step, &ctx, &key).await;
                }
                if let Err(e) = ctx.observer.step_retrying(&key, step, &next, delay).await {
                    return self.abandon(result, e, step, &ctx, &key).await;
                }
                result = next;
                tracing::warn!(
                    "[StepExecutor] '{}' attempt {} failed, retrying in {}ms: {}",
                    key,
                    attempt,
                    delay.as_millis(),
                    error
                );

                let interrupted = tokio::select! {
                    _ = tokio::time::sleep(delay) => false,
                    _ = ctx.cancel.cancelled() => true,
                };
                if interrupted {
                    if !ctx.deadline_passed() {
                        let mut next = result.clone();
                        if next.cancel("").is_ok()
                            && ctx.observer.step_updated(&key, step, &next).await.is_ok()
                        {
                            result = next;
                        }
                    }
                    return result;
                }
                continue;
            }

            let error = surface(error);
            tracing::warn!(
                "[StepExecutor] '{}' failed after {} attempt(s): {}",
                key,
                attempt,
                error
            );
            let mut next = result.clone();
            if let Err(e) = next.fail(&error) {
                return self.abandon(result, e, step, &ctx, &key).await;
            }
            return match ctx.observer.step_updated(&key, step, &next).await {
                Ok(()) => next,
                Err(e) => self.abandon(result, e, step, &ctx, &key).await,
            };
        }
    }

    /// Fail a running step with an error that prevented a transition from
    /// being committed.
    async fn abandon(
        &self,
        mut result: StepResult,
        error: CoreError,
        step: &StepDef,
        ctx: &StepContext,
        key: &str,
    ) -> StepResult {
        tracing::error!("[StepExecutor] '{}' abandoned: {}", key, error);
        if result.status == StepStatus::Running && result.fail(&error).is_ok() {
            if let Err(e) = ctx.observer.step_updated(key, step, &result).await {
                tracing::error!("[StepExecutor] '{}' failure could not be recorded: {}", key, e);
            }
        } else {
            result.error = Some(error.to_string());
            result.error_kind = Some(error.kind().to_string());
        }
        result
    }

    async fn attempt(&self, step: &StepDef, ctx: &StepContext, key: &str) -> CoreResult<Value> {
        let _permit = if holds_permit(&step.kind) {
            Some(self.acquire_permit(ctx).await?)
        } else {
            None
        };

        let work = self.dispatch(step, ctx, key);
        match self.attempt_timeout(step) {
            Some(limit) => tokio::time::timeout(limit, work).await.map_err(|_| {
                CoreError::Timeout(format!(
                    "step '{}' exceeded {}s",
                    step.id,
                    limit.as_secs()
                ))
            })?,
            None => work.await,
        }
    }

    async fn acquire_permit(&self, ctx: &StepContext) -> CoreResult<OwnedSemaphorePermit> {
        tokio::select! {
            permit = self.inner.permits.clone().acquire_owned() => permit
                .map_err(|_| CoreError::Internal("dispatch pool closed".to_string())),
            _ = ctx.cancel.cancelled() => Err(ctx.interruption()),
        }
    }

    /// Explicit `timeout_secs`, else the default for leaf steps that call
    /// out. Waits and composite steps are bounded by their own config.
    fn attempt_timeout(&self, step: &StepDef) -> Option<Duration> {
        step.timeout().or_else(|| match step.kind {
            StepKind::AgentTask(_) | StepKind::ApiCall(_) => {
                Some(self.inner.config.default_step_timeout())
            }
            _ => None,
        })
    }

    async fn dispatch(&self, step: &StepDef, ctx: &StepContext, key: &str) -> CoreResult<Value> {
        let vars = &ctx.variables;
        match &step.kind {
            StepKind::AgentTask(c) => self.agent_task(step, c, ctx, key).await,
            StepKind::ApiCall(c) => self.api_call(step, c, vars).await,
            StepKind::Condition(c) => {
                let result = expression::evaluate(&c.expression, vars)?;
                tracing::debug!("[StepExecutor] condition '{}' evaluated to {}", key, result);
                Ok(json!({ "result": result }))
            }
            StepKind::Loop(c) => self.run_loop(step, c, ctx, key).await,
            StepKind::Parallel(c) => self.run_parallel(step, c, ctx, key).await,
            StepKind::Wait(c) => self.wait(c, ctx, key).await,
            StepKind::Transform(c) => c.function.apply(render_value(&c.input, vars)?),
            StepKind::Webhook(c) => self.webhook(step, c, ctx, key),
            StepKind::Notification(c) => self.notification(c, ctx, key),
        }
    }

    async fn agent_task(
        &self,
        step: &StepDef,
        config: &AgentTaskConfig,
        ctx: &StepContext,
        key: &str,
    ) -> CoreResult<Value> {
        let vars = &ctx.variables;
        let mut task = AgentTask::new(render_string(&config.prompt, vars)?);
        task.payload = render_value(&config.payload, vars)?;
        task.step_id = Some(key.to_string());
        task.execution_id = Some(ctx.execution_id.clone());
        task.timeout = step.timeout();

        let agent_id = render_opt(config.agent_id.as_deref(), vars)?;
        let entanglement_id = render_opt(config.entanglement_id.as_deref(), vars)?;
        let spawn = match &config.agent_type {
            Some(agent_type) => Some(SpawnRequest {
                agent_type: render_string(agent_type, vars)?,
                name: Some(format!(
                    "{}-{}",
                    step.id,
                    ctx.execution_id.chars().take(8).collect::<String>()
                )),
                config: render_value(&config.agent_config, vars)?,
                capabilities: vec!["agent_task".to_string()],
                execution_id: Some(ctx.execution_id.clone()),
                user_id: ctx.user_id.clone(),
            }),
            None => None,
        };

        let agents = self.inner.agents.clone();
        let entanglements = self.inner.entanglements.clone();
        // Detached: an abandoned attempt still lets the agent finish and
        // return to idle, and ephemeral agents are always terminated.
        let handle = tokio::spawn(async move {
            let (agent_id, ephemeral) = match (agent_id, spawn) {
                (Some(id), _) => (id, false),
                (None, Some(request)) => (agents.spawn(request).await?, true),
                (None, None) => {
                    return Err(CoreError::StepFatal("agent task has no agent".to_string()))
                }
            };
            let outcome = invoke_agent(
                &agents,
                &entanglements,
                &agent_id,
                entanglement_id.as_deref(),
                task,
            )
            .await;
            if ephemeral {
                if let Err(e) = agents.terminate(&agent_id, "step finished").await {
                    tracing::warn!("[StepExecutor] Failed to terminate agent {}: {}", agent_id, e);
                }
            }
            outcome.map(|reply| {
                json!({
                    "content": reply.content,
                    "data": reply.output,
                    "agent_id": agent_id,
                    "model": reply.model,
                })
            })
        });
        handle
            .await
            .map_err(|e| CoreError::Internal(format!("agent task aborted: {}", e)))?
    }

    async fn api_call(&self, step: &StepDef, config: &ApiCallConfig, vars: &Variables) -> CoreResult<Value> {
        let url = render_string(&config.url, vars)?;
        let method = render_string(&config.method, vars)?.to_uppercase();
        let mut headers = std::collections::BTreeMap::new();
        for (name, value) in &config.headers {
            headers.insert(name.clone(), render_string(value, vars)?);
        }
        let body = config.body.as_ref().map(|b| render_value(b, vars)).transpose()?;

        let response = self
            .inner
            .http
            .send(HttpRequest {
                method: method.clone(),
                url: url.clone(),
                headers,
                body,
                timeout: step
                    .timeout()
                    .unwrap_or_else(|| self.inner.config.default_step_timeout()),
            })
            .await?;

        if !response.is_success() {
            return Err(CoreError::StepExecution(format!(
                "{} {} returned HTTP {}",
                method, url, response.status
            )));
        }
        Ok(json!({
            "status": response.status,
            "headers": response.headers,
            "body": response.body,
        }))
    }

    async fn run_loop(
        &self,
        step: &StepDef,
        config: &LoopConfig,
        ctx: &StepContext,
        key: &str,
    ) -> CoreResult<Value> {
        let max = config
            .max_iterations
            .unwrap_or(self.inner.config.max_loop_iterations);
        let (items, count) = coerce_items(
            render_value(&config.over, &ctx.variables)?,
            max.saturating_add(1),
        )?;
        if config.until.is_none() && count > max {
            return Err(exceeded(step, max));
        }

        let mut outputs = Vec::with_capacity(count.min(max));
        for (index, item) in items.into_iter().enumerate() {
            if index >= max {
                return Err(exceeded(step, max));
            }
            if ctx.cancel.is_cancelled() {
                return Err(ctx.interruption());
            }

            let mut vars = ctx.variables.clone();
            vars.insert(
                LOOP_VAR.to_string(),
                json!({ "index": index, "item": item.clone(), "count": count }),
            );
            vars.insert(config.item_var.clone(), item);
            let scope = format!("{}{}[{}]/", ctx.scope, step.id, index);
            let child = ctx.nested(scope, key, vars);

            let outcome = drive_graph(self, &config.body, child, FailureMode::PerStep).await;
            if matches!(outcome.halt, Some(Halt::Cancelled | Halt::TimedOut)) {
                return Err(ctx.interruption());
            }
            if let Some((id, error)) = outcome.first_failure() {
                return Err(CoreError::StepFatal(format!(
                    "iteration {}: step '{}' failed: {}",
                    index, id, error
                )));
            }
            outputs.push(Value::Object(outcome.outputs()));

            if let Some(until) = &config.until {
                if expression::evaluate(until, &outcome.variables)? {
                    tracing::debug!("[StepExecutor] loop '{}' stopped by until after {}", key, index + 1);
                    break;
                }
            }
        }
        Ok(Value::Array(outputs))
    }

    async fn run_parallel(
        &self,
        step: &StepDef,
        config: &ParallelConfig,
        ctx: &StepContext,
        key: &str,
    ) -> CoreResult<Value> {
        let mode = match config.failure_policy {
            FailurePolicy::FailFast => FailureMode::FailFast,
            FailurePolicy::BestEffort => FailureMode::BestEffort,
        };
        let child = ctx.nested(ctx.scope.clone(), key, ctx.variables.clone());
        let outcome = drive_graph(self, &config.branches, child, mode).await;

        if matches!(outcome.halt, Some(Halt::Cancelled | Halt::TimedOut)) {
            return Err(ctx.interruption());
        }
        let mut output = outcome.outputs();
        match config.failure_policy {
            FailurePolicy::FailFast => {
                if let Some((id, error)) = outcome.first_failure() {
                    return Err(CoreError::StepFatal(format!(
                        "parallel '{}': branch '{}' failed: {}",
                        step.id, id, error
                    )));
                }
            }
            FailurePolicy::BestEffort => {
                let errors: Map<String, Value> = outcome
                    .results
                    .iter()
                    .filter(|(_, r)| r.status != StepStatus::Completed)
                    .map(|(id, r)| {
                        let message = r.error.clone().unwrap_or_else(|| r.status.as_str().to_string());
                        (id.clone(), Value::String(message))
                    })
                    .collect();
                output.insert(ERRORS_KEY.to_string(), Value::Object(errors));
            }
        }
        Ok(Value::Object(output))
    }

    async fn wait(&self, config: &WaitConfig, ctx: &StepContext, key: &str) -> CoreResult<Value> {
        let signal = render_opt(config.signal.as_deref(), &ctx.variables)?;
        match (config.duration_ms, signal) {
            (Some(ms), None) => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!({ "waited_ms": ms })),
                    _ = ctx.cancel.cancelled() => Err(ctx.interruption()),
                }
            }
            (duration, Some(name)) => {
                let limit = duration.or(config.timeout_ms).map(Duration::from_millis);
                let timer = async {
                    match limit {
                        Some(limit) => tokio::time::sleep(limit).await,
                        None => std::future::pending().await,
                    }
                };
                tracing::info!("[StepExecutor] '{}' waiting for signal '{}'", key, name);
                tokio::select! {
                    payload = ctx.signals.wait(key, &name) => {
                        Ok(json!({ "signal": name, "payload": payload, "timed_out": false }))
                    }
                    _ = timer => {
                        if duration.is_some() {
                            Ok(json!({ "signal": name, "payload": null, "timed_out": true }))
                        } else {
                            Err(CoreError::Timeout(format!("signal '{}' not received", name)))
                        }
                    }
                    _ = ctx.cancel.cancelled() => Err(ctx.interruption()),
                }
            }
            (None, None) => Err(CoreError::StepFatal("wait has neither duration nor signal".to_string())),
        }
    }

    fn webhook(&self, step: &StepDef, config: &WebhookConfig, ctx: &StepContext, key: &str) -> CoreResult<Value> {
        let vars = &ctx.variables;
        let event = render_string(&config.event, vars)?;
        let url = render_opt(config.url.as_deref(), vars)?;
        let payload = render_value(&config.payload, vars)?;
        let delivered = self
            .inner
            .notifier
            .publish(Event::Webhook(WebhookEventPayload {
                execution_id: ctx.execution_id.clone(),
                step_id: key.to_string(),
                event: event.clone(),
                url,
                payload,
                timestamp: Utc::now(),
            }))
            .map_err(|e| CoreError::StepExecution(format!("webhook '{}' not published: {}", step.id, e)))?;
        Ok(json!({ "event": event, "delivered": delivered }))
    }

    fn notification(&self, config: &NotificationConfig, ctx: &StepContext, key: &str) -> CoreResult<Value> {
        let vars = &ctx.variables;
        let channel = render_string(&config.channel, vars)?;
        let message = render_string(&config.message, vars)?;
        match config.level.as_str() {
            "error" => tracing::error!("[Notification] [{}] {}", channel, message),
            "warn" | "warning" => tracing::warn!("[Notification] [{}] {}", channel, message),
            _ => tracing::info!("[Notification] [{}] {}", channel, message),
        }
        let delivered = self
            .inner
            .notifier
            .publish(Event::Notification(NotificationEventPayload {
                execution_id: ctx.execution_id.clone(),
                step_id: key.to_string(),
                channel: channel.clone(),
                level: config.level.clone(),
                message: message.clone(),
                timestamp: Utc::now(),
            }))
            .map_err(|e| CoreError::StepExecution(format!("notification not published: {}", e)))?;
        Ok(json!({ "channel": channel, "message": message, "delivered": delivered }))
    }
}

async fn invoke_agent(
    agents: &AgentManager,
    entanglements: &EntanglementCoordinator,
    agent_id: &str,
    entanglement_id: Option<&str>,
    mut task: AgentTask,
) -> CoreResult<AgentReply> {
    if let Some(eid) = entanglement_id {
        task.context = entanglements.read_as(eid, agent_id).await?;
    }
    let reply = agents.invoke(agent_id, task).await?;
    if let (Some(eid), Some(patch)) = (entanglement_id, reply.state_patch.clone()) {
        entanglements.update(eid, agent_id, patch).await?;
    }
    Ok(reply)
}

fn render_opt(value: Option<&str>, vars: &Variables) -> CoreResult<Option<String>> {
    value.map(|v| render_string(v, vars)).transpose()
}

fn holds_permit(kind: &StepKind) -> bool {
    matches!(
        kind,
        StepKind::AgentTask(_)
            | StepKind::ApiCall(_)
            | StepKind::Transform(_)
            | StepKind::Webhook(_)
            | StepKind::Notification(_)
    )
}

fn exceeded(step: &StepDef, max: usize) -> CoreError {
    CoreError::StepFatal(format!(
        "loop '{}' exceeded max_iterations ({})",
        step.id, max
    ))
}

/// Agent lifecycle errors reach the workflow as step execution errors once
/// the retry budget is spent.
fn surface(error: CoreError) -> CoreError {
    match error {
        CoreError::AgentSpawn(_) | CoreError::AgentUnavailable(_) | CoreError::AgentTimeout { .. } => {
            CoreError::StepExecution(error.to_string())
        }
        other => other,
    }
}

/// Coerce a rendered `over` value into loop items.
///
/// Returns the items together with the total item count. A numeric `over`
/// is a range `0..n`; only its first `cap` items are materialized.
pub fn coerce_items(value: Value, cap: usize) -> CoreResult<(Vec<Value>, usize)> {
    let items: Vec<Value> = match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        Value::Object(map) => map
            .into_iter()
            .map(|(key, value)| json!({ "key": key, "value": value }))
            .collect(),
        Value::String(s) => {
            let trimmed = s.trim();
            match serde_json::from_str(trimmed) {
                Ok(Value::Array(items)) if trimmed.starts_with('[') => items,
                _ => trimmed
                    .split([',', '\n'])
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            }
        }
        Value::Number(n) => {
            let Some(total) = n.as_u64() else {
                return Err(CoreError::StepFatal(format!("cannot loop over {}", n)));
            };
            let total = usize::try_from(total).unwrap_or(usize::MAX);
            let items = (0..total.min(cap) as u64).map(Value::from).collect();
            return Ok((items, total));
        }
        Value::Bool(b) => return Err(CoreError::StepFatal(format!("cannot loop over {}", b))),
    };
    let total = items.len();
    Ok((items, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::EchoProvider;
    use crate::audit::AuditRecorder;
    use crate::workflow::http::HttpResponse;
    use crate::workflow::schema::Workflow;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct FlakyHttp {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl HttpClient for FlakyHttp {
        async fn send(&self, request: HttpRequest) -> CoreResult<HttpResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let status = if n <= self.fail_first { 503 } else { 200 };
            Ok(HttpResponse {
                status,
                headers: Default::default(),
                body: json!({ "url": request.url, "call": n }),
            })
        }
    }

    #[derive(Default)]
    struct Recording {
        updates: Mutex<Vec<(String, StepStatus)>>,
    }

    #[async_trait]
    impl StepObserver for Recording {
        async fn step_updated(&self, key: &str, _: &StepDef, result: &StepResult) -> CoreResult<()> {
            self.updates.lock().unwrap().push((key.to_string(), result.status));
            Ok(())
        }

        async fn step_retrying(&self, key: &str, _: &StepDef, result: &StepResult, _: Duration) -> CoreResult<()> {
            self.updates.lock().unwrap().push((key.to_string(), result.status));
            Ok(())
        }

        async fn output_bound(&self, _: &str, _: &Value) -> CoreResult<()> {
            Ok(())
        }
    }

    async fn executor_with(http: Arc<dyn HttpClient>) -> StepExecutor {
        let config = CoreConfig::default();
        let notifier = EventNotifier::new(16);
        let audit = AuditRecorder::in_memory();
        let agents = AgentManager::new(&config, notifier.clone(), audit.clone(), None);
        agents.register_provider("echo", Arc::new(EchoProvider)).await;
        let entanglements =
            EntanglementCoordinator::new(agents.clone(), notifier.clone(), audit, None).await;
        StepExecutor::new(&config, agents, entanglements, notifier, http)
    }

    async fn executor() -> StepExecutor {
        executor_with(Arc::new(FlakyHttp { calls: AtomicU32::new(0), fail_first: 0 })).await
    }

    fn step(yaml: &str) -> StepDef {
        let wf = Workflow::from_yaml(&format!("name: t\nsteps:\n{}", yaml)).unwrap();
        wf.steps.into_iter().next().unwrap()
    }

    fn vars(value: Value) -> Variables {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let http = Arc::new(FlakyHttp { calls: AtomicU32::new(0), fail_first: 2 });
        let executor = executor_with(http.clone()).await;
        let step = step(
            "  - id: fetch\n    type: api_call\n    retry: {max_attempts: 3, backoff: {strategy: none}}\n    config: {url: 'http://svc/{{name}}'}\n",
        );
        let observer = Arc::new(Recording::default());
        let mut ctx = StepContext::new("e1", "w1", vars(json!({"name": "items"})));
        ctx.observer = observer.clone();

        let result = executor.execute(&step, ctx).await;
        assert_eq!(result.status, StepStatus::Completed);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.output.as_ref().unwrap()["body"]["url"], "http://svc/items");
        assert_eq!(http.calls.load(Ordering::SeqCst), 3);

        let statuses: Vec<StepStatus> = observer.updates.lock().unwrap().iter().map(|(_, s)| *s).collect();
        assert_eq!(
            statuses,
            vec![
                StepStatus::Running,
                StepStatus::Failed,
                StepStatus::Running,
                StepStatus::Failed,
                StepStatus::Running,
                StepStatus::Completed
            ]
        );
    }

    #[tokio::test]
    async fn test_interpolation_error_is_not_retried() {
        let executor = executor().await;
        let step = step(
            "  - id: t\n    type: transform\n    retry: {max_attempts: 5, backoff: {strategy: none}}\n    config: {function: uppercase, input: '{{missing.output}}'}\n",
        );
        let result = executor.execute(&step, StepContext::new("e1", "w1", Variables::new())).await;
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.error_kind.as_deref(), Some("interpolation_error"));
    }

    #[tokio::test]
    async fn test_loop_collects_iteration_outputs() {
        let executor = executor().await;
        let step = step(
            r#"  - id: each
    type: loop
    config:
      over: "{{nums}}"
      item_var: n
      body:
        - id: double
          type: transform
          config: { function: { name: multiply, factor: 2 }, input: "{{n}}" }
        - id: tag
          type: transform
          depends_on: [double]
          config: { function: identity, input: "{{loop.index}}:{{double.output}}" }
"#,
        );
        let result = executor
            .execute(&step, StepContext::new("e1", "w1", vars(json!({"nums": [1, 5]}))))
            .await;
        assert_eq!(result.status, StepStatus::Completed, "{:?}", result.error);
        assert_eq!(
            result.output.unwrap(),
            json!([{"double": 2, "tag": "0:2"}, {"double": 10, "tag": "1:10"}])
        );
    }

    #[tokio::test]
    async fn test_loop_guard_fails_step() {
        let executor = executor().await;
        let step = step(
            "  - id: each\n    type: loop\n    config:\n      over: 5\n      max_iterations: 3\n      body:\n        - id: noop\n          type: transform\n          config: {function: identity, input: 1}\n",
        );
        let result = executor.execute(&step, StepContext::new("e1", "w1", Variables::new())).await;
        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.error.unwrap().contains("max_iterations"));
    }

    #[tokio::test]
    async fn test_loop_guard_with_huge_numeric_over() {
        let executor = executor().await;
        let step = step(
            "  - id: each\n    type: loop\n    config:\n      over: '{{n}}'\n      max_iterations: 3\n      body:\n        - id: noop\n          type: transform\n          config: {function: identity, input: 1}\n",
        );
        let result = executor
            .execute(&step, StepContext::new("e1", "w1", vars(json!({"n": 10_000_000_000u64}))))
            .await;
        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.error.unwrap().contains("max_iterations"));
    }

    #[tokio::test]
    async fn test_loop_until_stops_numeric_range() {
        let executor = executor().await;
        let step = step(
            "  - id: each\n    type: loop\n    config:\n      over: 1000000\n      max_iterations: 10\n      until: 'item >= 2'\n      body:\n        - id: noop\n          type: transform\n          config: {function: identity, input: '{{item}}'}\n",
        );
        let result = executor.execute(&step, StepContext::new("e1", "w1", Variables::new())).await;
        assert_eq!(result.status, StepStatus::Completed, "{:?}", result.error);
        let output = result.output.unwrap();
        assert_eq!(output.as_array().unwrap().len(), 3);
        assert_eq!(output[2]["noop"], 2);
    }

    #[tokio::test]
    async fn test_loop_over_delimited_string() {
        let executor = executor().await;
        let step = step(
            "  - id: each\n    type: loop\n    config:\n      over: '{{names}}'\n      body:\n        - id: up\n          type: transform\n          config: {function: uppercase, input: '{{item}}'}\n",
        );
        let result = executor
            .execute(&step, StepContext::new("e1", "w1", vars(json!({"names": "ada, grace\nlin"}))))
            .await;
        assert_eq!(result.status, StepStatus::Completed, "{:?}", result.error);
        let output = result.output.unwrap();
        let ups: Vec<&str> = output
            .as_array()
            .unwrap()
            .iter()
            .map(|o| o["up"].as_str().unwrap())
            .collect();
        assert_eq!(ups, vec!["ADA", "GRACE", "LIN"]);
    }

    #[tokio::test]
    async fn test_parallel_best_effort_keeps_partial_results() {
        let executor = executor().await;
        let step = step(
            r#"  - id: fan
    type: parallel
    config:
      failure_policy: best_effort
      branches:
        - id: ok
          type: transform
          config: { function: uppercase, input: "a" }
        - id: bad
          type: transform
          config: { function: uppercase, input: 3 }
"#,
        );
        let result = executor.execute(&step, StepContext::new("e1", "w1", Variables::new())).await;
        assert_eq!(result.status, StepStatus::Completed);
        let output = result.output.unwrap();
        assert_eq!(output["ok"], "A");
        assert!(output.get("bad").is_none());
        assert!(output["errors"]["bad"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_parallel_fail_fast_fails_parent() {
        let executor = executor().await;
        let step = step(
            r#"  - id: fan
    type: parallel
    config:
      failure_policy: fail_fast
      branches:
        - id: slow
          type: wait
          config: { duration_ms: 10000 }
        - id: bad
          type: transform
          config: { function: uppercase, input: 3 }
"#,
        );
        let started = std::time::Instant::now();
        let result = executor.execute(&step, StepContext::new("e1", "w1", Variables::new())).await;
        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.error.unwrap().contains("branch 'bad'"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_wait_for_signal_sent_early() {
        let executor = executor().await;
        let step = step("  - id: approve\n    type: wait\n    config: {signal: approved}\n");
        let ctx = StepContext::new("e1", "w1", Variables::new());
        ctx.signals.send("approved", json!({"by": "ops"}));
        let result = executor.execute(&step, ctx).await;
        assert_eq!(result.status, StepStatus::Completed);
        assert_eq!(result.output.unwrap()["payload"]["by"], "ops");
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait() {
        let executor = executor().await;
        let step = step("  - id: nap\n    type: wait\n    config: {duration_ms: 60000}\n");
        let ctx = StepContext::new("e1", "w1", Variables::new());
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let result = executor.execute(&step, ctx).await;
        assert_eq!(result.status, StepStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_agent_task_with_ephemeral_agent() {
        let executor = executor().await;
        let step = step(
            "  - id: ask\n    type: agent_task\n    config:\n      agent_type: echo\n      prompt: 'Summarize {{topic}}'\n      agent_config: {reply: 'done'}\n",
        );
        let result = executor
            .execute(&step, StepContext::new("e1-execution", "w1", vars(json!({"topic": "logs"}))))
            .await;
        assert_eq!(result.status, StepStatus::Completed, "{:?}", result.error);
        let output = result.output.unwrap();
        assert_eq!(output["content"], "done");
        let agent_id = output["agent_id"].as_str().unwrap();
        let agent = executor.inner.agents.get(agent_id).await.unwrap();
        assert_eq!(agent.status, crate::models::agent::AgentStatus::Terminated);
    }

    #[test]
    fn test_coerce_items() {
        let items = |value: Value| coerce_items(value, usize::MAX).unwrap().0;
        assert_eq!(items(json!(3)), vec![json!(0), json!(1), json!(2)]);
        assert_eq!(items(json!("a, b\nc")), vec![json!("a"), json!("b"), json!("c")]);
        assert_eq!(items(json!("single")), vec![json!("single")]);
        assert_eq!(items(json!("[1, 2]")), vec![json!(1), json!(2)]);
        assert_eq!(items(json!({"k": 1})), vec![json!({"key": "k", "value": 1})]);
        assert!(items(json!(null)).is_empty());
        assert!(coerce_items(json!(-1), 10).is_err());
        assert!(coerce_items(json!(1.5), 10).is_err());
        assert!(coerce_items(json!(true), 10).is_err());
    }

    #[test]
    fn test_coerce_numeric_range_is_capped() {
        let (items, total) = coerce_items(json!(10_000_000_000u64), 4).unwrap();
        assert_eq!(items, vec![json!(0), json!(1), json!(2), json!(3)]);
        assert_eq!(total, 10_000_000_000usize);
    }
}
