//! WorkflowEngine - registry, execution lifecycle and state.
//!
//! Each execution is driven by one spawned task running the graph driver
//! over the workflow's top-level steps. The task is the only writer of the
//! execution's variables; step transitions reach the snapshot through
//! [`RunObserver`], which audits each one before it is committed.

pub mod graph;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;

use crate::audit::AuditRecorder;
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::{Event, EventNotifier, StepEventPayload, WorkflowBlocker, WorkflowEventPayload};
use crate::models::audit::{Actor, AuditEvent, TargetType};
use crate::models::execution::{Execution, ExecutionStatus, StepResult, StepStatus, Variables};
use crate::store::{ExecutionStore, WorkflowStore};
use crate::workflow::cancel::CancelSignal;
use crate::workflow::executor::{StepContext, StepExecutor, StepObserver};
use crate::workflow::schema::{StepDef, StepKind, Workflow};
use crate::workflow::signals::SignalHub;
use crate::workflow::validate::{validate_workflow, LOOP_VAR};

use graph::{drive_graph, FailureMode, GraphOutcome, Halt};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartOptions {
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Counts and blockers for the health report.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub active: usize,
    pub paused: usize,
    pub blockers: Vec<WorkflowBlocker>,
}

struct RunHandle {
    execution: RwLock<Execution>,
    workflow: Arc<Workflow>,
    cancel: CancelSignal,
    pause: watch::Sender<bool>,
    signals: SignalHub,
    done: watch::Sender<bool>,
}

struct EngineInner {
    workflows: RwLock<HashMap<String, Arc<Workflow>>>,
    runs: RwLock<HashMap<String, Arc<RunHandle>>>,
    executor: StepExecutor,
    notifier: EventNotifier,
    audit: AuditRecorder,
    config: CoreConfig,
    workflow_store: Option<WorkflowStore>,
    execution_store: Option<ExecutionStore>,
}

#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn new(
        config: &CoreConfig,
        executor: StepExecutor,
        notifier: EventNotifier,
        audit: AuditRecorder,
        workflow_store: Option<WorkflowStore>,
        execution_store: Option<ExecutionStore>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                workflows: RwLock::new(HashMap::new()),
                runs: RwLock::new(HashMap::new()),
                executor,
                notifier,
                audit,
                config: config.clone(),
                workflow_store,
                execution_store,
            }),
        }
    }

    pub fn executor(&self) -> &StepExecutor {
        &self.inner.executor
    }

    // ─── Registry ─────────────────────────────────────────────────────────

    /// Validate and register a workflow. Re-registering an id replaces it
    /// for future executions only.
    pub async fn register(&self, workflow: Workflow, user_id: Option<&str>) -> CoreResult<String> {
        validate_workflow(&workflow)?;
        self.inner
            .audit
            .record(
                AuditEvent::new(
                    Actor::user_or_system(user_id),
                    "workflow.registered",
                    TargetType::Workflow,
                    &workflow.id,
                )
                .with_metadata(json!({
                    "name": workflow.name,
                    "version": workflow.version,
                    "total_steps": workflow.total_steps(),
                })),
            )
            .await?;

        if let Some(store) = &self.inner.workflow_store {
            if let Err(e) = store.save(&workflow).await {
                tracing::warn!("[Engine] Failed to persist workflow {}: {}", workflow.id, e);
            }
        }
        let id = workflow.id.clone();
        tracing::info!("[Engine] Registered workflow '{}' ({})", workflow.name, id);
        self.inner
            .workflows
            .write()
            .await
            .insert(id.clone(), Arc::new(workflow));
        Ok(id)
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> CoreResult<Arc<Workflow>> {
        if let Some(wf) = self.inner.workflows.read().await.get(workflow_id) {
            return Ok(wf.clone());
        }
        if let Some(store) = &self.inner.workflow_store {
            if let Some(wf) = store.get(workflow_id).await? {
                let wf = Arc::new(wf);
                self.inner
                    .workflows
                    .write()
                    .await
                    .insert(workflow_id.to_string(), wf.clone());
                return Ok(wf);
            }
        }
        Err(CoreError::NotFound(format!("Workflow {}", workflow_id)))
    }

    pub async fn list_workflows(&self) -> Vec<Arc<Workflow>> {
        let mut workflows: Vec<Arc<Workflow>> =
            self.inner.workflows.read().await.values().cloned().collect();
        workflows.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        workflows
    }

    /// Load persisted workflows into the registry. Returns how many.
    pub async fn load_workflows(&self) -> CoreResult<usize> {
        let Some(store) = &self.inner.workflow_store else {
            return Ok(0);
        };
        let stored = store.list().await?;
        let mut workflows = self.inner.workflows.write().await;
        let count = stored.len();
        for wf in stored {
            workflows.insert(wf.id.clone(), Arc::new(wf));
        }
        tracing::info!("[Engine] Loaded {} workflow(s) from store", count);
        Ok(count)
    }

    // ─── Executions ───────────────────────────────────────────────────────

    /// Validate `workflow` and start executing it. Returns the execution id.
    pub async fn start(&self, workflow: Workflow, input: Variables, options: StartOptions) -> CoreResult<String> {
        self.launch(Arc::new(workflow), input, options).await
    }

    pub async fn start_by_id(
        &self,
        workflow_id: &str,
        input: Variables,
        options: StartOptions,
    ) -> CoreResult<String> {
        let workflow = self.get_workflow(workflow_id).await?;
        self.launch(workflow, input, options).await
    }

    async fn launch(&self, workflow: Arc<Workflow>, input: Variables, options: StartOptions) -> CoreResult<String> {
        validate_workflow(&workflow)?;
        check_input(&workflow, &input)?;

        let mut execution = Execution::new(&workflow, input, options.user_id.clone());
        self.inner
            .audit
            .record(
                AuditEvent::new(
                    Actor::user_or_system(options.user_id.as_deref()),
                    "execution.started",
                    TargetType::Execution,
                    &execution.id,
                )
                .with_metadata(json!({
                    "workflow_id": workflow.id,
                    "workflow_name": workflow.name,
                    "input_keys": execution.variables.keys().collect::<Vec<_>>(),
                })),
            )
            .await?;

        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(Utc::now());
        let execution_id = execution.id.clone();

        let (pause_tx, pause_rx) = watch::channel(false);
        let (done_tx, _) = watch::channel(false);
        self.persist(&execution).await;
        self.publish_workflow(&execution);
        let run = Arc::new(RunHandle {
            execution: RwLock::new(execution),
            workflow: workflow.clone(),
            cancel: CancelSignal::new(),
            pause: pause_tx,
            signals: SignalHub::new(),
            done: done_tx,
        });
        self.inner
            .runs
            .write()
            .await
            .insert(execution_id.clone(), run.clone());

        tracing::info!(
            "[Engine] Started execution {} of workflow '{}' ({} steps)",
            execution_id,
            workflow.name,
            workflow.total_steps()
        );

        let engine = self.clone();
        tokio::spawn(async move {
            engine.drive(run, pause_rx).await;
        });
        Ok(execution_id)
    }

    async fn drive(&self, run: Arc<RunHandle>, pause: watch::Receiver<bool>) {
        let (execution_id, variables, user_id) = {
            let e = run.execution.read().await;
            (e.id.clone(), e.variables.clone(), e.user_id.clone())
        };
        let timeout = self.inner.config.workflow_timeout();
        let ctx = StepContext {
            execution_id,
            workflow_id: run.workflow.id.clone(),
            user_id,
            scope: String::new(),
            parent: None,
            variables,
            cancel: run.cancel.clone(),
            force: CancelSignal::new(),
            pause,
            signals: run.signals.clone(),
            observer: Arc::new(RunObserver {
                engine: self.clone(),
                run: run.clone(),
            }),
            deadline: (!timeout.is_zero()).then(|| Instant::now() + timeout),
        };

        let outcome = drive_graph(&self.inner.executor, &run.workflow.steps, ctx, FailureMode::PerStep).await;
        self.finalize(&run, outcome).await;
    }

    async fn finalize(&self, run: &RunHandle, outcome: GraphOutcome) {
        let (mut status, mut error, already_cancelled, execution_id, user_id) = {
            let mut e = run.execution.write().await;
            for (id, result) in &outcome.results {
                let stale = e
                    .step_results
                    .get(id)
                    .map_or(true, |r| !r.status.is_terminal());
                if stale {
                    e.step_results.insert(id.clone(), result.clone());
                }
            }
            let already_cancelled = e.status == ExecutionStatus::Cancelled;
            let (status, error) = settle(&e, &outcome);
            (status, error, already_cancelled, e.id.clone(), e.user_id.clone())
        };

        if !(already_cancelled && status == ExecutionStatus::Cancelled) {
            let recorded = self
                .inner
                .audit
                .record(
                    AuditEvent::new(
                        Actor::user_or_system(user_id.as_deref()),
                        format!("execution.{}", status.as_str()),
                        TargetType::Execution,
                        &execution_id,
                    )
                    .with_metadata(json!({ "error": error })),
                )
                .await;
            if let Err(e) = recorded {
                status = ExecutionStatus::Failed;
                error = Some(e.to_string());
            }
        }

        let snapshot = {
            let mut e = run.execution.write().await;
            e.status = status;
            e.error = error;
            e.finished_at = Some(Utc::now());
            e.clone()
        };
        self.persist(&snapshot).await;
        self.publish_workflow(&snapshot);
        match snapshot.status {
            ExecutionStatus::Failed => tracing::warn!(
                "[Engine] Execution {} failed: {}",
                snapshot.id,
                snapshot.error.as_deref().unwrap_or("unknown error")
            ),
            status => tracing::info!(
                "[Engine] Execution {} {} in {}ms ({}/{} steps completed)",
                snapshot.id,
                status.as_str(),
                snapshot.duration_ms().unwrap_or(0),
                snapshot.steps_completed(),
                snapshot.total_steps
            ),
        }
        run.done.send_replace(true);
    }

    /// Cancel an execution: no further dispatch, in-flight steps are
    /// signalled and force-marked after the grace period. Cancelling a
    /// cancelled execution is a no-op.
    pub async fn cancel(&self, execution_id: &str, user_id: Option<&str>) -> CoreResult<()> {
        let Some(run) = self.run(execution_id).await else {
            let stored = self.get_status(execution_id).await?;
            return match stored.status {
                ExecutionStatus::Cancelled => Ok(()),
                status => Err(CoreError::Validation(format!(
                    "execution {} is {}",
                    execution_id,
                    status.as_str()
                ))),
            };
        };

        {
            let e = run.execution.read().await;
            match e.status {
                ExecutionStatus::Cancelled => return Ok(()),
                s if s.is_terminal() => {
                    return Err(CoreError::Validation(format!(
                        "execution {} already {}",
                        execution_id,
                        s.as_str()
                    )))
                }
                _ => {}
            }
        }

        self.inner
            .audit
            .record(AuditEvent::new(
                Actor::user_or_system(user_id),
                "execution.cancelled",
                TargetType::Execution,
                execution_id,
            ))
            .await?;
        run.cancel.cancel();
        let snapshot = {
            let mut e = run.execution.write().await;
            if e.status.is_terminal() {
                return Ok(());
            }
            e.status = ExecutionStatus::Cancelled;
            e.clone()
        };
        tracing::info!("[Engine] Cancelled execution {}", execution_id);
        self.persist(&snapshot).await;
        self.publish_workflow(&snapshot);
        Ok(())
    }

    /// Stop dispatching new steps; running steps carry on.
    pub async fn pause(&self, execution_id: &str, user_id: Option<&str>) -> CoreResult<()> {
        self.set_paused(execution_id, user_id, true).await
    }

    pub async fn resume(&self, execution_id: &str, user_id: Option<&str>) -> CoreResult<()> {
        self.set_paused(execution_id, user_id, false).await
    }

    async fn set_paused(&self, execution_id: &str, user_id: Option<&str>, paused: bool) -> CoreResult<()> {
        let run = self.live_run(execution_id).await?;
        let (from, to, action) = if paused {
            (ExecutionStatus::Running, ExecutionStatus::Paused, "execution.paused")
        } else {
            (ExecutionStatus::Paused, ExecutionStatus::Running, "execution.resumed")
        };
        {
            let e = run.execution.read().await;
            if e.status == to {
                return Ok(());
            }
            if e.status != from {
                return Err(CoreError::Validation(format!(
                    "execution {} is {}",
                    execution_id,
                    e.status.as_str()
                )));
            }
        }

        self.inner
            .audit
            .record(AuditEvent::new(
                Actor::user_or_system(user_id),
                action,
                TargetType::Execution,
                execution_id,
            ))
            .await?;
        let snapshot = {
            let mut e = run.execution.write().await;
            if e.status != from {
                return Ok(());
            }
            e.status = to;
            e.clone()
        };
        run.pause.send_replace(paused);
        tracing::info!("[Engine] Execution {} {}", execution_id, to.as_str());
        self.persist(&snapshot).await;
        self.publish_workflow(&snapshot);
        Ok(())
    }

    /// Deliver an external signal to the execution's `wait` steps.
    pub async fn signal(&self, execution_id: &str, name: &str, payload: Value, user_id: Option<&str>) -> CoreResult<()> {
        let run = self.live_run(execution_id).await?;
        self.inner
            .audit
            .record(
                AuditEvent::new(
                    Actor::user_or_system(user_id),
                    "execution.signaled",
                    TargetType::Execution,
                    execution_id,
                )
                .with_metadata(json!({ "signal": name })),
            )
            .await?;
        run.signals.send(name, payload);
        tracing::info!("[Engine] Signal '{}' delivered to execution {}", name, execution_id);
        Ok(())
    }

    pub async fn get_status(&self, execution_id: &str) -> CoreResult<Execution> {
        if let Some(run) = self.run(execution_id).await {
            return Ok(run.execution.read().await.clone());
        }
        if let Some(store) = &self.inner.execution_store {
            if let Some(execution) = store.get(execution_id).await? {
                return Ok(execution);
            }
        }
        Err(CoreError::NotFound(format!("Execution {}", execution_id)))
    }

    /// Snapshots, newest first. Stored executions fill in so runs from
    /// earlier processes are included.
    pub async fn list_executions(&self, workflow_id: Option<&str>) -> CoreResult<Vec<Execution>> {
        let runs: Vec<Arc<RunHandle>> = self.inner.runs.read().await.values().cloned().collect();
        let mut executions = Vec::with_capacity(runs.len());
        for run in runs {
            let e = run.execution.read().await;
            if workflow_id.map_or(true, |id| e.workflow_id == id) {
                executions.push(e.clone());
            }
        }
        if let Some(store) = &self.inner.execution_store {
            let stored = match workflow_id {
                Some(id) => store.list_by_workflow(id).await?,
                None => store.list_all().await?,
            };
            let seen: HashSet<String> = executions.iter().map(|e| e.id.clone()).collect();
            executions.extend(stored.into_iter().filter(|e| !seen.contains(&e.id)));
        }
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(executions)
    }

    /// Resolve with the terminal snapshot, or `Timeout` after `timeout`.
    pub async fn wait_for(&self, execution_id: &str, timeout: Duration) -> CoreResult<Execution> {
        let Some(run) = self.run(execution_id).await else {
            return self.get_status(execution_id).await;
        };
        let mut done = run.done.subscribe();
        match tokio::time::timeout(timeout, done.wait_for(|finished| *finished)).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => {
                return Err(CoreError::Internal(format!(
                    "execution {} driver went away",
                    execution_id
                )))
            }
            Err(_) => {
                return Err(CoreError::Timeout(format!(
                    "execution {} still running after {}ms",
                    execution_id,
                    timeout.as_millis()
                )))
            }
        }
        let snapshot = run.execution.read().await.clone();
        Ok(snapshot)
    }

    /// Cancel every live execution, e.g. on shutdown.
    pub async fn cancel_all(&self) {
        let ids: Vec<String> = self.inner.runs.read().await.keys().cloned().collect();
        for id in ids {
            match self.cancel(&id, None).await {
                Ok(()) | Err(CoreError::Validation(_)) => {}
                Err(e) => tracing::warn!("[Engine] Failed to cancel {} on shutdown: {}", id, e),
            }
        }
    }

    /// Mark stored executions that were live when the process stopped as
    /// failed. Returns how many.
    pub async fn recover_interrupted(&self) -> CoreResult<usize> {
        let Some(store) = &self.inner.execution_store else {
            return Ok(0);
        };
        let mut stale = store.list_by_status(ExecutionStatus::Running).await?;
        stale.extend(store.list_by_status(ExecutionStatus::Paused).await?);
        let live: HashSet<String> = self.inner.runs.read().await.keys().cloned().collect();

        let mut recovered = 0;
        for mut execution in stale.into_iter().filter(|e| !live.contains(&e.id)) {
            self.inner
                .audit
                .record(
                    AuditEvent::new(Actor::system(), "execution.failed", TargetType::Execution, &execution.id)
                        .with_metadata(json!({ "error": "interrupted by restart" })),
                )
                .await?;
            for result in execution.step_results.values_mut() {
                if !result.status.is_terminal() {
                    let _ = result.cancel("interrupted by restart");
                }
            }
            execution.status = ExecutionStatus::Failed;
            execution.error = Some("interrupted by restart".to_string());
            execution.finished_at = Some(Utc::now());
            store.save(&execution).await?;
            recovered += 1;
        }
        if recovered > 0 {
            tracing::warn!("[Engine] Marked {} interrupted execution(s) as failed", recovered);
        }
        Ok(recovered)
    }

    pub async fn stats(&self) -> EngineStats {
        let runs: Vec<Arc<RunHandle>> = self.inner.runs.read().await.values().cloned().collect();
        let mut stats = EngineStats::default();
        for run in runs {
            let e = run.execution.read().await;
            if e.status.is_terminal() {
                continue;
            }
            stats.active += 1;
            if e.status == ExecutionStatus::Paused {
                stats.paused += 1;
                stats.blockers.push(WorkflowBlocker {
                    execution_id: e.id.clone(),
                    workflow_name: e.workflow_name.clone(),
                    step_id: None,
                    reason: "paused".to_string(),
                });
            }
            for (step_id, signal) in run.signals.waiting() {
                stats.blockers.push(WorkflowBlocker {
                    execution_id: e.id.clone(),
                    workflow_name: e.workflow_name.clone(),
                    step_id: Some(step_id),
                    reason: format!("waiting for signal '{}'", signal),
                });
            }
        }
        stats
    }

    // ─── Internals ────────────────────────────────────────────────────────

    async fn run(&self, execution_id: &str) -> Option<Arc<RunHandle>> {
        self.inner.runs.read().await.get(execution_id).cloned()
    }

    async fn live_run(&self, execution_id: &str) -> CoreResult<Arc<RunHandle>> {
        match self.run(execution_id).await {
            Some(run) => {
                let status = run.execution.read().await.status;
                if status.is_terminal() {
                    Err(CoreError::Validation(format!(
                        "execution {} is {}",
                        execution_id,
                        status.as_str()
                    )))
                } else {
                    Ok(run)
                }
            }
            None => {
                let stored = self.get_status(execution_id).await?;
                Err(CoreError::Validation(format!(
                    "execution {} is {}",
                    execution_id,
                    stored.status.as_str()
                )))
            }
        }
    }

    async fn persist(&self, execution: &Execution) {
        if let Some(store) = &self.inner.execution_store {
            if let Err(e) = store.save(execution).await {
                tracing::warn!("[Engine] Failed to persist execution {}: {}", execution.id, e);
            }
        }
    }

    fn publish_workflow(&self, execution: &Execution) {
        self.inner.notifier.publish_safe(Event::Workflow(WorkflowEventPayload {
            workflow_id: execution.workflow_id.clone(),
            workflow_name: execution.workflow_name.clone(),
            execution_id: execution.id.clone(),
            status: execution.status.as_str().to_string(),
            user_id: execution.user_id.clone(),
            timestamp: Utc::now(),
            error: execution.error.clone(),
            duration: execution
                .finished_at
                .and_then(|_| execution.duration_ms()),
            steps_completed: execution.steps_completed(),
            total_steps: execution.total_steps,
        }));
    }
}

/// Terminal status and error from the top-level outcome.
fn settle(execution: &Execution, outcome: &GraphOutcome) -> (ExecutionStatus, Option<String>) {
    if execution.status == ExecutionStatus::Cancelled || outcome.halt == Some(Halt::Cancelled) {
        return (ExecutionStatus::Cancelled, None);
    }
    if outcome.halt == Some(Halt::TimedOut) {
        return (ExecutionStatus::Failed, Some("workflow timed out".to_string()));
    }
    let unfinished = outcome
        .results
        .values()
        .any(|r| !matches!(r.status, StepStatus::Completed | StepStatus::Skipped));
    if unfinished || outcome.halt.is_some() {
        let error = outcome
            .first_failure()
            .map(|(id, err)| format!("step '{}' failed: {}", id, err))
            .unwrap_or_else(|| "execution did not complete".to_string());
        return (ExecutionStatus::Failed, Some(error));
    }
    (ExecutionStatus::Completed, None)
}

/// Input keys share the namespace step outputs bind into.
fn check_input(workflow: &Workflow, input: &Variables) -> CoreResult<()> {
    let mut ids = HashSet::new();
    collect_ids(&workflow.steps, &mut ids);
    let clashes: Vec<&str> = input
        .keys()
        .map(String::as_str)
        .filter(|k| *k == LOOP_VAR || ids.contains(k))
        .collect();
    if clashes.is_empty() {
        Ok(())
    } else {
        Err(CoreError::Validation(format!(
            "input keys collide with step ids or reserved names: {}",
            clashes.join(", ")
        )))
    }
}

fn collect_ids<'a>(steps: &'a [StepDef], out: &mut HashSet<&'a str>) {
    for step in steps {
        out.insert(step.id.as_str());
        match &step.kind {
            StepKind::Loop(c) => collect_ids(&c.body, out),
            StepKind::Parallel(c) => collect_ids(&c.branches, out),
            _ => {}
        }
    }
}

/// Commits step transitions into one execution's snapshot.
struct RunObserver {
    engine: WorkflowEngine,
    run: Arc<RunHandle>,
}

impl RunObserver {
    async fn commit(&self, action: &str, key: &str, step: &StepDef, result: &StepResult, extra: Value) -> CoreResult<()> {
        let execution_id = self.run.execution.read().await.id.clone();
        let mut metadata = json!({
            "execution_id": execution_id,
            "step_type": step.step_type().as_str(),
            "attempt": result.attempts,
            "error": result.error,
        });
        if let (Some(map), Value::Object(more)) = (metadata.as_object_mut(), extra) {
            map.extend(more);
        }
        self.engine
            .inner
            .audit
            .record(
                AuditEvent::new(
                    Actor::system(),
                    action,
                    TargetType::Step,
                    format!("{}/{}", execution_id, key),
                )
                .with_metadata(metadata),
            )
            .await?;

        let snapshot = {
            let mut e = self.run.execution.write().await;
            e.step_results.insert(key.to_string(), result.clone());
            e.clone()
        };
        self.engine.persist(&snapshot).await;
        self.engine
            .inner
            .notifier
            .publish_safe(Event::Step(StepEventPayload {
                execution_id: snapshot.id.clone(),
                workflow_id: snapshot.workflow_id.clone(),
                step_id: key.to_string(),
                step_type: step.step_type().as_str().to_string(),
                status: result.status.as_str().to_string(),
                attempt: result.attempts,
                timestamp: Utc::now(),
                error: result.error.clone(),
            }));
        Ok(())
    }
}

#[async_trait]
impl StepObserver for RunObserver {
    async fn step_updated(&self, key: &str, step: &StepDef, result: &StepResult) -> CoreResult<()> {
        self.commit(
            &format!("step.{}", result.status.as_str()),
            key,
            step,
            result,
            Value::Null,
        )
        .await
    }

    async fn step_retrying(
        &self,
        key: &str,
        step: &StepDef,
        result: &StepResult,
        delay: Duration,
    ) -> CoreResult<()> {
        self.commit(
            "step.retrying",
            key,
            step,
            result,
            json!({ "delay_ms": delay.as_millis() as u64 }),
        )
        .await
    }

    async fn output_bound(&self, name: &str, output: &Value) -> CoreResult<()> {
        self.run
            .execution
            .write()
            .await
            .bind_output(name, output.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentManager;
    use crate::entanglement::EntanglementCoordinator;
    use crate::workflow::http::ReqwestHttpClient;
    use serde_json::json;

    async fn engine() -> WorkflowEngine {
        let config = CoreConfig::default();
        let notifier = EventNotifier::new(64);
        let audit = AuditRecorder::in_memory();
        let agents = AgentManager::new(&config, notifier.clone(), audit.clone(), None);
        let entanglements =
            EntanglementCoordinator::new(agents.clone(), notifier.clone(), audit.clone(), None).await;
        let executor = StepExecutor::new(
            &config,
            agents,
            entanglements,
            notifier.clone(),
            Arc::new(ReqwestHttpClient::new()),
        );
        WorkflowEngine::new(&config, executor, notifier, audit, None, None)
    }

    fn input(value: Value) -> Variables {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_condition_selects_branch() {
        let engine = engine().await;
        let wf = Workflow::from_yaml(
            r#"
name: branching
steps:
  - id: check
    type: condition
    config: { expression: "score > 5", else_steps: [low] }
  - id: high
    type: transform
    depends_on: [check]
    config: { function: uppercase, input: "high" }
  - id: low
    type: transform
    depends_on: [check]
    config: { function: uppercase, input: "low" }
  - id: after_low
    type: transform
    depends_on: [low]
    config: { function: identity, input: "{{low.output}}" }
"#,
        )
        .unwrap();
        let id = engine
            .start(wf, input(json!({"score": 9})), StartOptions::default())
            .await
            .unwrap();
        let e = engine.wait_for(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(e.status, ExecutionStatus::Completed, "{:?}", e.error);
        assert_eq!(e.variables["high"]["output"], "HIGH");
        assert_eq!(e.step_results["low"].status, StepStatus::Skipped);
        assert_eq!(e.step_results["after_low"].status, StepStatus::Skipped);
        assert!(!e.variables.contains_key("low"));
    }

    #[tokio::test]
    async fn test_continue_runs_independent_steps_but_fails_execution() {
        let engine = engine().await;
        let wf = Workflow::from_yaml(
            r#"
name: partial
steps:
  - id: bad
    type: transform
    on_failure: continue
    config: { function: uppercase, input: 1 }
  - id: good
    type: transform
    config: { function: lowercase, input: "OK" }
  - id: after_bad
    type: transform
    depends_on: [bad]
    config: { function: identity, input: 1 }
"#,
        )
        .unwrap();
        let id = engine.start(wf, Variables::new(), StartOptions::default()).await.unwrap();
        let e = engine.wait_for(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(e.status, ExecutionStatus::Failed);
        assert_eq!(e.step_results["good"].status, StepStatus::Completed);
        assert_eq!(e.step_results["after_bad"].status, StepStatus::Skipped);
        assert!(e.error.unwrap().contains("'bad'"));
    }

    #[tokio::test]
    async fn test_input_may_not_shadow_step_ids() {
        let engine = engine().await;
        let wf = Workflow::from_yaml(
            "name: w\nsteps:\n  - id: a\n    type: transform\n    config: {function: identity, input: 1}\n",
        )
        .unwrap();
        let err = engine
            .start(wf, input(json!({"a": 1})), StartOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn test_registry_round_trip() {
        let engine = engine().await;
        let wf = Workflow::from_yaml(
            "name: reg\nsteps:\n  - id: a\n    type: transform\n    config: {function: identity, input: '{{x}}'}\n",
        )
        .unwrap();
        let wf_id = engine.register(wf, Some("u1")).await.unwrap();
        assert_eq!(engine.list_workflows().await.len(), 1);

        let id = engine
            .start_by_id(&wf_id, input(json!({"x": 7})), StartOptions { user_id: Some("u1".into()) })
            .await
            .unwrap();
        let e = engine.wait_for(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(e.variables["a"]["output"], 7);
        assert_eq!(e.user_id.as_deref(), Some("u1"));
        assert_eq!(engine.list_executions(Some(&wf_id)).await.unwrap().len(), 1);
        assert!(matches!(
            engine.start_by_id("missing", Variables::new(), StartOptions::default()).await,
            Err(CoreError::NotFound(_))
        ));
    }
}
