//! Dependency-ordered dispatch of one sibling group of steps.
//!
//! The top-level step list, each loop iteration's body and a parallel
//! step's branches are all driven here. Ready steps run concurrently;
//! results are folded back into the level's variables by this task only.

use std::collections::{BTreeMap, HashMap, HashSet};

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{Map, Value};

use crate::models::execution::{bind_output, StepResult, StepStatus, Variables};
use crate::workflow::executor::{StepContext, StepExecutor};
use crate::workflow::schema::{OnFailure, StepDef, StepKind};

/// How a failed step affects its siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Each step's `on_failure` decides
    PerStep,
    /// Any failure halts the group
    FailFast,
    /// Failures never halt the group
    BestEffort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Halt {
    Cancelled,
    TimedOut,
    /// Step id that stopped the group
    Failed(String),
}

impl Halt {
    fn reason(&self) -> String {
        match self {
            Halt::Cancelled => "execution cancelled".to_string(),
            Halt::TimedOut => "workflow timed out".to_string(),
            Halt::Failed(id) => format!("halted after step '{}' failed", id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GraphOutcome {
    /// Keyed by local step id
    pub results: BTreeMap<String, StepResult>,
    pub variables: Variables,
    pub halt: Option<Halt>,
}

impl GraphOutcome {
    /// The step that halted the group, else the first failed step.
    pub fn first_failure(&self) -> Option<(String, String)> {
        if let Some(Halt::Failed(id)) = &self.halt {
            if let Some(result) = self.results.get(id) {
                return Some((id.clone(), error_text(result)));
            }
        }
        self.results
            .iter()
            .find(|(_, r)| r.status == StepStatus::Failed)
            .map(|(id, r)| (id.clone(), error_text(r)))
    }

    /// Outputs of completed steps.
    pub fn outputs(&self) -> Map<String, Value> {
        self.results
            .iter()
            .filter(|(_, r)| r.status == StepStatus::Completed)
            .map(|(id, r)| (id.clone(), r.output.clone().unwrap_or(Value::Null)))
            .collect()
    }
}

fn error_text(result: &StepResult) -> String {
    result
        .error
        .clone()
        .unwrap_or_else(|| result.status.as_str().to_string())
}

enum Readiness {
    Blocked,
    Ready,
    Skip(String),
}

type Running<'a> = FuturesUnordered<BoxFuture<'a, (&'a StepDef, StepResult)>>;

struct Level<'a> {
    executor: &'a StepExecutor,
    steps: &'a [StepDef],
    ctx: StepContext,
    mode: FailureMode,
    /// Children see this pair instead of the caller's signals so a halt
    /// stops only this group.
    cancel: crate::workflow::cancel::CancelSignal,
    force: crate::workflow::cancel::CancelSignal,
    vars: Variables,
    results: BTreeMap<String, StepResult>,
    dispatched: HashSet<&'a str>,
    /// condition id → evaluated result
    gates: HashMap<&'a str, bool>,
    else_steps: HashMap<&'a str, &'a [String]>,
    halt: Option<Halt>,
}

/// Drive `steps` to terminal results under `ctx`.
pub fn drive_graph<'a>(
    executor: &'a StepExecutor,
    steps: &'a [StepDef],
    ctx: StepContext,
    mode: FailureMode,
) -> BoxFuture<'a, GraphOutcome> {
    Box::pin(async move {
        let else_steps = steps
            .iter()
            .filter_map(|s| match &s.kind {
                StepKind::Condition(c) => Some((s.id.as_str(), c.else_steps.as_slice())),
                _ => None,
            })
            .collect();
        let level = Level {
            executor,
            steps,
            cancel: ctx.cancel.child(),
            force: ctx.force.child(),
            vars: ctx.variables.clone(),
            ctx,
            mode,
            results: BTreeMap::new(),
            dispatched: HashSet::new(),
            gates: HashMap::new(),
            else_steps,
            halt: None,
        };
        level.run().await
    })
}

impl<'a> Level<'a> {
    async fn run(mut self) -> GraphOutcome {
        let mut running: Running<'a> = FuturesUnordered::new();
        let mut pause = self.ctx.pause.clone();
        let mut pause_live = true;

        loop {
            if self.halt.is_none() && self.ctx.cancel.is_cancelled() {
                self.halt = Some(self.interrupted());
            }
            if self.halt.is_some() {
                break;
            }
            let paused = pause_live && *pause.borrow();
            if !paused {
                self.dispatch_ready(&mut running).await;
            }
            if self.results.len() == self.steps.len() {
                break;
            }
            if running.is_empty() && !paused {
                // Nothing runnable and nothing in flight.
                break;
            }

            let deadline = self.ctx.deadline;
            tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => {
                    self.halt = Some(self.interrupted());
                }
                _ = sleep_until(deadline), if deadline.is_some() => {
                    self.halt = Some(Halt::TimedOut);
                }
                Some((step, result)) = running.next(), if !running.is_empty() => {
                    self.record(step, result).await;
                }
                changed = pause.changed(), if pause_live => {
                    if changed.is_err() {
                        pause_live = false;
                    }
                }
            }
        }

        if !running.is_empty() {
            self.drain(&mut running).await;
        }
        self.cancel_remaining().await;

        GraphOutcome {
            results: self.results,
            variables: self.vars,
            halt: self.halt,
        }
    }

    fn interrupted(&self) -> Halt {
        if self.ctx.deadline_passed() {
            Halt::TimedOut
        } else {
            Halt::Cancelled
        }
    }

    fn readiness(&self, step: &StepDef) -> Readiness {
        for dep in &step.depends_on {
            match self.results.get(dep).map(|r| r.status) {
                None => return Readiness::Blocked,
                Some(StepStatus::Completed) => {}
                Some(status @ (StepStatus::Skipped | StepStatus::Failed | StepStatus::Cancelled)) => {
                    return Readiness::Skip(format!("dependency '{}' {}", dep, status.as_str()));
                }
                Some(_) => return Readiness::Blocked,
            }
        }
        for dep in &step.depends_on {
            if let Some(&gate) = self.gates.get(dep.as_str()) {
                let in_else = self
                    .else_steps
                    .get(dep.as_str())
                    .is_some_and(|ids| ids.iter().any(|id| id == &step.id));
                if gate == in_else {
                    return Readiness::Skip(format!("condition '{}' was {}", dep, gate));
                }
            }
        }
        Readiness::Ready
    }

    async fn dispatch_ready(&mut self, running: &mut Running<'a>) {
        // Skips can unblock further skips, so sweep until nothing changes.
        loop {
            let mut progressed = false;
            for step in self.steps {
                if self.dispatched.contains(step.id.as_str()) || self.results.contains_key(&step.id) {
                    continue;
                }
                match self.readiness(step) {
                    Readiness::Blocked => {}
                    Readiness::Skip(reason) => {
                        self.skip(step, &reason).await;
                        progressed = true;
                    }
                    Readiness::Ready => {
                        self.dispatched.insert(step.id.as_str());
                        let child = StepContext {
                            variables: self.vars.clone(),
                            cancel: self.cancel.clone(),
                            force: self.force.clone(),
                            ..self.ctx.clone()
                        };
                        let executor = self.executor;
                        running.push(Box::pin(async move {
                            let result = executor.execute(step, child).await;
                            (step, result)
                        }));
                    }
                }
            }
            if !progressed || self.halt.is_some() {
                break;
            }
        }
    }

    async fn skip(&mut self, step: &'a StepDef, reason: &str) {
        let key = self.ctx.key(&step.id);
        let mut result = StepResult::pending(&key);
        result.parent = self.ctx.parent.clone();
        if result.skip(reason).is_ok() {
            tracing::debug!("[Engine] Skipping '{}': {}", key, reason);
            if let Err(e) = self.ctx.observer.step_updated(&key, step, &result).await {
                tracing::error!("[Engine] Skip of '{}' not recorded: {}", key, e);
                result.error = Some(e.to_string());
                result.error_kind = Some(e.kind().to_string());
                self.halt.get_or_insert(Halt::Failed(step.id.clone()));
            }
        }
        self.results.insert(step.id.clone(), result);
    }

    async fn record(&mut self, step: &'a StepDef, result: StepResult) {
        match result.status {
            StepStatus::Completed => {
                let output = result.output.clone().unwrap_or(Value::Null);
                match &step.kind {
                    StepKind::Condition(_) => {
                        let gate = output.get("result").and_then(Value::as_bool).unwrap_or(false);
                        self.gates.insert(step.id.as_str(), gate);
                    }
                    StepKind::Parallel(c) => {
                        for branch in &c.branches {
                            if let Some(value) = output.get(&branch.id) {
                                self.bind(step, &branch.id, value.clone()).await;
                            }
                        }
                    }
                    _ => {}
                }
                self.bind(step, &step.id, output).await;
            }
            StepStatus::Failed => {
                let audit_failed = result.error_kind.as_deref() == Some("audit_error");
                let halts = match self.mode {
                    FailureMode::PerStep => step.on_failure == OnFailure::Abort,
                    FailureMode::FailFast => true,
                    FailureMode::BestEffort => false,
                };
                if (halts || audit_failed) && self.halt.is_none() {
                    tracing::info!(
                        "[Engine] Step '{}' failed, halting its group",
                        self.ctx.key(&step.id)
                    );
                    self.halt = Some(Halt::Failed(step.id.clone()));
                }
            }
            _ => {}
        }
        self.results.insert(step.id.clone(), result);
    }

    async fn bind(&mut self, step: &'a StepDef, name: &str, output: Value) {
        if !bind_output(&mut self.vars, name, output.clone()) {
            tracing::warn!("[Engine] Variable '{}' already bound, keeping first value", name);
            return;
        }
        if self.ctx.parent.is_none() {
            if let Err(e) = self.ctx.observer.output_bound(name, &output).await {
                tracing::error!("[Engine] Output of '{}' not recorded: {}", name, e);
                self.halt.get_or_insert(Halt::Failed(step.id.clone()));
            }
        }
    }

    /// Stop in-flight steps: cancel, then force after the grace period.
    async fn drain(&mut self, running: &mut Running<'a>) {
        self.cancel.cancel();
        let grace = tokio::time::sleep(self.executor.config().cancel_grace_period());
        tokio::pin!(grace);
        let mut forced = false;
        while !running.is_empty() {
            tokio::select! {
                Some((step, result)) = running.next() => self.record(step, result).await,
                _ = &mut grace, if !forced => {
                    tracing::warn!(
                        "[Engine] {} step(s) still running after grace period, forcing",
                        running.len()
                    );
                    forced = true;
                    self.force.cancel();
                }
            }
        }
    }

    async fn cancel_remaining(&mut self) {
        let reason = self
            .halt
            .as_ref()
            .map(Halt::reason)
            .unwrap_or_else(|| "unreachable".to_string());
        for step in self.steps {
            if self.results.contains_key(&step.id) {
                continue;
            }
            let key = self.ctx.key(&step.id);
            let mut result = StepResult::pending(&key);
            result.parent = self.ctx.parent.clone();
            if result.cancel(&reason).is_ok() {
                if let Err(e) = self.ctx.observer.step_updated(&key, step, &result).await {
                    tracing::error!("[Engine] Cancellation of '{}' not recorded: {}", key, e);
                }
            }
            self.results.insert(step.id.clone(), result);
        }
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
