//! End-to-end engine scenarios with in-memory collaborators.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use tangle_core::audit::{AuditQuery, AuditSink, MemoryAuditSink};
use tangle_core::models::{CoordinationMode, Execution, ExecutionStatus, SpawnRequest, StepStatus, TargetType, Variables};
use tangle_core::workflow::{HttpClient, HttpRequest, HttpResponse};
use tangle_core::{AppStateInner, CoreConfig, CoreError, CoreResult, StartOptions, StateBuilder, Workflow};

struct FailingHttp {
    calls: AtomicU32,
}

#[async_trait]
impl HttpClient for FailingHttp {
    async fn send(&self, _request: HttpRequest) -> CoreResult<HttpResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(HttpResponse {
            status: 500,
            headers: Default::default(),
            body: Value::String("boom".into()),
        })
    }
}

async fn state_with(config: CoreConfig) -> (AppStateInner, Arc<MemoryAuditSink>, Arc<FailingHttp>) {
    let sink = Arc::new(MemoryAuditSink::new());
    let http = Arc::new(FailingHttp { calls: AtomicU32::new(0) });
    let state = StateBuilder::new(config)
        .audit_sink(sink.clone())
        .http_client(http.clone())
        .build()
        .await;
    (state, sink, http)
}

async fn state() -> AppStateInner {
    state_with(CoreConfig::default()).await.0
}

fn vars(value: Value) -> Variables {
    value.as_object().cloned().unwrap_or_default()
}

async fn wait_until(state: &AppStateInner, id: &str, check: impl Fn(&Execution) -> bool) -> Execution {
    for _ in 0..300 {
        let e = state.engine.get_status(id).await.unwrap();
        if check(&e) {
            return e;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached for execution {}", id);
}

const DIAMOND: &str = r#"
name: diamond
steps:
  - id: A
    type: transform
    config: { function: { name: multiply, factor: 2 }, input: "{{x}}" }
  - id: B
    type: transform
    depends_on: [A]
    config: { function: { name: multiply, factor: 2 }, input: "{{A.output}}" }
  - id: C
    type: transform
    depends_on: [A]
    config: { function: { name: multiply, factor: 2 }, input: "{{A.output}}" }
  - id: D
    type: transform
    depends_on: [B, C]
    config: { function: sum, input: ["{{B.output}}", "{{C.output}}"] }
"#;

#[tokio::test]
async fn diamond_doubles_and_combines() {
    let state = state().await;
    let wf = Workflow::from_yaml(DIAMOND).unwrap();
    let id = state
        .engine
        .start(wf, vars(json!({"x": 1})), StartOptions::default())
        .await
        .unwrap();
    let e = state.engine.wait_for(&id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(e.status, ExecutionStatus::Completed, "{:?}", e.error);
    assert_eq!(e.variables["A"]["output"], 2);
    assert_eq!(e.variables["B"]["output"], 4);
    assert_eq!(e.variables["C"]["output"], 4);
    assert_eq!(e.variables["D"]["output"], 8);
    assert_eq!(e.steps_completed(), 4);

    let d = &e.step_results["D"];
    let b = &e.step_results["B"];
    let c = &e.step_results["C"];
    assert!(d.started_at.unwrap() >= b.finished_at.unwrap());
    assert!(d.started_at.unwrap() >= c.finished_at.unwrap());
}

#[tokio::test]
async fn cycle_is_rejected_without_an_execution() {
    let state = state().await;
    let wf = Workflow::from_yaml(
        r#"
name: loopy
steps:
  - id: a
    type: transform
    depends_on: [b]
    config: { function: identity, input: 1 }
  - id: b
    type: transform
    depends_on: [a]
    config: { function: identity, input: 1 }
"#,
    )
    .unwrap();
    let wf_id = wf.id.clone();
    let err = state
        .engine
        .start(wf, Variables::new(), StartOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(ref m) if m.contains("cycle")), "{}", err);
    assert!(state.engine.list_executions(Some(&wf_id)).await.unwrap().is_empty());
}

#[tokio::test]
async fn failing_step_is_attempted_exactly_max_attempts_times() {
    let (state, sink, http) = state_with(CoreConfig::default()).await;
    let wf = Workflow::from_yaml(
        r#"
name: flaky
steps:
  - id: call
    type: api_call
    retry: { max_attempts: 3, backoff: { strategy: none } }
    config: { url: "http://svc.test/items", method: post, body: { q: "{{q}}" } }
"#,
    )
    .unwrap();
    let id = state
        .engine
        .start(wf, vars(json!({"q": "all"})), StartOptions::default())
        .await
        .unwrap();
    let e = state.engine.wait_for(&id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(e.status, ExecutionStatus::Failed);
    let call = &e.step_results["call"];
    assert_eq!(call.status, StepStatus::Failed);
    assert_eq!(call.attempts, 3);
    assert!(call.error.as_deref().unwrap().contains("HTTP 500"));
    assert_eq!(http.calls.load(Ordering::SeqCst), 3);

    let retries = sink
        .query(&AuditQuery {
            action: Some("step.retrying".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(retries.len(), 2);
}

#[tokio::test]
async fn spawn_at_capacity_fails_and_leaves_count_unchanged() {
    let config = CoreConfig {
        max_concurrent_agents: 2,
        ..CoreConfig::default()
    };
    let (state, _, _) = state_with(config).await;
    state.agents.spawn(SpawnRequest::new("echo")).await.unwrap();
    state.agents.spawn(SpawnRequest::new("echo")).await.unwrap();

    let err = state.agents.spawn(SpawnRequest::new("echo")).await.unwrap_err();
    assert!(matches!(err, CoreError::AgentSpawn(_)));
    assert_eq!(state.agents.active_count().await, 2);
}

#[tokio::test]
async fn merge_mode_unions_disjoint_keys_and_flags_scalar_collisions() {
    let state = state().await;
    let a = state.agents.spawn(SpawnRequest::new("echo")).await.unwrap();
    let b = state.agents.spawn(SpawnRequest::new("echo")).await.unwrap();
    let coord = &state.entanglements;
    let eid = coord
        .create(Some("pair".into()), &[a.clone(), b.clone()], CoordinationMode::Merge)
        .await
        .unwrap();
    coord.read_as(&eid, &a).await.unwrap();
    coord.read_as(&eid, &b).await.unwrap();

    let (ra, rb) = tokio::join!(
        coord.update(&eid, &a, json!({"plan": {"owner": "a"}, "notes": ["x"]})),
        coord.update(&eid, &b, json!({"plan": {"due": "fri"}, "notes": ["y"]})),
    );
    ra.unwrap();
    rb.unwrap();
    let shared = coord.read(&eid).await.unwrap();
    assert_eq!(shared["plan"], json!({"owner": "a", "due": "fri"}));
    assert_eq!(shared["notes"].as_array().unwrap().len(), 2);

    coord.read_as(&eid, &a).await.unwrap();
    coord.read_as(&eid, &b).await.unwrap();
    let (ra, rb) = tokio::join!(
        coord.update(&eid, &a, json!({"status": "green"})),
        coord.update(&eid, &b, json!({"status": "red"})),
    );
    let conflicts = [&ra, &rb]
        .iter()
        .filter(|r| matches!(r, Err(CoreError::EntanglementConflict { .. })))
        .count();
    assert!(conflicts >= 1, "{:?} / {:?}", ra, rb);
}

#[tokio::test]
async fn cancel_stops_dispatch_of_pending_steps() {
    let state = state().await;
    let wf = Workflow::from_yaml(
        r#"
name: long
steps:
  - id: nap
    type: wait
    config: { duration_ms: 60000 }
  - id: after
    type: transform
    depends_on: [nap]
    config: { function: identity, input: 1 }
"#,
    )
    .unwrap();
    let id = state
        .engine
        .start(wf, Variables::new(), StartOptions::default())
        .await
        .unwrap();
    wait_until(&state, &id, |e| e.step_results["nap"].status == StepStatus::Running).await;

    state.engine.cancel(&id, Some("ops")).await.unwrap();
    assert_eq!(state.engine.get_status(&id).await.unwrap().status, ExecutionStatus::Cancelled);
    // Idempotent.
    state.engine.cancel(&id, Some("ops")).await.unwrap();

    let e = state.engine.wait_for(&id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(e.status, ExecutionStatus::Cancelled);
    assert_eq!(e.step_results["nap"].status, StepStatus::Cancelled);
    let after = &e.step_results["after"];
    assert_eq!(after.status, StepStatus::Cancelled);
    assert_eq!(after.attempts, 0);
    assert!(after.started_at.is_none());
}

#[tokio::test]
async fn pause_holds_dispatch_and_signal_releases_wait() {
    let state = state().await;
    let wf = Workflow::from_yaml(
        r#"
name: approval
steps:
  - id: gate
    type: wait
    config: { signal: approved }
  - id: announce
    type: transform
    depends_on: [gate]
    config: { function: uppercase, input: "{{gate.output.payload.by}}" }
"#,
    )
    .unwrap();
    let id = state
        .engine
        .start(wf, Variables::new(), StartOptions::default())
        .await
        .unwrap();
    wait_until(&state, &id, |e| e.step_results["gate"].status == StepStatus::Running).await;
    for _ in 0..100 {
        if !state.engine.stats().await.blockers.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let blockers = state.engine.stats().await.blockers;
    assert_eq!(blockers[0].step_id.as_deref(), Some("gate"));

    state.engine.pause(&id, None).await.unwrap();
    state.engine.signal(&id, "approved", json!({"by": "ops"}), None).await.unwrap();
    let e = wait_until(&state, &id, |e| e.step_results["gate"].status == StepStatus::Completed).await;
    assert_eq!(e.status, ExecutionStatus::Paused);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        state.engine.get_status(&id).await.unwrap().step_results["announce"].status,
        StepStatus::Pending
    );

    state.engine.resume(&id, None).await.unwrap();
    let e = state.engine.wait_for(&id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(e.status, ExecutionStatus::Completed, "{:?}", e.error);
    assert_eq!(e.variables["announce"]["output"], "OPS");
}

#[tokio::test]
async fn loop_results_are_recorded_per_iteration() {
    let state = state().await;
    let wf = Workflow::from_yaml(
        r#"
name: each
steps:
  - id: each
    type: loop
    config:
      over: "{{names}}"
      item_var: name
      body:
        - id: shout
          type: transform
          config: { function: uppercase, input: "{{name}}" }
  - id: joined
    type: transform
    depends_on: [each]
    config: { function: { name: concat, separator: "," }, input: ["{{each.output.0.shout}}", "{{each.output.1.shout}}"] }
"#,
    )
    .unwrap();
    let id = state
        .engine
        .start(wf, vars(json!({"names": "ada, bob"})), StartOptions::default())
        .await
        .unwrap();
    let e = state.engine.wait_for(&id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(e.status, ExecutionStatus::Completed, "{:?}", e.error);
    assert_eq!(e.variables["joined"]["output"], "ADA,BOB");
    let nested = &e.step_results["each[1]/shout"];
    assert_eq!(nested.status, StepStatus::Completed);
    assert_eq!(nested.parent.as_deref(), Some("each"));
    assert_eq!(e.steps_completed(), 2);
}

#[tokio::test]
async fn workflow_timeout_fails_execution() {
    let config = CoreConfig {
        workflow_timeout_secs: 1,
        cancel_grace_period_ms: 100,
        ..CoreConfig::default()
    };
    let (state, _, _) = state_with(config).await;
    let wf = Workflow::from_yaml(
        "name: slow\nsteps:\n  - id: nap\n    type: wait\n    config: {duration_ms: 60000}\n",
    )
    .unwrap();
    let id = state
        .engine
        .start(wf, Variables::new(), StartOptions::default())
        .await
        .unwrap();
    let e = state.engine.wait_for(&id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(e.status, ExecutionStatus::Failed);
    assert_eq!(e.error.as_deref(), Some("workflow timed out"));
    assert!(e.step_results["nap"].has_error());
}

#[tokio::test]
async fn audit_failure_refuses_to_start() {
    let (state, sink, _) = state_with(CoreConfig::default()).await;
    sink.set_failing(true);
    let wf = Workflow::from_yaml(DIAMOND).unwrap();
    let err = state
        .engine
        .start(wf, vars(json!({"x": 1})), StartOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Audit(_)));

    sink.set_failing(false);
    let started = sink
        .query(&AuditQuery {
            target_type: Some(TargetType::Execution),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(started.is_empty());
}
