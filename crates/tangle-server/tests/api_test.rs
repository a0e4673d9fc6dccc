//! HTTP API tests.
//!
//! Each test starts a real server on an ephemeral port with in-memory
//! state and drives it over HTTP.

use std::net::SocketAddr;

use serde_json::{json, Value};
use tangle_server::{create_app_state, start_server_with_state, ServerConfig};

async fn spawn_server() -> SocketAddr {
    let config = ServerConfig {
        port: 0,
        ..Default::default()
    };
    let state = create_app_state(&config).await.expect("state");
    start_server_with_state(config, state).await.expect("server")
}

fn url(addr: SocketAddr, path: &str) -> String {
    format!("http://{}{}", addr, path)
}

const ECHO_WORKFLOW: &str = r#"
name: greet
steps:
  - id: hello
    type: agent_task
    config:
      agent_type: echo
      agent_config: { reply: '{"greeting": "hi"}' }
      prompt: "say hi to {{name}}"
  - id: shout
    type: transform
    depends_on: [hello]
    config: { function: uppercase, input: "{{hello.output.data.greeting}}" }
"#;

#[tokio::test]
async fn test_register_and_run_workflow() {
    let addr = spawn_server().await;
    let client = reqwest::Client::new();

    let registered: Value = client
        .post(url(addr, "/api/workflows"))
        .json(&json!({ "yaml": ECHO_WORKFLOW }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let workflow_id = registered["id"].as_str().unwrap().to_string();
    assert_eq!(registered["name"], "greet");

    let listed: Value = client
        .get(url(addr, "/api/workflows"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["workflows"].as_array().unwrap().len(), 1);

    let started: Value = client
        .post(url(addr, "/api/executions"))
        .json(&json!({ "workflow_id": workflow_id, "input": { "name": "ada" } }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let execution_id = started["execution_id"].as_str().unwrap();

    let finished: Value = client
        .get(url(addr, &format!("/api/executions/{}/wait?timeout_ms=5000", execution_id)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(finished["status"], "completed");

    let audit: Value = client
        .get(url(
            addr,
            &format!("/api/audit?target_type=execution&target_id={}", execution_id),
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let actions: Vec<&str> = audit["events"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["action"].as_str())
        .collect();
    assert!(actions.contains(&"execution.started"));
    assert!(actions.contains(&"execution.completed"));
}

#[tokio::test]
async fn test_invalid_workflow_is_bad_request() {
    let addr = spawn_server().await;
    let client = reqwest::Client::new();

    let cyclic = r#"
name: loop
steps:
  - id: a
    type: transform
    depends_on: [b]
    config: { function: identity, input: 1 }
  - id: b
    type: transform
    depends_on: [a]
    config: { function: identity, input: 1 }
"#;
    let response = client
        .post(url(addr, "/api/workflows"))
        .json(&json!({ "yaml": cyclic }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    let response = client
        .get(url(addr, "/api/executions/does-not-exist"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_agent_and_entanglement_lifecycle() {
    let addr = spawn_server().await;
    let client = reqwest::Client::new();

    let mut ids = Vec::new();
    for name in ["planner", "builder"] {
        let spawned: Value = client
            .post(url(addr, "/api/agents"))
            .json(&json!({ "agent_type": "echo", "name": name }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        ids.push(spawned["agent_id"].as_str().unwrap().to_string());
    }

    let reply: Value = client
        .post(url(addr, &format!("/api/agents/{}/invoke", ids[0])))
        .json(&json!({ "prompt": "ping" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(reply["content"].is_string());

    let created: Value = client
        .post(url(addr, "/api/entanglements"))
        .json(&json!({ "agent_ids": ids, "mode": "merge" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let eid = created["entanglement_id"].as_str().unwrap().to_string();

    let updated: Value = client
        .post(url(addr, &format!("/api/entanglements/{}/update", eid)))
        .json(&json!({ "agent_id": ids[0], "patch": { "plan": { "steps": 3 } } }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(updated["shared_state"]["plan"]["steps"], 3);

    let read: Value = client
        .get(url(
            addr,
            &format!("/api/entanglements/{}/state?agent_id={}", eid, ids[1]),
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(read["shared_state"]["plan"]["steps"], 3);

    let response = client
        .post(url(addr, &format!("/api/entanglements/{}/dissolve", eid)))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let response = client
        .post(url(addr, &format!("/api/agents/{}/terminate?reason=done", ids[1])))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let agent: Value = client
        .get(url(addr, &format!("/api/agents/{}", ids[1])))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(agent["status"], "terminated");
}

#[tokio::test]
async fn test_health_reports_idle() {
    let addr = spawn_server().await;
    let health: Value = reqwest::get(url(addr, "/api/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status_id"], 1);
    assert_eq!(health["workflow_state"], "idle");
    assert_eq!(health["agent_name"], "tangle");
    assert!(health["system_resources"]["memory_total_mb"].is_number());
}

#[tokio::test]
async fn test_unknown_event_kind_rejected() {
    let addr = spawn_server().await;
    let response = reqwest::get(url(addr, "/api/events?kinds=bogus")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}
