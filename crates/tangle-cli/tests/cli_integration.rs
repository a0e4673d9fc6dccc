//! Integration tests for the tangle-cli commands.
//!
//! These exercise the same code paths as the binary, with in-memory
//! state or a temporary SQLite database.

use std::io::Write;

use tangle_cli::commands::{self, workflow, StateOptions};
use tangle_core::models::ExecutionStatus;

fn workflow_file(yaml: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .expect("temp file");
    file.write_all(yaml.as_bytes()).expect("write workflow");
    file
}

const PIPELINE: &str = r#"
name: pipeline
steps:
  - id: double
    type: transform
    config: { function: { name: multiply, factor: 2 }, input: "{{x}}" }
  - id: big
    type: condition
    depends_on: [double]
    config: { expression: "double.output > 5", else_steps: [small_note] }
  - id: big_note
    type: notification
    depends_on: [big]
    config: { message: "big: {{double.output}}" }
  - id: small_note
    type: notification
    depends_on: [big]
    config: { message: "small: {{double.output}}" }
"#;

#[tokio::test]
async fn test_execute_workflow_file() {
    let file = workflow_file(PIPELINE);
    let state = commands::init_state(&StateOptions::default()).await.unwrap();

    let input = workflow::parse_input(Some(r#"{"x": 4}"#)).unwrap();
    let execution = workflow::execute(&state, file.path().to_str().unwrap(), input, None)
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.step_results["double"].output, Some(serde_json::json!(8)));
    assert!(execution.step_results["big_note"].output.is_some());
    let small_note = &execution.step_results["small_note"];
    assert!(small_note.output.is_none());
    assert!(small_note.skip_reason.is_some());
    state.shutdown().await;
}

#[tokio::test]
async fn test_run_persists_to_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("tangle.db");
    let options = StateOptions {
        db_path: Some(db_path.to_string_lossy().to_string()),
        ..Default::default()
    };
    let file = workflow_file(PIPELINE);

    let state = commands::init_state(&options).await.unwrap();
    workflow::run(&state, file.path().to_str().unwrap(), Some(r#"{"x": 1}"#), None)
        .await
        .unwrap();
    state.shutdown().await;

    // A second process sees the finished execution
    let reopened = commands::init_state(&options).await.unwrap();
    let executions = reopened.engine.list_executions(None).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_validate_rejects_unknown_dependency() {
    let file = workflow_file(
        r#"
name: broken
steps:
  - id: a
    type: transform
    depends_on: [missing]
    config: { function: identity, input: 1 }
"#,
    );
    let err = workflow::validate(file.path().to_str().unwrap()).unwrap_err();
    assert!(err.contains("missing"), "unexpected error: {}", err);

    let ok = workflow_file(PIPELINE);
    assert!(workflow::validate(ok.path().to_str().unwrap()).is_ok());
}

#[tokio::test]
async fn test_run_reports_failure() {
    let file = workflow_file(
        r#"
name: failing
steps:
  - id: shout
    type: transform
    config: { function: uppercase, input: 42 }
"#,
    );
    let state = commands::init_state(&StateOptions::default()).await.unwrap();
    let err = workflow::run(&state, file.path().to_str().unwrap(), None, None)
        .await
        .unwrap_err();
    assert!(err.contains("failed"), "unexpected error: {}", err);
    assert!(err.contains("shout"));
}
