//! `tangle workflow` - Run and validate workflow definitions.

use std::time::Duration;

use tangle_core::events::{Event, EventKind};
use tangle_core::models::{Execution, ExecutionStatus, Variables};
use tangle_core::workflow::validate_workflow;
use tangle_core::{AppState, StartOptions, Workflow};

use super::print_json;

/// Parse `--input` as a JSON object of execution variables.
pub fn parse_input(input: Option<&str>) -> Result<Variables, String> {
    let Some(raw) = input else {
        return Ok(Variables::new());
    };
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err("--input must be a JSON object".to_string()),
        Err(e) => Err(format!("Invalid --input JSON: {}", e)),
    }
}

/// Start the workflow in `workflow_file` and wait for it to finish.
pub async fn execute(
    state: &AppState,
    workflow_file: &str,
    input: Variables,
    user_id: Option<String>,
) -> Result<Execution, String> {
    let workflow = Workflow::from_file(workflow_file).map_err(|e| e.to_string())?;
    let execution_id = state
        .engine
        .start(workflow, input, StartOptions { user_id })
        .await
        .map_err(|e| e.to_string())?;

    let limit = state.config.workflow_timeout()
        + state.config.cancel_grace_period()
        + Duration::from_secs(5);
    state
        .engine
        .wait_for(&execution_id, limit)
        .await
        .map_err(|e| e.to_string())
}

/// Run a workflow from a YAML file, printing step progress.
pub async fn run(
    state: &AppState,
    workflow_file: &str,
    input: Option<&str>,
    user_id: Option<String>,
) -> Result<(), String> {
    // API keys for agent providers
    load_dotenv();

    let input = parse_input(input)?;

    let subscription = state
        .notifier
        .subscribe_filtered(Some(&[EventKind::Step][..]));
    let progress = tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            if let Event::Step(step) = event {
                match step.error {
                    Some(ref error) => println!(
                        "   [{}] {} (attempt {}): {}",
                        step.status, step.step_id, step.attempt, error
                    ),
                    None => println!("   [{}] {}", step.status, step.step_id),
                }
            }
        }
    });

    println!("Running workflow: {}", workflow_file);
    let result = execute(state, workflow_file, input, user_id).await;
    progress.abort();
    let execution = result?;

    println!();
    let outputs: serde_json::Map<String, serde_json::Value> = execution
        .step_results
        .iter()
        .filter(|(_, r)| r.parent.is_none())
        .filter_map(|(key, r)| r.output.clone().map(|o| (key.clone(), o)))
        .collect();
    print_json(&serde_json::json!({
        "execution_id": execution.id,
        "status": execution.status,
        "outputs": outputs,
    }));

    if execution.status == ExecutionStatus::Completed {
        println!("\nWorkflow '{}' completed", execution.workflow_name);
        Ok(())
    } else {
        let failed: Vec<&str> = execution
            .step_results
            .iter()
            .filter(|(_, r)| r.parent.is_none() && r.error.is_some())
            .map(|(key, _)| key.as_str())
            .collect();
        Err(format!(
            "Workflow {} ({}). Failed steps: {}",
            execution.status.as_str(),
            execution.error.as_deref().unwrap_or("no error recorded"),
            if failed.is_empty() { "none".to_string() } else { failed.join(", ") }
        ))
    }
}

/// Validate a workflow YAML file without executing it.
pub fn validate(workflow_file: &str) -> Result<(), String> {
    let workflow = Workflow::from_file(workflow_file).map_err(|e| e.to_string())?;
    validate_workflow(&workflow).map_err(|e| e.to_string())?;

    println!("Workflow '{}' is valid", workflow.name);
    println!("   Version: {}", workflow.version);
    println!("   Steps: {}", workflow.total_steps());

    for (i, step) in workflow.steps.iter().enumerate() {
        if step.depends_on.is_empty() {
            println!("   {}. {} ({})", i + 1, step.display_name(), step.step_type());
        } else {
            println!(
                "   {}. {} ({}) after {}",
                i + 1,
                step.display_name(),
                step.step_type(),
                step.depends_on.join(", ")
            );
        }
    }

    Ok(())
}

/// Load .env and .env.local files for environment variables.
fn load_dotenv() {
    // .env.local first, then .env; existing variables win
    for filename in &[".env.local", ".env"] {
        let path = std::path::Path::new(filename);
        let Ok(content) = std::fs::read_to_string(path) else {
            continue;
        };
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            if std::env::var(key).is_err() {
                std::env::set_var(key, value);
            }
        }
        tracing::info!("[Workflow] Loaded environment from '{}'", filename);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input() {
        assert!(parse_input(None).unwrap().is_empty());
        let vars = parse_input(Some(r#"{"x": 3}"#)).unwrap();
        assert_eq!(vars["x"], 3);
        assert!(parse_input(Some("[1, 2]")).is_err());
        assert!(parse_input(Some("{nope")).is_err());
    }
}
