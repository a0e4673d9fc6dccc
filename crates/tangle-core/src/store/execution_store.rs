use rusqlite::{OptionalExtension, Row};

use super::from_millis;
use crate::db::Database;
use crate::error::CoreResult;
use crate::models::execution::{Execution, ExecutionStatus};

const COLUMNS: &str = "id, workflow_id, workflow_name, status, user_id, variables, step_results, \
                       error, total_steps, created_at, started_at, finished_at";

/// Execution snapshots; variables and step results as JSON blobs.
#[derive(Clone)]
pub struct ExecutionStore {
    db: Database,
}

impl ExecutionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn save(&self, execution: &Execution) -> CoreResult<()> {
        let variables = serde_json::to_string(&execution.variables)?;
        let step_results = serde_json::to_string(&execution.step_results)?;
        let e = execution.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO executions (id, workflow_id, workflow_name, status, user_id, variables, step_results,
                                             error, total_steps, created_at, started_at, finished_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                     ON CONFLICT(id) DO UPDATE SET
                       status = excluded.status,
                       variables = excluded.variables,
                       step_results = excluded.step_results,
                       error = excluded.error,
                       started_at = excluded.started_at,
                       finished_at = excluded.finished_at",
                    rusqlite::params![
                        e.id,
                        e.workflow_id,
                        e.workflow_name,
                        e.status.as_str(),
                        e.user_id,
                        variables,
                        step_results,
                        e.error,
                        e.total_steps as i64,
                        e.created_at.timestamp_millis(),
                        e.started_at.map(|t| t.timestamp_millis()),
                        e.finished_at.map(|t| t.timestamp_millis()),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, execution_id: &str) -> CoreResult<Option<Execution>> {
        let id = execution_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("SELECT {} FROM executions WHERE id = ?1", COLUMNS))?;
                stmt.query_row(rusqlite::params![id], |row| Ok(row_to_execution(row)))
                    .optional()
            })
            .await
    }

    pub async fn list_by_workflow(&self, workflow_id: &str) -> CoreResult<Vec<Execution>> {
        let wf_id = workflow_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM executions WHERE workflow_id = ?1 ORDER BY created_at DESC",
                    COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![wf_id], |row| Ok(row_to_execution(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn list_all(&self) -> CoreResult<Vec<Execution>> {
        self.db
            .with_conn_async(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM executions ORDER BY created_at DESC",
                    COLUMNS
                ))?;
                let rows = stmt
                    .query_map([], |row| Ok(row_to_execution(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn list_by_status(&self, status: ExecutionStatus) -> CoreResult<Vec<Execution>> {
        let status_str = status.as_str().to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM executions WHERE status = ?1 ORDER BY created_at DESC",
                    COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![status_str], |row| Ok(row_to_execution(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

fn row_to_execution(row: &Row<'_>) -> Execution {
    let variables: String = row.get(5).unwrap_or_default();
    let step_results: String = row.get(6).unwrap_or_default();
    let started: Option<i64> = row.get(10).unwrap_or(None);
    let finished: Option<i64> = row.get(11).unwrap_or(None);

    Execution {
        id: row.get(0).unwrap_or_default(),
        workflow_id: row.get(1).unwrap_or_default(),
        workflow_name: row.get(2).unwrap_or_default(),
        status: ExecutionStatus::from_str(&row.get::<_, String>(3).unwrap_or_default())
            .unwrap_or(ExecutionStatus::Failed),
        user_id: row.get(4).unwrap_or(None),
        variables: serde_json::from_str(&variables).unwrap_or_default(),
        step_results: serde_json::from_str(&step_results).unwrap_or_default(),
        error: row.get(7).unwrap_or(None),
        total_steps: row.get::<_, i64>(8).unwrap_or(0) as usize,
        created_at: from_millis(row.get(9).unwrap_or(0)),
        started_at: started.map(from_millis),
        finished_at: finished.map(from_millis),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::execution::{StepResult, Variables};
    use crate::workflow::schema::Workflow;
    use serde_json::json;

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let store = ExecutionStore::new(Database::open_in_memory().unwrap());
        let wf = Workflow::from_yaml(
            "name: w\nsteps:\n  - id: a\n    type: wait\n    config: {duration_ms: 1}\n",
        )
        .unwrap();
        let mut input = Variables::new();
        input.insert("x".into(), json!(1));
        let mut exec = Execution::new(&wf, input, Some("u1".into()));
        exec.status = ExecutionStatus::Running;
        let mut result = StepResult::pending("a");
        result.begin_attempt(1).unwrap();
        exec.step_results.insert("a".into(), result.clone());
        store.save(&exec).await.unwrap();

        result.complete(json!({"waited_ms": 1})).unwrap();
        exec.step_results.insert("a".into(), result);
        exec.bind_output("a", json!({"waited_ms": 1}));
        exec.status = ExecutionStatus::Completed;
        store.save(&exec).await.unwrap();

        let loaded = store.get(&exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
        assert_eq!(loaded.variables["a"]["output"]["waited_ms"], json!(1));
        assert_eq!(loaded.step_results["a"].attempts, 1);
        assert_eq!(loaded.user_id.as_deref(), Some("u1"));
        assert_eq!(store.list_by_workflow(&wf.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_all_spans_workflows() {
        let store = ExecutionStore::new(Database::open_in_memory().unwrap());
        for name in ["first", "second"] {
            let wf = Workflow::from_yaml(&format!(
                "name: {}\nsteps:\n  - id: a\n    type: wait\n    config: {{duration_ms: 1}}\n",
                name
            ))
            .unwrap();
            store.save(&Execution::new(&wf, Variables::new(), None)).await.unwrap();
        }

        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 2);
        let mut names: Vec<&str> = all.iter().map(|e| e.workflow_name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["first", "second"]);
    }
}
