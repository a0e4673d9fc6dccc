use chrono::Utc;
use rusqlite::OptionalExtension;

use crate::db::Database;
use crate::error::{CoreError, CoreResult};
use crate::workflow::schema::Workflow;

/// Registered workflow definitions, stored as JSON.
#[derive(Clone)]
pub struct WorkflowStore {
    db: Database,
}

impl WorkflowStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn save(&self, workflow: &Workflow) -> CoreResult<()> {
        let definition = serde_json::to_string(workflow)?;
        let id = workflow.id.clone();
        let name = workflow.name.clone();
        let version = workflow.version.clone();
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO workflows (id, name, version, definition, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                     ON CONFLICT(id) DO UPDATE SET
                       name = excluded.name,
                       version = excluded.version,
                       definition = excluded.definition,
                       updated_at = excluded.updated_at",
                    rusqlite::params![id, name, version, definition, now],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, workflow_id: &str) -> CoreResult<Option<Workflow>> {
        let id = workflow_id.to_string();
        let definition: Option<String> = self
            .db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT definition FROM workflows WHERE id = ?1",
                    rusqlite::params![id],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;
        definition.map(|d| parse(&d)).transpose()
    }

    pub async fn list(&self) -> CoreResult<Vec<Workflow>> {
        let definitions: Vec<String> = self
            .db
            .with_conn_async(|conn| {
                let mut stmt = conn.prepare("SELECT definition FROM workflows ORDER BY created_at ASC")?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(rows)
            })
            .await?;
        definitions.iter().map(|d| parse(d)).collect()
    }
}

fn parse(definition: &str) -> CoreResult<Workflow> {
    serde_json::from_str(definition)
        .map_err(|e| CoreError::Database(format!("Corrupt workflow definition: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_definition() {
        let store = WorkflowStore::new(Database::open_in_memory().unwrap());
        let wf = Workflow::from_yaml(
            "id: wf-1\nname: w\nsteps:\n  - id: t\n    type: transform\n    config: {function: trim, input: ' a '}\n",
        )
        .unwrap();
        store.save(&wf).await.unwrap();
        let loaded = store.get("wf-1").await.unwrap().unwrap();
        assert_eq!(loaded.steps, wf.steps);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
