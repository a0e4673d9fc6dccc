use rusqlite::{OptionalExtension, Row};

use super::from_millis;
use crate::db::Database;
use crate::error::CoreResult;
use crate::models::agent::{Agent, AgentStatus};

const COLUMNS: &str = "id, name, agent_type, status, execution_id, user_id, capabilities, config, \
                       last_error, termination_reason, created_at, updated_at, last_active_at";

#[derive(Clone)]
pub struct AgentStore {
    db: Database,
}

impl AgentStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn save(&self, agent: &Agent) -> CoreResult<()> {
        let a = agent.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO agents (id, name, agent_type, status, execution_id, user_id, capabilities, config,
                                         last_error, termination_reason, created_at, updated_at, last_active_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                     ON CONFLICT(id) DO UPDATE SET
                       name = excluded.name,
                       status = excluded.status,
                       capabilities = excluded.capabilities,
                       config = excluded.config,
                       last_error = excluded.last_error,
                       termination_reason = excluded.termination_reason,
                       updated_at = excluded.updated_at,
                       last_active_at = excluded.last_active_at",
                    rusqlite::params![
                        a.id,
                        a.name,
                        a.agent_type,
                        a.status.as_str(),
                        a.execution_id,
                        a.user_id,
                        serde_json::to_string(&a.capabilities).unwrap_or_default(),
                        serde_json::to_string(&a.config).unwrap_or_default(),
                        a.last_error,
                        a.termination_reason,
                        a.created_at.timestamp_millis(),
                        a.updated_at.timestamp_millis(),
                        a.last_active_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, agent_id: &str) -> CoreResult<Option<Agent>> {
        let id = agent_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("SELECT {} FROM agents WHERE id = ?1", COLUMNS))?;
                stmt.query_row(rusqlite::params![id], |row| Ok(row_to_agent(row)))
                    .optional()
            })
            .await
    }

    pub async fn list_by_status(&self, status: AgentStatus) -> CoreResult<Vec<Agent>> {
        let status_str = status.as_str().to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM agents WHERE status = ?1 ORDER BY created_at DESC",
                    COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![status_str], |row| Ok(row_to_agent(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn list_by_execution(&self, execution_id: &str) -> CoreResult<Vec<Agent>> {
        let exec_id = execution_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM agents WHERE execution_id = ?1 ORDER BY created_at DESC",
                    COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![exec_id], |row| Ok(row_to_agent(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

fn row_to_agent(row: &Row<'_>) -> Agent {
    let capabilities: String = row.get(6).unwrap_or_default();
    let config: String = row.get(7).unwrap_or_default();

    Agent {
        id: row.get(0).unwrap_or_default(),
        name: row.get(1).unwrap_or_default(),
        agent_type: row.get(2).unwrap_or_default(),
        status: AgentStatus::from_str(&row.get::<_, String>(3).unwrap_or_default())
            .unwrap_or(AgentStatus::Terminated),
        execution_id: row.get(4).unwrap_or(None),
        user_id: row.get(5).unwrap_or(None),
        capabilities: serde_json::from_str(&capabilities).unwrap_or_default(),
        config: serde_json::from_str(&config).unwrap_or_default(),
        current_step: None,
        last_error: row.get(8).unwrap_or(None),
        termination_reason: row.get(9).unwrap_or(None),
        created_at: from_millis(row.get(10).unwrap_or(0)),
        updated_at: from_millis(row.get(11).unwrap_or(0)),
        last_active_at: from_millis(row.get(12).unwrap_or(0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::agent::SpawnRequest;

    #[tokio::test]
    async fn test_save_and_upsert() {
        let store = AgentStore::new(Database::open_in_memory().unwrap());
        let mut agent = Agent::new(&SpawnRequest::new("echo"));
        store.save(&agent).await.unwrap();

        agent.transition(AgentStatus::Idle);
        store.save(&agent).await.unwrap();

        let loaded = store.get(&agent.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, AgentStatus::Idle);
        assert_eq!(loaded.agent_type, "echo");
        assert_eq!(store.list_by_status(AgentStatus::Idle).await.unwrap().len(), 1);
        assert!(store.get("missing").await.unwrap().is_none());
    }
}
