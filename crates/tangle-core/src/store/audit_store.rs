use async_trait::async_trait;
use rusqlite::Row;

use super::from_millis;
use crate::audit::{AuditQuery, AuditSink};
use crate::db::Database;
use crate::error::{CoreError, CoreResult};
use crate::models::audit::{Actor, ActorKind, AuditEvent, TargetType};

/// Audit sink backed by the `audit_events` table.
#[derive(Clone)]
pub struct AuditStore {
    db: Database,
}

impl AuditStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn actor_kind_str(kind: ActorKind) -> &'static str {
    match kind {
        ActorKind::Agent => "agent",
        ActorKind::User => "user",
        ActorKind::System => "system",
    }
}

#[async_trait]
impl AuditSink for AuditStore {
    async fn append(&self, event: &AuditEvent) -> CoreResult<()> {
        let metadata = serde_json::to_string(&event.metadata)
            .map_err(|e| CoreError::Audit(e.to_string()))?;
        let e = event.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO audit_events (id, timestamp, actor_kind, actor_id, action, target_type, target_id, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        e.id,
                        e.timestamp.timestamp_millis(),
                        actor_kind_str(e.actor.kind),
                        e.actor.id,
                        e.action,
                        e.target_type.as_str(),
                        e.target_id,
                        metadata,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| CoreError::Audit(e.to_string()))
    }

    async fn query(&self, query: &AuditQuery) -> CoreResult<Vec<AuditEvent>> {
        let mut sql = String::from(
            "SELECT id, timestamp, actor_kind, actor_id, action, target_type, target_id, metadata
             FROM audit_events WHERE 1 = 1",
        );
        let mut params: Vec<String> = Vec::new();
        if let Some(tt) = query.target_type {
            params.push(tt.as_str().to_string());
            sql.push_str(&format!(" AND target_type = ?{}", params.len()));
        }
        if let Some(ref id) = query.target_id {
            params.push(id.clone());
            sql.push_str(&format!(" AND target_id = ?{}", params.len()));
        }
        if let Some(ref action) = query.action {
            if action.ends_with('.') {
                params.push(format!("{}%", action));
                sql.push_str(&format!(" AND action LIKE ?{}", params.len()));
            } else {
                params.push(action.clone());
                sql.push_str(&format!(" AND action = ?{}", params.len()));
            }
        }
        sql.push_str(" ORDER BY timestamp DESC, rowid DESC");
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(params.iter()), |row| Ok(row_to_event(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

fn row_to_event(row: &Row<'_>) -> AuditEvent {
    let kind = match row.get::<_, String>(2).unwrap_or_default().as_str() {
        "agent" => ActorKind::Agent,
        "user" => ActorKind::User,
        _ => ActorKind::System,
    };
    let metadata: String = row.get(7).unwrap_or_default();
    AuditEvent {
        id: row.get(0).unwrap_or_default(),
        timestamp: from_millis(row.get(1).unwrap_or(0)),
        actor: Actor {
            kind,
            id: row.get(3).unwrap_or(None),
        },
        action: row.get(4).unwrap_or_default(),
        target_type: TargetType::from_str(&row.get::<_, String>(5).unwrap_or_default())
            .unwrap_or(TargetType::Workflow),
        target_id: row.get(6).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_append_and_filter() {
        let store = AuditStore::new(Database::open_in_memory().unwrap());
        store
            .append(
                &AuditEvent::new(Actor::agent("a1"), "agent.spawned", TargetType::Agent, "a1")
                    .with_metadata(json!({"agent_type": "echo"})),
            )
            .await
            .unwrap();
        store
            .append(&AuditEvent::new(Actor::system(), "execution.started", TargetType::Execution, "e1"))
            .await
            .unwrap();

        let agent_events = store
            .query(&AuditQuery {
                action: Some("agent.".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(agent_events.len(), 1);
        assert_eq!(agent_events[0].metadata, json!({"agent_type": "echo"}));
        assert_eq!(agent_events[0].actor, Actor::agent("a1"));

        let by_target = store
            .query(&AuditQuery {
                target_type: Some(TargetType::Execution),
                target_id: Some("e1".into()),
                limit: Some(5),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_target.len(), 1);
    }
}
