use rusqlite::{OptionalExtension, Row};

use super::from_millis;
use crate::db::Database;
use crate::error::CoreResult;
use crate::models::entanglement::{CoordinationMode, Entanglement};

#[derive(Clone)]
pub struct EntanglementStore {
    db: Database,
}

impl EntanglementStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn save(&self, entanglement: &Entanglement) -> CoreResult<()> {
        let participants = serde_json::to_string(&entanglement.participants)?;
        let shared_state = serde_json::to_string(&entanglement.shared_state)?;
        let e = entanglement.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO entanglements (id, name, mode, participants, shared_state, version, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(id) DO UPDATE SET
                       participants = excluded.participants,
                       shared_state = excluded.shared_state,
                       version = excluded.version,
                       updated_at = excluded.updated_at",
                    rusqlite::params![
                        e.id,
                        e.name,
                        e.mode.as_str(),
                        participants,
                        shared_state,
                        e.version as i64,
                        e.created_at.timestamp_millis(),
                        e.updated_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> CoreResult<Option<Entanglement>> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, mode, participants, shared_state, version, created_at, updated_at
                     FROM entanglements WHERE id = ?1",
                )?;
                stmt.query_row(rusqlite::params![id], |row| Ok(row_to_entanglement(row)))
                    .optional()
            })
            .await
    }

    pub async fn delete(&self, id: &str) -> CoreResult<()> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.execute("DELETE FROM entanglements WHERE id = ?1", rusqlite::params![id])?;
                Ok(())
            })
            .await
    }
}

fn row_to_entanglement(row: &Row<'_>) -> Entanglement {
    let participants: String = row.get(3).unwrap_or_default();
    let shared_state: String = row.get(4).unwrap_or_default();
    Entanglement {
        id: row.get(0).unwrap_or_default(),
        name: row.get(1).unwrap_or_default(),
        mode: CoordinationMode::from_str(&row.get::<_, String>(2).unwrap_or_default())
            .unwrap_or(CoordinationMode::Merge),
        participants: serde_json::from_str(&participants).unwrap_or_default(),
        shared_state: serde_json::from_str(&shared_state)
            .unwrap_or_else(|_| serde_json::Value::Object(Default::default())),
        version: row.get::<_, i64>(5).unwrap_or(0) as u64,
        created_at: from_millis(row.get(6).unwrap_or(0)),
        updated_at: from_millis(row.get(7).unwrap_or(0)),
    }
}
