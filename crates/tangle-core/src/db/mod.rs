//! SQLite storage for workflows, executions, agents, entanglements and the
//! audit log.
//!
//! Uses rusqlite with WAL mode for concurrent read performance.
//! All database operations are executed via `tokio::task::spawn_blocking`
//! to avoid blocking the async runtime. Structured fields (workflow
//! definitions, variables, step results, shared state, metadata) are stored
//! as JSON text.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{CoreError, CoreResult};

/// Thread-safe handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(db_path: &str) -> CoreResult<Self> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path)
            .map_err(|e| CoreError::Database(format!("Failed to open database: {}", e)))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")
            .map_err(|e| CoreError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.initialize_tables()?;

        tracing::info!("[Database] SQLite database opened at: {}", db_path);
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CoreError::Database(format!("Failed to open in-memory db: {}", e)))?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.initialize_tables()?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    pub fn with_conn<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| CoreError::Database(format!("Lock poisoned: {}", e)))?;
        f(&conn).map_err(CoreError::from)
    }

    /// Execute a closure with access to the database connection (async-friendly).
    pub async fn with_conn_async<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| CoreError::Database(format!("Task join error: {}", e)))?
    }

    fn initialize_tables(&self) -> CoreResult<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS workflows (
                    id              TEXT PRIMARY KEY,
                    name            TEXT NOT NULL,
                    version         TEXT NOT NULL,
                    definition      TEXT NOT NULL,
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS executions (
                    id              TEXT PRIMARY KEY,
                    workflow_id     TEXT NOT NULL,
                    workflow_name   TEXT NOT NULL,
                    status          TEXT NOT NULL,
                    user_id         TEXT,
                    variables       TEXT NOT NULL DEFAULT '{}',
                    step_results    TEXT NOT NULL DEFAULT '{}',
                    error           TEXT,
                    total_steps     INTEGER NOT NULL DEFAULT 0,
                    created_at      INTEGER NOT NULL,
                    started_at      INTEGER,
                    finished_at     INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_executions_workflow ON executions(workflow_id);
                CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);

                CREATE TABLE IF NOT EXISTS agents (
                    id                  TEXT PRIMARY KEY,
                    name                TEXT NOT NULL,
                    agent_type          TEXT NOT NULL,
                    status              TEXT NOT NULL,
                    execution_id        TEXT,
                    user_id             TEXT,
                    capabilities        TEXT NOT NULL DEFAULT '[]',
                    config              TEXT NOT NULL DEFAULT 'null',
                    last_error          TEXT,
                    termination_reason  TEXT,
                    created_at          INTEGER NOT NULL,
                    updated_at          INTEGER NOT NULL,
                    last_active_at      INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_agents_status ON agents(status);
                CREATE INDEX IF NOT EXISTS idx_agents_execution ON agents(execution_id);

                CREATE TABLE IF NOT EXISTS entanglements (
                    id              TEXT PRIMARY KEY,
                    name            TEXT NOT NULL,
                    mode            TEXT NOT NULL,
                    participants    TEXT NOT NULL DEFAULT '[]',
                    shared_state    TEXT NOT NULL DEFAULT '{}',
                    version         INTEGER NOT NULL DEFAULT 0,
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS audit_events (
                    id              TEXT PRIMARY KEY,
                    timestamp       INTEGER NOT NULL,
                    actor_kind      TEXT NOT NULL,
                    actor_id        TEXT,
                    action          TEXT NOT NULL,
                    target_type     TEXT NOT NULL,
                    target_id       TEXT NOT NULL,
                    metadata        TEXT NOT NULL DEFAULT 'null'
                );
                CREATE INDEX IF NOT EXISTS idx_audit_target ON audit_events(target_type, target_id);
                CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_events(timestamp);
                ",
            )
        })
    }
}
