//! SQLite persistence for templates, instances and the bot task queue.
//!
//! Uses rusqlite with WAL mode so concurrent instance runs can read while
//! one of them writes. Every store call goes through
//! `tokio::task::spawn_blocking` to keep the async runtime free.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::EngineError;

/// Thread-safe handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(db_path: &str) -> Result<Self, EngineError> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path)
            .map_err(|e| EngineError::Database(format!("Failed to open database: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| EngineError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;

        tracing::info!("SQLite database opened at: {}", db_path);
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::Database(format!("Failed to open in-memory db: {}", e)))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| EngineError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| EngineError::Database(format!("Lock poisoned: {}", e)))?;
        f(&conn).map_err(|e| EngineError::Database(e.to_string()))
    }

    /// Like `with_conn` but with a mutable connection, for transactions.
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&mut Connection) -> Result<T, rusqlite::Error>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| EngineError::Database(format!("Lock poisoned: {}", e)))?;
        f(&mut conn).map_err(|e| EngineError::Database(e.to_string()))
    }

    /// Execute a closure with access to the database connection (async-friendly).
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| EngineError::Database(format!("Task join error: {}", e)))?
    }

    /// Async variant of `with_conn_mut`.
    pub async fn with_conn_mut_async<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&mut Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn_mut(f))
            .await
            .map_err(|e| EngineError::Database(format!("Task join error: {}", e)))?
    }

    /// Create all tables if they don't exist.
    fn initialize_tables(&self) -> Result<(), EngineError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS flowchart_templates (
                    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                    template_id         TEXT NOT NULL,
                    version             INTEGER NOT NULL,
                    parent_version_id   INTEGER,
                    is_latest           INTEGER NOT NULL DEFAULT 1,
                    name                TEXT NOT NULL,
                    description         TEXT,
                    category            TEXT,
                    icon                TEXT,
                    definition          TEXT NOT NULL DEFAULT '{}',
                    variables           TEXT NOT NULL DEFAULT '[]',
                    allowed_room_ids    TEXT NOT NULL DEFAULT '[]',
                    is_public           INTEGER NOT NULL DEFAULT 1,
                    created_by          TEXT,
                    updated_by          TEXT,
                    created_at          INTEGER NOT NULL,
                    updated_at          INTEGER NOT NULL,
                    UNIQUE (template_id, version)
                );
                CREATE UNIQUE INDEX IF NOT EXISTS idx_templates_latest
                    ON flowchart_templates(template_id) WHERE is_latest = 1;
                CREATE INDEX IF NOT EXISTS idx_templates_category ON flowchart_templates(category);

                CREATE TABLE IF NOT EXISTS flowchart_instances (
                    instance_id             TEXT PRIMARY KEY,
                    template_id             TEXT NOT NULL,
                    template_version        INTEGER NOT NULL,
                    template_name           TEXT NOT NULL DEFAULT '',
                    room_id                 TEXT,
                    status                  TEXT NOT NULL DEFAULT 'PENDING',
                    current_node_id         TEXT,
                    variables               TEXT NOT NULL DEFAULT '{}',
                    node_executions         TEXT NOT NULL DEFAULT '[]',
                    outputs                 TEXT NOT NULL DEFAULT '{}',
                    final_output            TEXT,
                    error_message           TEXT,
                    error_node_id           TEXT,
                    task_queue_id           TEXT,
                    triggered_by            TEXT,
                    triggered_by_message_id TEXT,
                    started_at              INTEGER,
                    completed_at            INTEGER,
                    duration_ms             INTEGER,
                    created_at              INTEGER NOT NULL,
                    updated_at              INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_instances_template ON flowchart_instances(template_id, status);
                CREATE INDEX IF NOT EXISTS idx_instances_room ON flowchart_instances(room_id);

                CREATE TABLE IF NOT EXISTS bot_task_queue (
                    task_id                 TEXT PRIMARY KEY,
                    room_id                 TEXT NOT NULL,
                    assistant_type          TEXT NOT NULL,
                    task_type               TEXT NOT NULL DEFAULT 'CHAT',
                    content                 TEXT NOT NULL DEFAULT '',
                    attachments             TEXT NOT NULL DEFAULT '[]',
                    user_info               TEXT,
                    source_message_id       TEXT,
                    flowchart_instance_id   TEXT,
                    status                  TEXT NOT NULL DEFAULT 'PENDING',
                    position                INTEGER NOT NULL DEFAULT 0,
                    created_at              INTEGER NOT NULL,
                    updated_at              INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_task_queue_partition
                    ON bot_task_queue(room_id, assistant_type, status);
                "
            )
        })?;
        self.run_migrations()
    }

    /// Apply incremental migrations for schema changes on existing databases.
    fn run_migrations(&self) -> Result<(), EngineError> {
        self.with_conn(|conn| {
            // Added after the first release; ignore the error if already present.
            let _ = conn.execute(
                "ALTER TABLE flowchart_instances ADD COLUMN triggered_by_message_id TEXT",
                [],
            );
            Ok(())
        })
    }
}
