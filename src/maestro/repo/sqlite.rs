//! SQLite connection handling and schema migrations.

use std::path::Path;

use rusqlite::Connection;
use tokio::sync::{Mutex, MutexGuard};

use crate::maestro::error::{RuntimeError, RuntimeResult};

/// Shared handle over one SQLite connection.
///
/// Repositories lock the connection for the duration of each operation;
/// multi-statement writes run inside explicit transactions on the guard.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (creating if needed) the database at `path` and run migrations.
    pub fn open(path: &Path) -> RuntimeResult<Database> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| RuntimeError::Repository(e.to_string()))?;
            }
        }
        let conn = Connection::open(path)?;
        configure_connection(&conn)?;
        run_migrations(&conn)?;
        log::info!("database opened at {}", path.display());
        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> RuntimeResult<Database> {
        let conn = Connection::open_in_memory()?;
        configure_connection(&conn)?;
        run_migrations(&conn)?;
        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

fn configure_connection(conn: &Connection) -> RuntimeResult<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA busy_timeout=5000;
         PRAGMA foreign_keys=ON;",
    )?;
    Ok(())
}

fn run_migrations(conn: &Connection) -> RuntimeResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversations (
            id            TEXT PRIMARY KEY,
            title         TEXT,
            description   TEXT,
            is_active     INTEGER NOT NULL DEFAULT 1,
            max_messages  INTEGER NOT NULL DEFAULT 1000,
            created_at    TEXT NOT NULL,
            last_activity TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            seq             INTEGER NOT NULL,
            id              TEXT NOT NULL,
            role            TEXT NOT NULL,
            content         TEXT NOT NULL,
            name            TEXT,
            tool_call_id    TEXT,
            tool_calls_json TEXT,
            metadata_json   TEXT,
            ts              TEXT NOT NULL,
            PRIMARY KEY (conversation_id, seq)
        );

        CREATE TABLE IF NOT EXISTS snapshots (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            messages_json   TEXT NOT NULL,
            created_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS agent_contexts (
            session_id    TEXT PRIMARY KEY,
            current_agent TEXT NOT NULL,
            switch_count  INTEGER NOT NULL DEFAULT 0,
            max_switches  INTEGER NOT NULL DEFAULT 10,
            updated_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS agent_switches (
            session_id TEXT NOT NULL REFERENCES agent_contexts(session_id) ON DELETE CASCADE,
            seq        INTEGER NOT NULL,
            from_agent TEXT NOT NULL,
            to_agent   TEXT NOT NULL,
            reason     TEXT,
            confidence TEXT,
            ts         TEXT NOT NULL,
            PRIMARY KEY (session_id, seq)
        );

        CREATE TABLE IF NOT EXISTS plans (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            goal            TEXT NOT NULL,
            status          TEXT NOT NULL,
            error           TEXT,
            created_at      TEXT NOT NULL,
            approved_at     TEXT,
            started_at      TEXT,
            completed_at    TEXT
        );

        CREATE TABLE IF NOT EXISTS subtasks (
            plan_id           TEXT NOT NULL REFERENCES plans(id) ON DELETE CASCADE,
            seq               INTEGER NOT NULL,
            id                TEXT NOT NULL,
            description       TEXT NOT NULL,
            agent             TEXT NOT NULL,
            status            TEXT NOT NULL,
            dependencies_json TEXT NOT NULL,
            estimated_time    TEXT NOT NULL,
            result            TEXT,
            error             TEXT,
            retry_count       INTEGER NOT NULL DEFAULT 0,
            started_at        TEXT,
            completed_at      TEXT,
            metadata_json     TEXT,
            PRIMARY KEY (plan_id, seq)
        );

        CREATE TABLE IF NOT EXISTS pending_approvals (
            request_id      TEXT PRIMARY KEY,
            request_type    TEXT NOT NULL,
            subject         TEXT NOT NULL,
            session_id      TEXT NOT NULL,
            details_json    TEXT NOT NULL,
            reason          TEXT,
            status          TEXT NOT NULL DEFAULT 'pending',
            created_at      TEXT NOT NULL,
            decision_at     TEXT,
            decision_reason TEXT
        );

        CREATE TABLE IF NOT EXISTS fsm_states (
            session_id            TEXT PRIMARY KEY,
            current_state         TEXT NOT NULL,
            context_metadata_json TEXT NOT NULL DEFAULT '{}',
            updated_at            TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_plans_conversation
            ON plans(conversation_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_pending_session
            ON pending_approvals(session_id, status);
        CREATE INDEX IF NOT EXISTS idx_conversations_activity
            ON conversations(is_active, last_activity);",
    )?;
    Ok(())
}

/// Render a UTC timestamp in the stored ISO-8601 form.
///
/// Fixed-width microsecond precision keeps lexicographic order equal to
/// chronological order, which the range and cleanup queries rely on.
pub(crate) fn ts_to_sql(ts: &chrono::DateTime<chrono::Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Parse a stored ISO-8601 timestamp.
pub(crate) fn ts_from_sql(raw: &str) -> RuntimeResult<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| RuntimeError::Repository(format!("bad timestamp '{}': {}", raw, e)))
}

/// Parse an optional stored timestamp.
pub(crate) fn opt_ts_from_sql(
    raw: Option<String>,
) -> RuntimeResult<Option<chrono::DateTime<chrono::Utc>>> {
    match raw {
        Some(value) => Ok(Some(ts_from_sql(&value)?)),
        None => Ok(None),
    }
}
