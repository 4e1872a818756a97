//! SQLite-backed FSM state repository.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde_json::{Map, Value};

use crate::maestro::error::{RuntimeError, RuntimeResult};
use crate::maestro::fsm::{FsmContext, TaskState};
use crate::maestro::repo::sqlite::{ts_to_sql, Database};
use crate::maestro::repo::FsmStateRepo;

pub struct SqliteFsmStateRepo {
    db: Arc<Database>,
}

impl SqliteFsmStateRepo {
    pub fn new(db: Arc<Database>) -> Self {
        SqliteFsmStateRepo { db }
    }
}

#[async_trait]
impl FsmStateRepo for SqliteFsmStateRepo {
    async fn save_state(
        &self,
        session_id: &str,
        state: TaskState,
        metadata: &Map<String, Value>,
    ) -> RuntimeResult<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO fsm_states (session_id, current_state, context_metadata_json, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(session_id) DO UPDATE SET
                current_state = excluded.current_state,
                context_metadata_json = excluded.context_metadata_json,
                updated_at = excluded.updated_at",
            params![
                session_id,
                state.as_str(),
                serde_json::to_string(metadata)?,
                ts_to_sql(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    async fn get_state(&self, session_id: &str) -> RuntimeResult<Option<FsmContext>> {
        let conn = self.db.lock().await;
        let row = conn
            .query_row(
                "SELECT current_state, context_metadata_json
                 FROM fsm_states WHERE session_id = ?1",
                params![session_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        match row {
            Some((state, metadata_json)) => {
                let current_state = TaskState::parse(&state).ok_or_else(|| {
                    RuntimeError::Repository(format!("unknown FSM state '{}'", state))
                })?;
                Ok(Some(FsmContext {
                    session_id: session_id.to_string(),
                    current_state,
                    metadata: serde_json::from_str(&metadata_json)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn delete_state(&self, session_id: &str) -> RuntimeResult<bool> {
        let conn = self.db.lock().await;
        let deleted = conn.execute(
            "DELETE FROM fsm_states WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(deleted > 0)
    }

    async fn update_metadata(
        &self,
        session_id: &str,
        patch: &Map<String, Value>,
    ) -> RuntimeResult<()> {
        let conn = self.db.lock().await;
        let existing: Option<String> = conn
            .query_row(
                "SELECT context_metadata_json FROM fsm_states WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        let mut metadata: Map<String, Value> = match existing {
            Some(raw) => serde_json::from_str(&raw)?,
            None => {
                return Err(RuntimeError::NotFound(format!(
                    "no FSM state for session {}",
                    session_id
                )))
            }
        };
        for (key, value) in patch {
            metadata.insert(key.clone(), value.clone());
        }
        conn.execute(
            "UPDATE fsm_states SET context_metadata_json = ?2, updated_at = ?3
             WHERE session_id = ?1",
            params![
                session_id,
                serde_json::to_string(&metadata)?,
                ts_to_sql(&Utc::now()),
            ],
        )?;
        Ok(())
    }
}
