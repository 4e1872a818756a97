//! SQLite-backed agent context repository.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use crate::maestro::agent_context::{AgentContext, AgentKind, AgentSwitch};
use crate::maestro::error::{RuntimeError, RuntimeResult};
use crate::maestro::repo::sqlite::{ts_from_sql, ts_to_sql, Database};
use crate::maestro::repo::AgentContextRepo;

pub struct SqliteAgentContextRepo {
    db: Arc<Database>,
}

impl SqliteAgentContextRepo {
    pub fn new(db: Arc<Database>) -> Self {
        SqliteAgentContextRepo { db }
    }
}

fn load_switches(conn: &Connection, session_id: &str) -> RuntimeResult<Vec<AgentSwitch>> {
    let mut stmt = conn.prepare(
        "SELECT from_agent, to_agent, reason, confidence, ts
         FROM agent_switches WHERE session_id = ?1 ORDER BY seq",
    )?;
    let rows = stmt.query_map(params![session_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;
    let mut switches = Vec::new();
    for row in rows {
        let (from, to, reason, confidence, ts) = row?;
        switches.push(AgentSwitch {
            from: AgentKind::parse(&from)
                .ok_or_else(|| RuntimeError::Repository(format!("unknown agent '{}'", from)))?,
            to: AgentKind::parse(&to)
                .ok_or_else(|| RuntimeError::Repository(format!("unknown agent '{}'", to)))?,
            reason: reason.unwrap_or_default(),
            confidence: confidence.unwrap_or_default(),
            at: ts_from_sql(&ts)?,
        });
    }
    Ok(switches)
}

fn context_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, i64, i64, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn build_context(
    conn: &Connection,
    row: (String, String, i64, i64, String),
) -> RuntimeResult<AgentContext> {
    let (session_id, current_agent, switch_count, max_switches, updated_at) = row;
    let switch_history = load_switches(conn, &session_id)?;
    Ok(AgentContext {
        current_agent: AgentKind::parse(&current_agent).ok_or_else(|| {
            RuntimeError::Repository(format!("unknown agent '{}'", current_agent))
        })?,
        session_id,
        switch_history,
        switch_count: switch_count as u32,
        max_switches: max_switches as u32,
        updated_at: ts_from_sql(&updated_at)?,
    })
}

const CONTEXT_COLUMNS: &str = "session_id, current_agent, switch_count, max_switches, updated_at";

#[async_trait]
impl AgentContextRepo for SqliteAgentContextRepo {
    async fn save(&self, context: &AgentContext) -> RuntimeResult<()> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO agent_contexts
                (session_id, current_agent, switch_count, max_switches, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(session_id) DO UPDATE SET
                current_agent = excluded.current_agent,
                switch_count = excluded.switch_count,
                max_switches = excluded.max_switches,
                updated_at = excluded.updated_at",
            params![
                context.session_id,
                context.current_agent.as_str(),
                context.switch_count as i64,
                context.max_switches as i64,
                ts_to_sql(&context.updated_at),
            ],
        )?;
        tx.execute(
            "DELETE FROM agent_switches WHERE session_id = ?1",
            params![context.session_id],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO agent_switches
                    (session_id, seq, from_agent, to_agent, reason, confidence, ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for (seq, switch) in context.switch_history.iter().enumerate() {
                stmt.execute(params![
                    context.session_id,
                    seq as i64,
                    switch.from.as_str(),
                    switch.to.as_str(),
                    switch.reason,
                    switch.confidence,
                    ts_to_sql(&switch.at),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn find_by_session_id(&self, session_id: &str) -> RuntimeResult<Option<AgentContext>> {
        let conn = self.db.lock().await;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM agent_contexts WHERE session_id = ?1",
                    CONTEXT_COLUMNS
                ),
                params![session_id],
                context_from_row,
            )
            .optional()?;
        match row {
            Some(raw) => Ok(Some(build_context(&conn, raw)?)),
            None => Ok(None),
        }
    }

    async fn find_by_agent_type(
        &self,
        agent: AgentKind,
        limit: u32,
    ) -> RuntimeResult<Vec<AgentContext>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM agent_contexts WHERE current_agent = ?1
             ORDER BY updated_at DESC LIMIT ?2",
            CONTEXT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![agent.as_str(), limit as i64], context_from_row)?;
        let raws: Vec<_> = rows.collect::<Result<_, _>>()?;
        let mut contexts = Vec::new();
        for raw in raws {
            contexts.push(build_context(&conn, raw)?);
        }
        Ok(contexts)
    }

    async fn find_with_switches_above(
        &self,
        threshold: u32,
        limit: u32,
    ) -> RuntimeResult<Vec<AgentContext>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM agent_contexts WHERE switch_count > ?1
             ORDER BY switch_count DESC LIMIT ?2",
            CONTEXT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![threshold as i64, limit as i64], context_from_row)?;
        let raws: Vec<_> = rows.collect::<Result<_, _>>()?;
        let mut contexts = Vec::new();
        for raw in raws {
            contexts.push(build_context(&conn, raw)?);
        }
        Ok(contexts)
    }

    async fn usage_stats(&self) -> RuntimeResult<HashMap<String, u64>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT current_agent, COUNT(*) FROM agent_contexts GROUP BY current_agent",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut stats = HashMap::new();
        for row in rows {
            let (agent, count) = row?;
            stats.insert(agent, count as u64);
        }
        Ok(stats)
    }
}
