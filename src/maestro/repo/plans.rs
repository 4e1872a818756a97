//! SQLite-backed plan repository.

use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use crate::maestro::agent_context::AgentKind;
use crate::maestro::error::{RuntimeError, RuntimeResult};
use crate::maestro::plan::{ExecutionPlan, PlanStatus, Subtask, SubtaskStatus};
use crate::maestro::repo::sqlite::{opt_ts_from_sql, ts_from_sql, ts_to_sql, Database};
use crate::maestro::repo::PlanRepo;

pub struct SqlitePlanRepo {
    db: Arc<Database>,
}

impl SqlitePlanRepo {
    pub fn new(db: Arc<Database>) -> Self {
        SqlitePlanRepo { db }
    }
}

const PLAN_COLUMNS: &str =
    "id, conversation_id, goal, status, error, created_at, approved_at, started_at, completed_at";

type PlanRow = (
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
);

fn read_plan_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlanRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn plan_from_row(row: PlanRow) -> RuntimeResult<ExecutionPlan> {
    let (id, conversation_id, goal, status, error, created_at, approved_at, started_at, completed_at) =
        row;
    let status = PlanStatus::parse(&status)
        .ok_or_else(|| RuntimeError::Repository(format!("unknown plan status '{}'", status)))?;
    Ok(ExecutionPlan {
        id,
        conversation_id,
        goal,
        status,
        subtasks: Vec::new(),
        error,
        created_at: ts_from_sql(&created_at)?,
        approved_at: opt_ts_from_sql(approved_at)?,
        started_at: opt_ts_from_sql(started_at)?,
        completed_at: opt_ts_from_sql(completed_at)?,
    })
}

fn load_subtasks(conn: &Connection, plan_id: &str) -> RuntimeResult<Vec<Subtask>> {
    let mut stmt = conn.prepare(
        "SELECT id, description, agent, status, dependencies_json, estimated_time,
                result, error, retry_count, started_at, completed_at, metadata_json
         FROM subtasks WHERE plan_id = ?1 ORDER BY seq",
    )?;
    let rows = stmt.query_map(params![plan_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, Option<String>>(6)?,
            row.get::<_, Option<String>>(7)?,
            row.get::<_, i64>(8)?,
            row.get::<_, Option<String>>(9)?,
            row.get::<_, Option<String>>(10)?,
            row.get::<_, Option<String>>(11)?,
        ))
    })?;

    let mut subtasks = Vec::new();
    for row in rows {
        let (
            id,
            description,
            agent,
            status,
            dependencies_json,
            estimated_time,
            result,
            error,
            retry_count,
            started_at,
            completed_at,
            metadata_json,
        ) = row?;
        let agent = AgentKind::parse(&agent)
            .ok_or_else(|| RuntimeError::Repository(format!("unknown agent '{}'", agent)))?;
        let status = SubtaskStatus::parse(&status).ok_or_else(|| {
            RuntimeError::Repository(format!("unknown subtask status '{}'", status))
        })?;
        let metadata = match metadata_json {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        };
        subtasks.push(Subtask {
            id,
            description,
            agent,
            dependencies: serde_json::from_str(&dependencies_json)?,
            status,
            estimated_time,
            result,
            error,
            retry_count: retry_count as u32,
            started_at: opt_ts_from_sql(started_at)?,
            completed_at: opt_ts_from_sql(completed_at)?,
            metadata,
        });
    }
    Ok(subtasks)
}

fn write_plan(conn: &Connection, plan: &ExecutionPlan) -> RuntimeResult<()> {
    conn.execute(
        "INSERT INTO plans
            (id, conversation_id, goal, status, error, created_at, approved_at,
             started_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
            status = excluded.status,
            error = excluded.error,
            approved_at = excluded.approved_at,
            started_at = excluded.started_at,
            completed_at = excluded.completed_at",
        params![
            plan.id,
            plan.conversation_id,
            plan.goal,
            plan.status.as_str(),
            plan.error,
            ts_to_sql(&plan.created_at),
            plan.approved_at.as_ref().map(ts_to_sql),
            plan.started_at.as_ref().map(ts_to_sql),
            plan.completed_at.as_ref().map(ts_to_sql),
        ],
    )?;
    conn.execute("DELETE FROM subtasks WHERE plan_id = ?1", params![plan.id])?;
    let mut stmt = conn.prepare(
        "INSERT INTO subtasks
            (plan_id, seq, id, description, agent, status, dependencies_json,
             estimated_time, result, error, retry_count, started_at, completed_at,
             metadata_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
    )?;
    for (seq, subtask) in plan.subtasks.iter().enumerate() {
        let metadata_json = match &subtask.metadata {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        };
        stmt.execute(params![
            plan.id,
            seq as i64,
            subtask.id,
            subtask.description,
            subtask.agent.as_str(),
            subtask.status.as_str(),
            serde_json::to_string(&subtask.dependencies)?,
            subtask.estimated_time,
            subtask.result,
            subtask.error,
            subtask.retry_count as i64,
            subtask.started_at.as_ref().map(ts_to_sql),
            subtask.completed_at.as_ref().map(ts_to_sql),
            metadata_json,
        ])?;
    }
    Ok(())
}

#[async_trait]
impl PlanRepo for SqlitePlanRepo {
    async fn save(&self, plan: &ExecutionPlan, commit: bool) -> RuntimeResult<()> {
        let mut conn = self.db.lock().await;
        if commit {
            // Own committed transaction: readers in later requests must see
            // the plan immediately (approval decisions arrive out-of-band).
            let tx = conn.transaction()?;
            write_plan(&tx, plan)?;
            tx.commit()?;
        } else {
            write_plan(&conn, plan)?;
        }
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> RuntimeResult<Option<ExecutionPlan>> {
        let conn = self.db.lock().await;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM plans WHERE id = ?1", PLAN_COLUMNS),
                params![id],
                read_plan_row,
            )
            .optional()?;
        match row {
            Some(raw) => {
                let mut plan = plan_from_row(raw)?;
                plan.subtasks = load_subtasks(&conn, id)?;
                Ok(Some(plan))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, id: &str) -> RuntimeResult<bool> {
        let conn = self.db.lock().await;
        let deleted = conn.execute("DELETE FROM plans WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    async fn find_active_for_conversation(
        &self,
        conversation_id: &str,
    ) -> RuntimeResult<Option<ExecutionPlan>> {
        let conn = self.db.lock().await;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM plans
                     WHERE conversation_id = ?1 AND status IN ('approved', 'in_progress')
                     ORDER BY created_at DESC LIMIT 1",
                    PLAN_COLUMNS
                ),
                params![conversation_id],
                read_plan_row,
            )
            .optional()?;
        match row {
            Some(raw) => {
                let mut plan = plan_from_row(raw)?;
                plan.subtasks = load_subtasks(&conn, &plan.id)?;
                Ok(Some(plan))
            }
            None => Ok(None),
        }
    }

    async fn find_all_for_conversation(
        &self,
        conversation_id: &str,
        limit: u32,
        offset: u32,
    ) -> RuntimeResult<Vec<ExecutionPlan>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM plans WHERE conversation_id = ?1
             ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
            PLAN_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![conversation_id, limit as i64, offset as i64],
            read_plan_row,
        )?;
        let mut plans = Vec::new();
        for row in rows {
            let mut plan = plan_from_row(row?)?;
            plan.subtasks = load_subtasks(&conn, &plan.id)?;
            plans.push(plan);
        }
        Ok(plans)
    }

    async fn find_by_status(&self, status: PlanStatus) -> RuntimeResult<Vec<ExecutionPlan>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM plans WHERE status = ?1 ORDER BY created_at DESC",
            PLAN_COLUMNS
        ))?;
        let rows = stmt.query_map(params![status.as_str()], read_plan_row)?;
        let mut plans = Vec::new();
        for row in rows {
            let mut plan = plan_from_row(row?)?;
            plan.subtasks = load_subtasks(&conn, &plan.id)?;
            plans.push(plan);
        }
        Ok(plans)
    }
}
