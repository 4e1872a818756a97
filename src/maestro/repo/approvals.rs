//! SQLite-backed approval repository.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::maestro::approval::{ApprovalRequestType, ApprovalStatus, PendingApproval};
use crate::maestro::error::{RuntimeError, RuntimeResult};
use crate::maestro::repo::sqlite::{opt_ts_from_sql, ts_from_sql, ts_to_sql, Database};
use crate::maestro::repo::ApprovalRepo;

pub struct SqliteApprovalRepo {
    db: Arc<Database>,
}

impl SqliteApprovalRepo {
    pub fn new(db: Arc<Database>) -> Self {
        SqliteApprovalRepo { db }
    }
}

const APPROVAL_COLUMNS: &str = "request_id, request_type, subject, session_id, details_json, \
                                reason, status, created_at, decision_at, decision_reason";

type ApprovalRow = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    Option<String>,
    Option<String>,
);

fn read_approval_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApprovalRow> {
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
        row.get(9)?,
    ))
}

fn approval_from_row(row: ApprovalRow) -> RuntimeResult<PendingApproval> {
    let (
        request_id,
        request_type,
        subject,
        session_id,
        details_json,
        reason,
        status,
        created_at,
        decision_at,
        decision_reason,
    ) = row;
    Ok(PendingApproval {
        request_id,
        request_type: ApprovalRequestType::parse(&request_type).ok_or_else(|| {
            RuntimeError::Repository(format!("unknown approval type '{}'", request_type))
        })?,
        subject,
        session_id,
        details: serde_json::from_str(&details_json)?,
        reason,
        status: ApprovalStatus::parse(&status).ok_or_else(|| {
            RuntimeError::Repository(format!("unknown approval status '{}'", status))
        })?,
        created_at: ts_from_sql(&created_at)?,
        decision_at: opt_ts_from_sql(decision_at)?,
        decision_reason,
    })
}

#[async_trait]
impl ApprovalRepo for SqliteApprovalRepo {
    async fn save_pending(&self, approval: &PendingApproval) -> RuntimeResult<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO pending_approvals
                (request_id, request_type, subject, session_id, details_json, reason,
                 status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                approval.request_id,
                approval.request_type.as_str(),
                approval.subject,
                approval.session_id,
                serde_json::to_string(&approval.details)?,
                approval.reason,
                approval.status.as_str(),
                ts_to_sql(&approval.created_at),
            ],
        )?;
        Ok(())
    }

    async fn get_pending(&self, request_id: &str) -> RuntimeResult<Option<PendingApproval>> {
        let conn = self.db.lock().await;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM pending_approvals WHERE request_id = ?1",
                    APPROVAL_COLUMNS
                ),
                params![request_id],
                read_approval_row,
            )
            .optional()?;
        row.map(approval_from_row).transpose()
    }

    async fn get_all_pending(
        &self,
        session_id: &str,
        request_type: Option<ApprovalRequestType>,
    ) -> RuntimeResult<Vec<PendingApproval>> {
        let conn = self.db.lock().await;
        let mut approvals = Vec::new();
        match request_type {
            Some(rt) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM pending_approvals
                     WHERE session_id = ?1 AND status = 'pending' AND request_type = ?2
                     ORDER BY created_at",
                    APPROVAL_COLUMNS
                ))?;
                let rows = stmt.query_map(params![session_id, rt.as_str()], read_approval_row)?;
                for row in rows {
                    approvals.push(approval_from_row(row?)?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM pending_approvals
                     WHERE session_id = ?1 AND status = 'pending'
                     ORDER BY created_at",
                    APPROVAL_COLUMNS
                ))?;
                let rows = stmt.query_map(params![session_id], read_approval_row)?;
                for row in rows {
                    approvals.push(approval_from_row(row?)?);
                }
            }
        }
        Ok(approvals)
    }

    async fn update_status(
        &self,
        request_id: &str,
        status: ApprovalStatus,
        decided_at: DateTime<Utc>,
        reason: Option<&str>,
    ) -> RuntimeResult<bool> {
        let conn = self.db.lock().await;
        // Guarded on the status column: a second decision never overwrites
        // the first.
        let updated = conn.execute(
            "UPDATE pending_approvals
             SET status = ?2, decision_at = ?3, decision_reason = ?4
             WHERE request_id = ?1 AND status = 'pending'",
            params![request_id, status.as_str(), ts_to_sql(&decided_at), reason],
        )?;
        Ok(updated > 0)
    }

    async fn count_pending(&self, session_id: &str) -> RuntimeResult<u64> {
        let conn = self.db.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pending_approvals
             WHERE session_id = ?1 AND status = 'pending'",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    async fn sweep_expired(&self, cutoff: DateTime<Utc>) -> RuntimeResult<usize> {
        let conn = self.db.lock().await;
        let swept = conn.execute(
            "DELETE FROM pending_approvals
             WHERE status = 'pending' AND created_at < ?1",
            params![ts_to_sql(&cutoff)],
        )?;
        Ok(swept)
    }

    async fn delete_pending(&self, request_id: &str) -> RuntimeResult<bool> {
        let conn = self.db.lock().await;
        let deleted = conn.execute(
            "DELETE FROM pending_approvals WHERE request_id = ?1",
            params![request_id],
        )?;
        Ok(deleted > 0)
    }
}
