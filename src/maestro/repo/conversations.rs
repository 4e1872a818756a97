//! SQLite-backed conversation repository.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::maestro::error::{RuntimeError, RuntimeResult};
use crate::maestro::repo::sqlite::{ts_from_sql, ts_to_sql, Database};
use crate::maestro::repo::ConversationRepo;
use crate::maestro::session::{Conversation, ConversationSnapshot, Message, Role, ToolCall};

pub struct SqliteConversationRepo {
    db: Arc<Database>,
}

impl SqliteConversationRepo {
    pub fn new(db: Arc<Database>) -> Self {
        SqliteConversationRepo { db }
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let created_at: String = row.get(5)?;
    let last_activity: String = row.get(6)?;
    Ok(Conversation {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        messages: Vec::new(),
        is_active: row.get::<_, i64>(3)? != 0,
        max_messages: row.get::<_, i64>(4)? as usize,
        created_at: ts_from_sql(&created_at).unwrap_or_else(|_| Utc::now()),
        last_activity: ts_from_sql(&last_activity).unwrap_or_else(|_| Utc::now()),
    })
}

const CONVERSATION_COLUMNS: &str =
    "id, title, description, is_active, max_messages, created_at, last_activity";

fn load_messages(conn: &Connection, conversation_id: &str) -> RuntimeResult<Vec<Message>> {
    let mut stmt = conn.prepare(
        "SELECT id, role, content, name, tool_call_id, tool_calls_json, metadata_json, ts
         FROM messages WHERE conversation_id = ?1 ORDER BY seq",
    )?;
    let rows = stmt.query_map(params![conversation_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, Option<String>>(5)?,
            row.get::<_, Option<String>>(6)?,
            row.get::<_, String>(7)?,
        ))
    })?;

    let mut messages = Vec::new();
    for row in rows {
        let (id, role, content, name, tool_call_id, tool_calls_json, metadata_json, ts) = row?;
        let role = Role::parse(&role)
            .ok_or_else(|| RuntimeError::Repository(format!("unknown role '{}'", role)))?;
        let tool_calls: Vec<ToolCall> = match tool_calls_json {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Vec::new(),
        };
        let metadata = match metadata_json {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        };
        messages.push(Message {
            id,
            role,
            content,
            tool_calls,
            tool_call_id,
            name,
            metadata,
            created_at: ts_from_sql(&ts)?,
        });
    }
    Ok(messages)
}

#[async_trait]
impl ConversationRepo for SqliteConversationRepo {
    async fn save(&self, conversation: &Conversation) -> RuntimeResult<()> {
        let mut conn = self.db.lock().await;
        // The whole message sequence is replaced in one transaction; a
        // partial write is never visible.
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO conversations
                (id, title, description, is_active, max_messages, created_at, last_activity)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                description = excluded.description,
                is_active = excluded.is_active,
                max_messages = excluded.max_messages,
                last_activity = excluded.last_activity",
            params![
                conversation.id,
                conversation.title,
                conversation.description,
                conversation.is_active as i64,
                conversation.max_messages as i64,
                ts_to_sql(&conversation.created_at),
                ts_to_sql(&conversation.last_activity),
            ],
        )?;
        tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![conversation.id],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO messages
                    (conversation_id, seq, id, role, content, name, tool_call_id,
                     tool_calls_json, metadata_json, ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for (seq, message) in conversation.messages.iter().enumerate() {
                let tool_calls_json = if message.tool_calls.is_empty() {
                    None
                } else {
                    Some(serde_json::to_string(&message.tool_calls)?)
                };
                let metadata_json = match &message.metadata {
                    Some(value) => Some(serde_json::to_string(value)?),
                    None => None,
                };
                stmt.execute(params![
                    conversation.id,
                    seq as i64,
                    message.id,
                    message.role.as_str(),
                    message.content,
                    message.name,
                    message.tool_call_id,
                    tool_calls_json,
                    metadata_json,
                    ts_to_sql(&message.created_at),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> RuntimeResult<Option<Conversation>> {
        let conn = self.db.lock().await;
        let found = conn
            .query_row(
                &format!(
                    "SELECT {} FROM conversations WHERE id = ?1",
                    CONVERSATION_COLUMNS
                ),
                params![id],
                row_to_conversation,
            )
            .optional()?;
        match found {
            Some(mut conversation) => {
                conversation.messages = load_messages(&conn, id)?;
                Ok(Some(conversation))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, id: &str) -> RuntimeResult<bool> {
        let conn = self.db.lock().await;
        let deleted = conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    async fn find_active(&self, limit: u32, offset: u32) -> RuntimeResult<Vec<Conversation>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM conversations WHERE is_active = 1
             ORDER BY last_activity DESC LIMIT ?1 OFFSET ?2",
            CONVERSATION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], row_to_conversation)?;
        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }

    async fn find_by_activity_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> RuntimeResult<Vec<Conversation>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM conversations
             WHERE last_activity >= ?1 AND last_activity <= ?2
             ORDER BY last_activity DESC",
            CONVERSATION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![ts_to_sql(&from), ts_to_sql(&to)], row_to_conversation)?;
        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }

    async fn cleanup_older_than(&self, hours: u32) -> RuntimeResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::hours(hours as i64);
        let conn = self.db.lock().await;
        let deleted = conn.execute(
            "DELETE FROM conversations WHERE last_activity < ?1",
            params![ts_to_sql(&cutoff)],
        )?;
        if deleted > 0 {
            log::info!("cleaned up {} conversations idle for {}h+", deleted, hours);
        }
        Ok(deleted)
    }

    async fn count_active(&self) -> RuntimeResult<u64> {
        let conn = self.db.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM conversations WHERE is_active = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    async fn save_snapshot(&self, snapshot: &ConversationSnapshot) -> RuntimeResult<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO snapshots (id, conversation_id, messages_json, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                snapshot.id,
                snapshot.conversation_id,
                serde_json::to_string(&snapshot.messages)?,
                ts_to_sql(&snapshot.created_at),
            ],
        )?;
        Ok(())
    }

    async fn get_snapshot(&self, id: &str) -> RuntimeResult<Option<ConversationSnapshot>> {
        let conn = self.db.lock().await;
        let row = conn
            .query_row(
                "SELECT id, conversation_id, messages_json, created_at
                 FROM snapshots WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((id, conversation_id, messages_json, created_at)) => {
                Ok(Some(ConversationSnapshot {
                    id,
                    conversation_id,
                    messages: serde_json::from_str(&messages_json)?,
                    created_at: ts_from_sql(&created_at)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn delete_snapshot(&self, id: &str) -> RuntimeResult<bool> {
        let conn = self.db.lock().await;
        let deleted = conn.execute("DELETE FROM snapshots WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }
}
