//! Specialist worker turns.
//!
//! Every non-orchestrator agent processes messages the same way: install its
//! system prompt at the head of the history, run one LLM turn through the
//! stream handler, and police the resulting chunk against its own tool
//! allow-list and file restrictions. The per-agent differences live entirely
//! in the [`AgentProfile`].

use std::sync::Arc;

use crate::maestro::agents::AgentProfile;
use crate::maestro::chunk::{emit, ChunkSender, ChunkType, StreamChunk};
use crate::maestro::error::{RuntimeError, RuntimeResult};
use crate::maestro::repo::ConversationRepo;
use crate::maestro::session::Role;
use crate::maestro::stream_handler::StreamLlmHandler;

/// One specialist agent bound to its profile.
pub struct WorkerAgent {
    profile: AgentProfile,
    handler: Arc<StreamLlmHandler>,
    conversations: Arc<dyn ConversationRepo>,
}

impl WorkerAgent {
    pub fn new(
        profile: AgentProfile,
        handler: Arc<StreamLlmHandler>,
        conversations: Arc<dyn ConversationRepo>,
    ) -> Self {
        WorkerAgent {
            profile,
            handler,
            conversations,
        }
    }

    pub fn profile(&self) -> &AgentProfile {
        &self.profile
    }

    /// Run one turn over the conversation's current history and forward the
    /// resulting chunk.
    ///
    /// The inbound message (if any) was already appended by the caller under
    /// the session lock; this only reads the log, runs the turn, and
    /// enforces the profile's restrictions on the outcome.
    pub async fn process(&self, session_id: &str, tx: &ChunkSender) -> RuntimeResult<()> {
        log::info!(
            "{} agent processing turn for session {}",
            self.profile.kind,
            session_id
        );

        let conversation = self
            .conversations
            .find_by_id(session_id)
            .await?
            .ok_or_else(|| RuntimeError::NotFound(format!("conversation {}", session_id)))?;

        // Install this agent's system prompt at the head of the history.
        let mut history = conversation.history_for_llm(None);
        let prompt = serde_json::json!({
            "role": "system",
            "content": self.profile.system_prompt,
        });
        if conversation
            .messages
            .first()
            .map(|m| m.role == Role::System)
            .unwrap_or(false)
        {
            history[0] = prompt;
        } else {
            history.insert(0, prompt);
        }

        let chunk = self
            .handler
            .handle_turn(session_id, history, Some(&self.profile.allowed_tools))
            .await;

        if let Some(denied) = self.policy_violation(&chunk) {
            log::warn!(
                "{} agent attempted forbidden action: {}",
                self.profile.kind,
                denied
            );
            emit(tx, StreamChunk::error(denied)).await;
            return Ok(());
        }

        emit(tx, chunk).await;
        Ok(())
    }

    /// Check a turn's final chunk against the agent's allow-list and file
    /// restrictions. Returns the refusal message on violation.
    fn policy_violation(&self, chunk: &StreamChunk) -> Option<String> {
        if chunk.chunk_type != ChunkType::ToolCall {
            return None;
        }
        let tool_name = chunk.tool_name.as_deref().unwrap_or_default();
        if !self.profile.can_use_tool(tool_name) {
            return Some(format!(
                "Tool '{}' is not allowed for {} agent",
                tool_name, self.profile.kind
            ));
        }
        if tool_name == "write_file" {
            let path = chunk
                .arguments
                .as_ref()
                .and_then(|a| a.get("path"))
                .and_then(|p| p.as_str())
                .unwrap_or_default();
            if !self.profile.can_edit_file(path) {
                return Some(format!(
                    "{} agent is not allowed to edit '{}'",
                    self.profile.kind, path
                ));
            }
        }
        None
    }
}
