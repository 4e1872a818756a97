//! One LLM turn, from tool filtering to the final chunk.
//!
//! The handler owns the business rules of a turn: at most one tool call per
//! reply (extras are dropped with a logged warning), approval policy applies
//! to the chosen tool, and the assistant message is persisted before the
//! chunk is produced. Every turn ends in exactly one final chunk:
//! `tool_call`, `assistant_message`, or `error`.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::maestro::approval::{ApprovalManager, ApprovalRequestType, PendingApproval};
use crate::maestro::chunk::StreamChunk;
use crate::maestro::error::{RuntimeError, RuntimeResult};
use crate::maestro::event::{EventHandler, RuntimeEvent};
use crate::maestro::provider::{LlmClient, LlmResponse, TokenUsage};
use crate::maestro::repo::ConversationRepo;
use crate::maestro::session::{Message, ToolCall};
use crate::maestro::tools::ToolRegistry;

/// An LLM reply after the turn's business rules were applied.
#[derive(Debug, Clone)]
pub struct ProcessedResponse {
    pub content: String,
    /// The single surviving tool call, if the reply carried any.
    pub tool_call: Option<ToolCall>,
    pub requires_approval: bool,
    pub approval_reason: Option<String>,
    pub validation_warnings: Vec<String>,
    pub usage: TokenUsage,
    pub model: String,
}

/// Coordinator for a single LLM turn.
pub struct StreamLlmHandler {
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    conversations: Arc<dyn ConversationRepo>,
    approvals: Arc<ApprovalManager>,
    events: Arc<dyn EventHandler>,
    model: String,
}

impl StreamLlmHandler {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
        conversations: Arc<dyn ConversationRepo>,
        approvals: Arc<ApprovalManager>,
        events: Arc<dyn EventHandler>,
        model: impl Into<String>,
    ) -> Self {
        StreamLlmHandler {
            llm,
            tools,
            conversations,
            approvals,
            events,
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Run one turn over the given history and return its final chunk.
    ///
    /// Failures are folded into a terminal `error` chunk after publishing
    /// `RequestFailed`; the caller only ever has one chunk to forward.
    pub async fn handle_turn(
        &self,
        session_id: &str,
        history: Vec<Value>,
        allowed_tools: Option<&[String]>,
    ) -> StreamChunk {
        match self.run_turn(session_id, history, allowed_tools).await {
            Ok(chunk) => chunk,
            Err(err) => {
                log::error!("LLM turn failed for session {}: {}", session_id, err);
                self.events
                    .on_event(&RuntimeEvent::RequestFailed {
                        session_id: session_id.to_string(),
                        model: self.model.clone(),
                        error: err.to_string(),
                    })
                    .await;
                StreamChunk::error(err.to_string())
            }
        }
    }

    async fn run_turn(
        &self,
        session_id: &str,
        history: Vec<Value>,
        allowed_tools: Option<&[String]>,
    ) -> RuntimeResult<StreamChunk> {
        let tools = self.tools.filter(allowed_tools);

        self.events
            .on_event(&RuntimeEvent::RequestStarted {
                session_id: session_id.to_string(),
                model: self.model.clone(),
                message_count: history.len(),
                tool_count: tools.len(),
            })
            .await;

        let started = Instant::now();
        let response = self
            .llm
            .chat_completion(&self.model, &history, &tools, None, None)
            .await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        log::debug!(
            "LLM response for session {}: content={} chars, tool_calls={}, {}ms",
            session_id,
            response.content.len(),
            response.tool_calls.len(),
            duration_ms
        );

        let processed = self.process_response(response);
        for warning in &processed.validation_warnings {
            log::warn!("ValidationWarning: {}", warning);
        }

        let chunk = match &processed.tool_call {
            Some(_) => self.finish_tool_call(session_id, &processed).await?,
            None => self.finish_assistant_message(session_id, &processed).await?,
        };

        self.events
            .on_event(&RuntimeEvent::RequestCompleted {
                session_id: session_id.to_string(),
                model: processed.model.clone(),
                duration_ms,
                usage: processed.usage.clone(),
                has_tool_calls: processed.tool_call.is_some(),
            })
            .await;

        Ok(chunk)
    }

    /// Apply the turn invariants to a raw reply.
    ///
    /// Rule 1: at most one tool call per turn; extras are dropped and a
    /// warning recorded. Rule 2: the approval policy decides on the chosen
    /// tool. Rule 3: a reply with neither content nor tool calls is flagged.
    pub fn process_response(&self, response: LlmResponse) -> ProcessedResponse {
        let mut warnings = Vec::new();
        let mut calls = response.tool_calls;

        if calls.len() > 1 {
            warnings.push(format!(
                "LLM attempted to call {} tools simultaneously. Only the first tool will be \
                 executed. Tools: {:?}",
                calls.len(),
                calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>()
            ));
            calls.truncate(1);
        }

        let tool_call = calls.into_iter().next();
        let (requires_approval, approval_reason) = match &tool_call {
            Some(call) => self.approvals.should_require_approval(
                ApprovalRequestType::Tool,
                &call.name,
                &call.arguments,
            ),
            None => (false, None),
        };

        if response.content.trim().is_empty() && tool_call.is_none() {
            warnings.push("LLM returned empty content without tool calls".to_string());
        }

        ProcessedResponse {
            content: response.content,
            tool_call,
            requires_approval,
            approval_reason,
            validation_warnings: warnings,
            usage: response.usage,
            model: response.model,
        }
    }

    async fn finish_tool_call(
        &self,
        session_id: &str,
        processed: &ProcessedResponse,
    ) -> RuntimeResult<StreamChunk> {
        let call = processed
            .tool_call
            .clone()
            .ok_or_else(|| RuntimeError::ToolValidation("no tool call in reply".to_string()))?;

        log::info!(
            "tool call detected for session {}: {} (call_id={})",
            session_id,
            call.name,
            call.id
        );

        // Schema mismatches are surfaced to the caller, not fatal to the
        // turn; the IDE-side executor gets the final say.
        let mut schema_warning = None;
        if let Err(err) = self.tools.validate_call(&call.name, &call.arguments) {
            log::warn!("ValidationWarning: {}", err);
            schema_warning = Some(err.to_string());
        }

        self.persist_assistant_message(
            session_id,
            Message::assistant("").with_tool_calls(vec![call.clone()]),
        )
        .await?;

        self.events
            .on_event(&RuntimeEvent::ToolExecutionRequested {
                session_id: session_id.to_string(),
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
            })
            .await;

        let mut warnings = processed.validation_warnings.clone();
        if let Some(warning) = schema_warning {
            warnings.push(warning);
        }
        let mut metadata = json!({});
        if !warnings.is_empty() {
            metadata["validation_warnings"] = json!(warnings);
        }

        if processed.requires_approval {
            let reason = processed
                .approval_reason
                .clone()
                .unwrap_or_else(|| "Approval required by policy".to_string());
            let request_id = format!("tool-approval-{}", call.id);
            self.approvals
                .add_pending(PendingApproval::new(
                    &request_id,
                    ApprovalRequestType::Tool,
                    &call.name,
                    session_id,
                    json!({
                        "call_id": call.id,
                        "tool_name": call.name,
                        "arguments": call.arguments,
                    }),
                    Some(reason.clone()),
                ))
                .await?;
            self.events
                .on_event(&RuntimeEvent::ToolApprovalRequired {
                    session_id: session_id.to_string(),
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    reason,
                })
                .await;
            metadata["approval_request_id"] = json!(request_id);
        }

        Ok(
            StreamChunk::tool_call(
                call.id,
                call.name,
                call.arguments,
                processed.requires_approval,
            )
            .with_metadata(metadata),
        )
    }

    async fn finish_assistant_message(
        &self,
        session_id: &str,
        processed: &ProcessedResponse,
    ) -> RuntimeResult<StreamChunk> {
        log::info!(
            "assistant message for session {}: {} chars",
            session_id,
            processed.content.len()
        );

        self.persist_assistant_message(session_id, Message::assistant(&processed.content))
            .await?;

        let mut chunk = StreamChunk::assistant_message(&processed.content);
        if !processed.validation_warnings.is_empty() {
            chunk = chunk.with_metadata(json!({
                "validation_warnings": processed.validation_warnings,
            }));
        }
        Ok(chunk)
    }

    async fn persist_assistant_message(
        &self,
        session_id: &str,
        message: Message,
    ) -> RuntimeResult<()> {
        let mut conversation = self
            .conversations
            .find_by_id(session_id)
            .await?
            .ok_or_else(|| RuntimeError::NotFound(format!("conversation {}", session_id)))?;
        conversation.add_message(message)?;
        self.conversations.save(&conversation).await
    }

    /// Allocate a provider-style call id for synthetic tool calls.
    pub fn new_call_id() -> String {
        format!("call_{}", Uuid::new_v4().simple())
    }
}
