//! Message orchestration facade.
//!
//! Single entry point for the transport. Every handler acquires the
//! conversation's lock for the full duration of processing, including
//! streaming and synchronous persistence, then dispatches by inbound kind:
//! user message, tool result, tool decision, or plan decision. The lock is
//! never held across the human-approval gate: when a `plan_approval_required`
//! chunk goes out the handler returns, and the request that carries the
//! decision re-acquires the lock.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::maestro::agent_context::{AgentContext, AgentKind};
use crate::maestro::agents::{AgentRegistry, OrchestratorAgent, OrchestratorOutcome, WorkerAgent};
use crate::maestro::approval::{ApprovalManager, ApprovalRequestType, PendingApproval};
use crate::maestro::chunk::{emit, ChunkSender, StreamChunk};
use crate::maestro::error::{RuntimeError, RuntimeResult};
use crate::maestro::fsm::{FsmOrchestrator, TaskEvent, TaskState};
use crate::maestro::locks::SessionLocks;
use crate::maestro::plan::PlanStatus;
use crate::maestro::plan_service::PlanExecutionService;
use crate::maestro::repo::{AgentContextRepo, ConversationRepo, PlanRepo};
use crate::maestro::session::Message;
use crate::maestro::stream_handler::StreamLlmHandler;

/// Decision values accepted on the decision endpoints.
pub const DECISION_APPROVE: &str = "approve";
pub const DECISION_REJECT: &str = "reject";
pub const DECISION_MODIFY: &str = "modify";

pub struct MessageFacade {
    locks: Arc<SessionLocks>,
    conversations: Arc<dyn ConversationRepo>,
    contexts: Arc<dyn AgentContextRepo>,
    plans: Arc<dyn PlanRepo>,
    fsm: Arc<FsmOrchestrator>,
    approvals: Arc<ApprovalManager>,
    registry: Arc<AgentRegistry>,
    orchestrator: Arc<OrchestratorAgent>,
    plan_service: Arc<PlanExecutionService>,
    handler: Arc<StreamLlmHandler>,
}

impl MessageFacade {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        locks: Arc<SessionLocks>,
        conversations: Arc<dyn ConversationRepo>,
        contexts: Arc<dyn AgentContextRepo>,
        plans: Arc<dyn PlanRepo>,
        fsm: Arc<FsmOrchestrator>,
        approvals: Arc<ApprovalManager>,
        registry: Arc<AgentRegistry>,
        orchestrator: Arc<OrchestratorAgent>,
        plan_service: Arc<PlanExecutionService>,
        handler: Arc<StreamLlmHandler>,
    ) -> Self {
        MessageFacade {
            locks,
            conversations,
            contexts,
            plans,
            fsm,
            approvals,
            registry,
            orchestrator,
            plan_service,
            handler,
        }
    }

    /// Inbound user message: append, orchestrate, dispatch.
    pub async fn handle_user_message(&self, session_id: &str, content: &str, tx: &ChunkSender) {
        let _guard = self.locks.acquire(session_id).await;
        if let Err(err) = self.user_message_inner(session_id, content, tx).await {
            self.surface_error(session_id, err, tx).await;
        }
    }

    async fn user_message_inner(
        &self,
        session_id: &str,
        content: &str,
        tx: &ChunkSender,
    ) -> RuntimeResult<()> {
        let mut conversation = self
            .conversations
            .find_by_id(session_id)
            .await?
            .ok_or_else(|| RuntimeError::NotFound(format!("conversation {}", session_id)))?;
        conversation.add_message(Message::user(content))?;
        self.conversations.save(&conversation).await?;

        match self.orchestrator.process(session_id, content, tx).await? {
            OrchestratorOutcome::RoutedTo {
                agent,
                reason,
                confidence,
            } => {
                self.record_switch(session_id, agent, &reason, &confidence)
                    .await?;
                let worker = self.worker_for(agent)?;
                worker.process(session_id, tx).await
            }
            // Plan approval pending: release the lock and return to the
            // transport. A later request resumes the flow.
            OrchestratorOutcome::Suspended => Ok(()),
            OrchestratorOutcome::Completed => Ok(()),
        }
    }

    /// Completion callback from the IDE-side tool executor.
    pub async fn handle_tool_result(
        &self,
        session_id: &str,
        tool_call_id: &str,
        result: &str,
        is_error: bool,
        tx: &ChunkSender,
    ) {
        let _guard = self.locks.acquire(session_id).await;
        if let Err(err) = self
            .tool_result_inner(session_id, tool_call_id, result, is_error, tx)
            .await
        {
            self.surface_error(session_id, err, tx).await;
        }
    }

    async fn tool_result_inner(
        &self,
        session_id: &str,
        tool_call_id: &str,
        result: &str,
        is_error: bool,
        tx: &ChunkSender,
    ) -> RuntimeResult<()> {
        let mut conversation = self
            .conversations
            .find_by_id(session_id)
            .await?
            .ok_or_else(|| RuntimeError::NotFound(format!("conversation {}", session_id)))?;

        // Pair the result to the stored assistant tool call.
        let tool_name = conversation
            .find_tool_call(tool_call_id)
            .map(|(_, call)| call.name.clone())
            .ok_or_else(|| {
                RuntimeError::NotFound(format!(
                    "no assistant tool call {} in conversation {}",
                    tool_call_id, session_id
                ))
            })?;

        let mut message = Message::tool(tool_call_id, result).with_name(&tool_name);
        if is_error {
            message.metadata = Some(json!({"is_error": true}));
        }
        conversation.add_message(message)?;
        self.conversations.save(&conversation).await?;

        log::info!(
            "tool result recorded for session {} ({}: {} chars, error={})",
            session_id,
            tool_name,
            result.len(),
            is_error
        );

        // A tool result inside an in-progress plan belongs to that plan's
        // execution; resuming the turn continues the current subtask.
        if let Some(plan) = self.plans.find_active_for_conversation(session_id).await? {
            if plan.status == PlanStatus::InProgress {
                log::info!(
                    "session {} has plan {} in progress; treating turn as plan execution",
                    session_id,
                    plan.id
                );
            }
        }

        self.resume_current_agent(session_id, tx).await
    }

    /// Human decision on a pending tool approval.
    pub async fn handle_tool_decision(
        &self,
        session_id: &str,
        approval_request_id: &str,
        decision: &str,
        modified_arguments: Option<Value>,
        tx: &ChunkSender,
    ) {
        let _guard = self.locks.acquire(session_id).await;
        if let Err(err) = self
            .tool_decision_inner(session_id, approval_request_id, decision, modified_arguments, tx)
            .await
        {
            self.surface_error(session_id, err, tx).await;
        }
    }

    async fn tool_decision_inner(
        &self,
        session_id: &str,
        approval_request_id: &str,
        decision: &str,
        modified_arguments: Option<Value>,
        tx: &ChunkSender,
    ) -> RuntimeResult<()> {
        match decision {
            DECISION_APPROVE => {
                let approval = self.approvals.approve(approval_request_id).await?;
                let call_id = detail_str(&approval.details, "call_id");
                let tool_name = detail_str(&approval.details, "tool_name");
                let mut metadata = json!({
                    "approval_request_id": approval_request_id,
                    "call_id": call_id,
                    "tool_name": tool_name,
                });
                if let Some(arguments) = modified_arguments {
                    metadata["modified_arguments"] = arguments;
                }
                // The IDE executes the approved call and reports back via the
                // tool-result endpoint; the turn resumes there.
                emit(
                    tx,
                    StreamChunk::status(format!(
                        "Tool '{}' approved; executing",
                        tool_name
                    ))
                    .with_metadata(metadata)
                    .finalize(true),
                )
                .await;
                Ok(())
            }
            DECISION_REJECT => {
                let approval = self
                    .approvals
                    .reject(approval_request_id, Some("rejected by user".to_string()))
                    .await?;
                let call_id = detail_str(&approval.details, "call_id");
                let tool_name = detail_str(&approval.details, "tool_name");

                let mut conversation = self
                    .conversations
                    .find_by_id(session_id)
                    .await?
                    .ok_or_else(|| {
                        RuntimeError::NotFound(format!("conversation {}", session_id))
                    })?;
                conversation.add_message(
                    Message::tool(
                        call_id,
                        format!("Tool execution rejected by the user: {}", tool_name),
                    )
                    .with_name(&tool_name),
                )?;
                self.conversations.save(&conversation).await?;

                self.resume_current_agent(session_id, tx).await
            }
            other => Err(RuntimeError::MessageValidation(format!(
                "unknown tool decision '{}'",
                other
            ))),
        }
    }

    /// Human decision on a pending plan approval.
    pub async fn handle_plan_decision(
        &self,
        session_id: &str,
        approval_request_id: &str,
        decision: &str,
        feedback: Option<String>,
        tx: &ChunkSender,
    ) {
        let _guard = self.locks.acquire(session_id).await;
        if let Err(err) = self
            .plan_decision_inner(session_id, approval_request_id, decision, feedback, tx)
            .await
        {
            self.surface_error(session_id, err, tx).await;
        }
    }

    async fn plan_decision_inner(
        &self,
        session_id: &str,
        approval_request_id: &str,
        decision: &str,
        feedback: Option<String>,
        tx: &ChunkSender,
    ) -> RuntimeResult<()> {
        let pending = self
            .approvals
            .get_pending(approval_request_id)
            .await?
            .ok_or_else(|| RuntimeError::ApprovalNotFound(approval_request_id.to_string()))?;
        let plan_id = pending
            .details
            .get("plan_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                RuntimeError::ApprovalNotFound(format!(
                    "approval {} carries no plan id",
                    approval_request_id
                ))
            })?
            .to_string();

        match decision {
            DECISION_APPROVE => {
                self.approvals.approve(approval_request_id).await?;
                self.fsm
                    .transition(
                        session_id,
                        TaskEvent::PlanApproved,
                        Some(json!({"plan_id": plan_id, "approved_by": "user"})),
                    )
                    .await?;

                let mut plan = self
                    .plans
                    .find_by_id(&plan_id)
                    .await?
                    .ok_or_else(|| RuntimeError::NotFound(format!("plan {}", plan_id)))?;
                if plan.status == PlanStatus::Draft {
                    plan.approve()?;
                    self.plans.save(&plan, true).await?;
                }

                emit(
                    tx,
                    StreamChunk::status(format!(
                        "Executing plan with {} subtasks...",
                        plan.subtasks.len()
                    ))
                    .with_metadata(json!({
                        "plan_id": plan_id,
                        "fsm_state": TaskState::PlanExecution.as_str(),
                    })),
                )
                .await;

                let execution = self
                    .plan_service
                    .execute(&plan_id, session_id, tx)
                    .await;
                self.settle_plan_fsm(session_id, &plan_id, execution, tx)
                    .await
            }
            DECISION_REJECT => {
                self.approvals
                    .reject(approval_request_id, feedback.clone())
                    .await?;
                self.fsm
                    .transition(
                        session_id,
                        TaskEvent::PlanRejected,
                        Some(json!({"reason": feedback.unwrap_or_else(|| "rejected".into())})),
                    )
                    .await?;
                let mut chunk =
                    StreamChunk::new(crate::maestro::chunk::ChunkType::PlanRejected);
                chunk.content = Some("Plan rejected".to_string());
                chunk.plan_id = Some(plan_id);
                chunk.is_final = true;
                emit(tx, chunk).await;
                Ok(())
            }
            DECISION_MODIFY => {
                self.approvals
                    .reject(
                        approval_request_id,
                        Some(format!(
                            "modification requested: {}",
                            feedback.clone().unwrap_or_default()
                        )),
                    )
                    .await?;
                self.fsm
                    .transition(
                        session_id,
                        TaskEvent::PlanModificationRequested,
                        Some(json!({"feedback": feedback})),
                    )
                    .await?;
                // Replanning hook: the architect picks the goal up again on
                // the next message.
                emit(
                    tx,
                    StreamChunk::status(
                        "Plan modification requested; send your revised goal to replan",
                    )
                    .with_metadata(json!({
                        "plan_id": plan_id,
                        "fsm_state": TaskState::ArchitectPlanning.as_str(),
                    }))
                    .finalize(true),
                )
                .await;
                Ok(())
            }
            other => Err(RuntimeError::MessageValidation(format!(
                "unknown plan decision '{}'",
                other
            ))),
        }
    }

    /// Retry a failed subtask by explicit request.
    pub async fn handle_subtask_retry(
        &self,
        session_id: &str,
        plan_id: &str,
        subtask_id: &str,
        tx: &ChunkSender,
    ) {
        let _guard = self.locks.acquire(session_id).await;
        let result = async {
            self.fsm
                .transition(
                    session_id,
                    TaskEvent::RetrySubtask,
                    Some(json!({"plan_id": plan_id, "subtask_id": subtask_id})),
                )
                .await?;
            self.plan_service
                .executor()
                .retry(plan_id, subtask_id, session_id, tx)
                .await
        }
        .await;
        if let Err(err) = result {
            self.surface_error(session_id, err, tx).await;
        }
    }

    /// Pending approvals for IDE recovery after a restart.
    pub async fn list_pending(
        &self,
        session_id: &str,
        request_type: Option<ApprovalRequestType>,
    ) -> RuntimeResult<Vec<PendingApproval>> {
        self.approvals.get_all_pending(session_id, request_type).await
    }

    /// Lock-free existence check used by the transport to shape 404s before
    /// opening a stream.
    pub async fn peek_pending(
        &self,
        request_id: &str,
    ) -> RuntimeResult<Option<PendingApproval>> {
        self.approvals.get_pending(request_id).await
    }

    /// Align the FSM with the plan's terminal status after an execution run.
    async fn settle_plan_fsm(
        &self,
        session_id: &str,
        plan_id: &str,
        execution: RuntimeResult<()>,
        tx: &ChunkSender,
    ) -> RuntimeResult<()> {
        if let Err(err) = execution {
            if self.fsm.current_state(session_id).await? == TaskState::PlanExecution {
                self.fsm
                    .transition(
                        session_id,
                        TaskEvent::PlanExecutionFailed,
                        Some(json!({"error": err.to_string()})),
                    )
                    .await?;
            }
            self.surface_error(session_id, err, tx).await;
            return Ok(());
        }

        let status = self
            .plans
            .find_by_id(plan_id)
            .await?
            .map(|p| p.status)
            .unwrap_or(PlanStatus::Failed);

        if self.fsm.current_state(session_id).await? != TaskState::PlanExecution {
            return Ok(());
        }

        match status {
            PlanStatus::Completed => {
                self.fsm
                    .transition(
                        session_id,
                        TaskEvent::PlanExecutionCompleted,
                        Some(json!({"plan_id": plan_id})),
                    )
                    .await?;
            }
            PlanStatus::Cancelled => {
                // Through error handling to the terminal state.
                self.fsm
                    .transition(
                        session_id,
                        TaskEvent::PlanExecutionFailed,
                        Some(json!({"plan_id": plan_id, "reason": "cancelled"})),
                    )
                    .await?;
                self.fsm
                    .transition(
                        session_id,
                        TaskEvent::PlanCancelled,
                        Some(json!({"plan_id": plan_id})),
                    )
                    .await?;
            }
            _ => {
                self.fsm
                    .transition(
                        session_id,
                        TaskEvent::PlanExecutionFailed,
                        Some(json!({"plan_id": plan_id})),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn record_switch(
        &self,
        session_id: &str,
        agent: AgentKind,
        reason: &str,
        confidence: &str,
    ) -> RuntimeResult<()> {
        let mut context = self
            .contexts
            .find_by_session_id(session_id)
            .await?
            .unwrap_or_else(|| AgentContext::new(session_id));
        if context.current_agent == agent {
            log::debug!(
                "agent {} already active for session {}; no switch recorded",
                agent,
                session_id
            );
            return Ok(());
        }
        context.switch_to(agent, reason, confidence)?;
        self.contexts.save(&context).await
    }

    async fn resume_current_agent(&self, session_id: &str, tx: &ChunkSender) -> RuntimeResult<()> {
        let current = self
            .contexts
            .find_by_session_id(session_id)
            .await?
            .map(|c| c.current_agent)
            .unwrap_or(AgentKind::Orchestrator);

        // The orchestrator never owns a tool loop; fall through to the
        // deployment's default worker.
        let agent = if current == AgentKind::Orchestrator {
            if self.registry.is_single_agent_mode() {
                AgentKind::Universal
            } else {
                AgentKind::Coder
            }
        } else {
            current
        };

        let worker = self.worker_for(agent)?;
        worker.process(session_id, tx).await
    }

    fn worker_for(&self, agent: AgentKind) -> RuntimeResult<WorkerAgent> {
        let profile = self
            .registry
            .get(agent)
            .ok_or_else(|| {
                RuntimeError::AgentSwitch(format!("agent '{}' is not registered", agent))
            })?
            .clone();
        Ok(WorkerAgent::new(
            profile,
            self.handler.clone(),
            self.conversations.clone(),
        ))
    }

    /// Every failing path emits exactly one terminal error chunk.
    async fn surface_error(&self, session_id: &str, err: RuntimeError, tx: &ChunkSender) {
        log::error!("request failed for session {}: {}", session_id, err);
        let fsm_state = self
            .fsm
            .current_state(session_id)
            .await
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let mut metadata = json!({"fsm_state": fsm_state});
        if err.is_not_found() {
            metadata["code"] = json!("not_found");
        }
        emit(tx, StreamChunk::error(err.to_string()).with_metadata(metadata)).await;
    }
}

fn detail_str(details: &Value, key: &str) -> String {
    details
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}
