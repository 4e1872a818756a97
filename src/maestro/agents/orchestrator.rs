//! Orchestrator agent: classification, routing, and plan coordination.
//!
//! The orchestrator is the first agent every inbound message meets. It
//! drives the FSM through classification, routes atomic tasks to a
//! specialist with a `switch_agent` chunk, and coordinates the complex path
//! internally: architect plan creation, the review chunk, and the pending
//! plan approval. When the approval request is emitted the orchestrator
//! returns [`OrchestratorOutcome::Suspended`]: execution resumes on a later
//! request carrying the decision, not in this call.

use std::sync::Arc;

use serde_json::json;

use crate::maestro::agent_context::AgentKind;
use crate::maestro::agents::{AgentRegistry, ArchitectAgent, Classification, TaskClassifier};
use crate::maestro::approval::{ApprovalManager, ApprovalRequestType, PendingApproval};
use crate::maestro::chunk::{emit, ChunkSender, ChunkType, StreamChunk};
use crate::maestro::error::RuntimeResult;
use crate::maestro::fsm::{requires_reset_for_new_message, FsmOrchestrator, TaskEvent, TaskState};
use crate::maestro::repo::PlanRepo;

/// What the orchestrator decided for this message.
#[derive(Debug, Clone)]
pub enum OrchestratorOutcome {
    /// Atomic task: dispatch the message to this specialist.
    RoutedTo {
        agent: AgentKind,
        reason: String,
        confidence: String,
    },
    /// Complex task: a plan approval is pending; release the lock and
    /// return to the transport.
    Suspended,
    /// The orchestrator finished the call itself (typically after emitting
    /// an error chunk).
    Completed,
}

pub struct OrchestratorAgent {
    fsm: Arc<FsmOrchestrator>,
    classifier: Arc<TaskClassifier>,
    registry: Arc<AgentRegistry>,
    architect: Arc<ArchitectAgent>,
    approvals: Arc<ApprovalManager>,
    plans: Arc<dyn PlanRepo>,
}

impl OrchestratorAgent {
    pub fn new(
        fsm: Arc<FsmOrchestrator>,
        classifier: Arc<TaskClassifier>,
        registry: Arc<AgentRegistry>,
        architect: Arc<ArchitectAgent>,
        approvals: Arc<ApprovalManager>,
        plans: Arc<dyn PlanRepo>,
    ) -> Self {
        OrchestratorAgent {
            fsm,
            classifier,
            registry,
            architect,
            approvals,
            plans,
        }
    }

    /// Process one inbound user message.
    pub async fn process(
        &self,
        session_id: &str,
        message: &str,
        tx: &ChunkSender,
    ) -> RuntimeResult<OrchestratorOutcome> {
        log::info!("orchestrator processing request for session {}", session_id);

        let mut state = self.fsm.current_state(session_id).await?;

        // A follow-up message implicitly abandons whatever interactive step
        // the FSM was parked in.
        if requires_reset_for_new_message(state) {
            log::info!(
                "resetting FSM from {} to idle for new message in session {}",
                state.as_str(),
                session_id
            );
            match state {
                TaskState::Completed => {
                    self.fsm
                        .transition(
                            session_id,
                            TaskEvent::Reset,
                            Some(json!({"reason": "new_message"})),
                        )
                        .await?;
                }
                TaskState::PlanReview => {
                    // A new message instead of a decision counts as rejection.
                    self.fsm
                        .transition(
                            session_id,
                            TaskEvent::PlanRejected,
                            Some(json!({"reason": "new_message"})),
                        )
                        .await?;
                    self.fsm.reset(session_id).await?;
                }
                _ => self.fsm.reset(session_id).await?,
            }
            state = TaskState::Idle;
        }

        if state == TaskState::Idle {
            self.fsm
                .transition(
                    session_id,
                    TaskEvent::ReceiveMessage,
                    Some(json!({"message": preview(message)})),
                )
                .await?;
        }

        // Single-agent mode is decided by registry contents, not a flag.
        if self.registry.is_single_agent_mode() {
            let classification = Classification {
                is_atomic: true,
                agent: "universal".to_string(),
                confidence: "high".to_string(),
                reason: "Single-agent mode: only the universal agent is available".to_string(),
                method: "llm",
            };
            self.fsm
                .transition(
                    session_id,
                    TaskEvent::IsAtomicTrue,
                    Some(classification.to_metadata()),
                )
                .await?;
            self.emit_switch(session_id, AgentKind::Universal, &classification, tx)
                .await?;
            return Ok(OrchestratorOutcome::RoutedTo {
                agent: AgentKind::Universal,
                reason: classification.reason,
                confidence: classification.confidence,
            });
        }

        let classification = self.classifier.classify(message).await;
        let target = match classification.agent.as_str() {
            "plan" => AgentKind::Architect,
            "debug" => AgentKind::Debug,
            "explain" => AgentKind::Ask,
            _ => AgentKind::Coder,
        };

        if classification.is_atomic {
            self.fsm
                .transition(
                    session_id,
                    TaskEvent::IsAtomicTrue,
                    Some(classification.to_metadata()),
                )
                .await?;
            self.emit_switch(session_id, target, &classification, tx).await?;
            return Ok(OrchestratorOutcome::RoutedTo {
                agent: target,
                reason: classification.reason,
                confidence: classification.confidence,
            });
        }

        // Complex path.
        self.fsm
            .transition(
                session_id,
                TaskEvent::IsAtomicFalse,
                Some(classification.to_metadata()),
            )
            .await?;
        self.fsm
            .transition(
                session_id,
                TaskEvent::RouteToArchitect,
                Some(json!({"target_agent": target.as_str()})),
            )
            .await?;

        self.coordinate_planning(session_id, message, tx).await
    }

    async fn emit_switch(
        &self,
        session_id: &str,
        target: AgentKind,
        classification: &Classification,
        tx: &ChunkSender,
    ) -> RuntimeResult<()> {
        let state = self.fsm.current_state(session_id).await?;
        log::info!(
            "orchestrator routing to {} agent for session {} (state: {}, confidence: {})",
            target,
            session_id,
            state.as_str(),
            classification.confidence
        );
        let mut metadata = classification.to_metadata();
        metadata["target_agent"] = json!(target.as_str());
        metadata["fsm_state"] = json!(state.as_str());
        emit(
            tx,
            StreamChunk::switch_agent(format!("Routing to {} agent", target))
                .with_metadata(metadata),
        )
        .await;
        Ok(())
    }

    /// Drive the complex path up to the approval gate: create the plan, show
    /// it for review, queue the pending approval, suspend.
    async fn coordinate_planning(
        &self,
        session_id: &str,
        message: &str,
        tx: &ChunkSender,
    ) -> RuntimeResult<OrchestratorOutcome> {
        emit(
            tx,
            StreamChunk::status("Routing to architect for planning...").with_metadata(json!({
                "routing_to": "architect",
                "reason": "Complex task requires planning phase",
                "fsm_state": TaskState::ArchitectPlanning.as_str(),
            })),
        )
        .await;

        let plan_id = match self
            .architect
            .create_plan(session_id, message, &json!(null))
            .await
        {
            Ok(plan_id) => plan_id,
            Err(err) => {
                log::error!("plan creation failed for session {}: {}", session_id, err);
                self.fsm
                    .transition(
                        session_id,
                        TaskEvent::PlanningFailed,
                        Some(json!({"error": err.to_string()})),
                    )
                    .await?;
                emit(
                    tx,
                    StreamChunk::error(format!("Plan creation failed: {}", err)).with_metadata(
                        json!({"fsm_state": TaskState::ErrorHandling.as_str()}),
                    ),
                )
                .await;
                return Ok(OrchestratorOutcome::Completed);
            }
        };

        self.fsm
            .transition(
                session_id,
                TaskEvent::PlanCreated,
                Some(json!({"plan_id": plan_id})),
            )
            .await?;

        let plan = match self.plans.find_by_id(&plan_id).await? {
            Some(plan) => plan,
            None => {
                emit(
                    tx,
                    StreamChunk::error(format!("Plan {} vanished after creation", plan_id)),
                )
                .await;
                return Ok(OrchestratorOutcome::Completed);
            }
        };
        let summary = plan.summary();

        let mut review = StreamChunk::new(ChunkType::PlanCreated);
        review.content = Some(plan.format_for_review());
        review.plan_id = Some(plan_id.clone());
        review.plan_summary = Some(summary.clone());
        review.metadata = Some(json!({
            "fsm_state": TaskState::PlanReview.as_str(),
            "requires_approval": true,
        }));
        emit(tx, review).await;

        let request_id = format!("plan-approval-{}", plan_id);
        let subject: String = plan.goal.chars().take(100).collect();
        self.approvals
            .add_pending(PendingApproval::new(
                &request_id,
                ApprovalRequestType::Plan,
                subject,
                session_id,
                json!({
                    "plan_id": plan_id,
                    "goal": plan.goal,
                    "subtasks_count": plan.subtasks.len(),
                    "total_estimated_time": plan.total_estimated_time(),
                    "subtasks": summary["subtasks"],
                }),
                Some("Complex plan requires user approval before execution".to_string()),
            ))
            .await?;

        log::info!(
            "plan approval request created: {}, awaiting user decision",
            request_id
        );

        let mut gate = StreamChunk::new(ChunkType::PlanApprovalRequired);
        gate.content = Some("Plan requires your approval before execution".to_string());
        gate.approval_request_id = Some(request_id);
        gate.plan_id = Some(plan_id.clone());
        gate.plan_summary = Some(summary);
        gate.metadata = Some(json!({"fsm_state": TaskState::PlanReview.as_str()}));
        gate.is_final = true;
        emit(tx, gate).await;

        log::info!(
            "waiting for user approval for plan {}; execution paused in plan_review",
            plan_id
        );
        Ok(OrchestratorOutcome::Suspended)
    }
}

fn preview(text: &str) -> String {
    let normalized = text.replace(['\n', '\r'], " ");
    let mut chars = normalized.chars();
    let preview: String = chars.by_ref().take(120).collect();
    if chars.next().is_some() {
        format!("{}...", preview)
    } else {
        preview
    }
}
