//! Runtime event system.
//!
//! Provides a callback-based observability layer over the orchestration
//! pipeline. Implement [`EventHandler`] to receive notifications about LLM
//! round-trips, tool requests, approval lifecycle, and plan/subtask progress.
//! The handler is shared as `Arc<dyn EventHandler>` across services, and
//! events are published synchronously: by the time a publishing call
//! returns, every handler has observed the event. That ordering is what lets
//! a later request in a different transaction rely on the side effects of an
//! approval decision.

use async_trait::async_trait;

use crate::maestro::provider::TokenUsage;

/// Events emitted by the runtime services.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    // ── LLM turns ────────────────────────────────────────────────────────
    /// An LLM turn is about to call the provider.
    RequestStarted {
        session_id: String,
        model: String,
        message_count: usize,
        tool_count: usize,
    },
    /// The provider replied and the turn finished processing.
    RequestCompleted {
        session_id: String,
        model: String,
        duration_ms: u64,
        usage: TokenUsage,
        has_tool_calls: bool,
    },
    /// The turn failed; an `error` chunk was emitted.
    RequestFailed {
        session_id: String,
        model: String,
        error: String,
    },

    // ── Tool calls ───────────────────────────────────────────────────────
    /// The LLM requested a tool invocation.
    ToolExecutionRequested {
        session_id: String,
        call_id: String,
        tool_name: String,
    },
    /// The requested tool is gated behind human approval.
    ToolApprovalRequired {
        session_id: String,
        call_id: String,
        tool_name: String,
        reason: String,
    },

    // ── Approvals ────────────────────────────────────────────────────────
    /// A pending approval was queued.
    ApprovalRequested {
        request_id: String,
        session_id: String,
        request_type: String,
        subject: String,
    },
    /// A pending approval was approved.
    ApprovalApproved {
        request_id: String,
        session_id: String,
        request_type: String,
    },
    /// A pending approval was rejected.
    ApprovalRejected {
        request_id: String,
        session_id: String,
        request_type: String,
        reason: Option<String>,
    },

    // ── Subtasks ─────────────────────────────────────────────────────────
    /// A subtask moved to running.
    SubtaskStarted {
        plan_id: String,
        subtask_id: String,
        agent: String,
    },
    /// A subtask finished successfully.
    SubtaskCompleted { plan_id: String, subtask_id: String },
    /// A subtask ended failed.
    SubtaskFailed {
        plan_id: String,
        subtask_id: String,
        error: String,
    },
    /// A failed subtask was reset for another attempt.
    SubtaskRetried {
        plan_id: String,
        subtask_id: String,
        retry_count: u32,
    },

    // ── Plans ────────────────────────────────────────────────────────────
    /// Plan execution began.
    PlanExecutionStarted { plan_id: String, session_id: String },
    /// Every subtask finished successfully.
    PlanCompleted {
        plan_id: String,
        total_subtasks: usize,
        successful_subtasks: usize,
    },
    /// A subtask failure stopped the plan.
    PlanFailed { plan_id: String, error: String },
    /// The plan was cancelled before completion.
    PlanCancelled { plan_id: String, reason: String },
}

/// Trait for receiving runtime events.
///
/// The method has a default no-op implementation, so handlers only need to
/// match the variants they care about. Handlers must be `Send + Sync` so the
/// same instance can be shared across services and tokio tasks.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called synchronously for every published event.
    async fn on_event(&self, _event: &RuntimeEvent) {}
}

/// Default handler that mirrors events into the log.
pub struct LoggingEventHandler;

#[async_trait]
impl EventHandler for LoggingEventHandler {
    async fn on_event(&self, event: &RuntimeEvent) {
        match event {
            RuntimeEvent::RequestFailed {
                session_id, error, ..
            } => {
                log::error!("llm request failed for session {}: {}", session_id, error);
            }
            RuntimeEvent::SubtaskFailed {
                plan_id,
                subtask_id,
                error,
            } => {
                log::error!(
                    "subtask {} of plan {} failed: {}",
                    subtask_id,
                    plan_id,
                    error
                );
            }
            RuntimeEvent::PlanFailed { plan_id, error } => {
                log::error!("plan {} failed: {}", plan_id, error);
            }
            other => log::debug!("runtime event: {:?}", other),
        }
    }
}
