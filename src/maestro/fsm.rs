//! Per-conversation task lifecycle state machine.
//!
//! The transition matrix below is authoritative: any `(state, event)` pair
//! not listed is a hard error, raised and never recovered. Each transition
//! persists the new state together with shallow-merged metadata after
//! validation, so the lifecycle survives across HTTP requests. The in-memory
//! context map is a write-through cache over the repository; memory is
//! never the source of truth.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::maestro::error::{RuntimeError, RuntimeResult};
use crate::maestro::repo::FsmStateRepo;

/// Lifecycle states of a conversation's current task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    Classify,
    PlanRequired,
    ArchitectPlanning,
    Execution,
    PlanReview,
    PlanExecution,
    ErrorHandling,
    Completed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Idle => "idle",
            TaskState::Classify => "classify",
            TaskState::PlanRequired => "plan_required",
            TaskState::ArchitectPlanning => "architect_planning",
            TaskState::Execution => "execution",
            TaskState::PlanReview => "plan_review",
            TaskState::PlanExecution => "plan_execution",
            TaskState::ErrorHandling => "error_handling",
            TaskState::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<TaskState> {
        match value {
            "idle" => Some(TaskState::Idle),
            "classify" => Some(TaskState::Classify),
            "plan_required" => Some(TaskState::PlanRequired),
            "architect_planning" => Some(TaskState::ArchitectPlanning),
            "execution" => Some(TaskState::Execution),
            "plan_review" => Some(TaskState::PlanReview),
            "plan_execution" => Some(TaskState::PlanExecution),
            "error_handling" => Some(TaskState::ErrorHandling),
            "completed" => Some(TaskState::Completed),
            _ => None,
        }
    }
}

/// Events driving transitions between task states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEvent {
    ReceiveMessage,
    IsAtomicTrue,
    IsAtomicFalse,
    ClassifyError,
    RouteToArchitect,
    PlanCreated,
    PlanningFailed,
    PlanApproved,
    PlanRejected,
    PlanModificationRequested,
    PlanExecutionCompleted,
    PlanExecutionFailed,
    AllSubtasksDone,
    SubtaskFailed,
    RequiresReplanning,
    RetrySubtask,
    PlanCancelled,
    Reset,
}

impl TaskEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskEvent::ReceiveMessage => "receive_message",
            TaskEvent::IsAtomicTrue => "is_atomic_true",
            TaskEvent::IsAtomicFalse => "is_atomic_false",
            TaskEvent::ClassifyError => "classify_error",
            TaskEvent::RouteToArchitect => "route_to_architect",
            TaskEvent::PlanCreated => "plan_created",
            TaskEvent::PlanningFailed => "planning_failed",
            TaskEvent::PlanApproved => "plan_approved",
            TaskEvent::PlanRejected => "plan_rejected",
            TaskEvent::PlanModificationRequested => "plan_modification_requested",
            TaskEvent::PlanExecutionCompleted => "plan_execution_completed",
            TaskEvent::PlanExecutionFailed => "plan_execution_failed",
            TaskEvent::AllSubtasksDone => "all_subtasks_done",
            TaskEvent::SubtaskFailed => "subtask_failed",
            TaskEvent::RequiresReplanning => "requires_replanning",
            TaskEvent::RetrySubtask => "retry_subtask",
            TaskEvent::PlanCancelled => "plan_cancelled",
            TaskEvent::Reset => "reset",
        }
    }
}

/// The authoritative transition matrix. Only these pairs are valid.
pub const TRANSITIONS: &[(TaskState, TaskEvent, TaskState)] = &[
    (TaskState::Idle, TaskEvent::ReceiveMessage, TaskState::Classify),
    (TaskState::Classify, TaskEvent::IsAtomicTrue, TaskState::Execution),
    (TaskState::Classify, TaskEvent::IsAtomicFalse, TaskState::PlanRequired),
    (TaskState::Classify, TaskEvent::ClassifyError, TaskState::Idle),
    (TaskState::PlanRequired, TaskEvent::RouteToArchitect, TaskState::ArchitectPlanning),
    (TaskState::ArchitectPlanning, TaskEvent::PlanCreated, TaskState::PlanReview),
    (TaskState::ArchitectPlanning, TaskEvent::PlanningFailed, TaskState::ErrorHandling),
    (TaskState::PlanReview, TaskEvent::PlanApproved, TaskState::PlanExecution),
    (TaskState::PlanReview, TaskEvent::PlanRejected, TaskState::Idle),
    (TaskState::PlanReview, TaskEvent::PlanModificationRequested, TaskState::ArchitectPlanning),
    (TaskState::PlanExecution, TaskEvent::PlanExecutionCompleted, TaskState::Completed),
    (TaskState::PlanExecution, TaskEvent::PlanExecutionFailed, TaskState::ErrorHandling),
    (TaskState::Execution, TaskEvent::AllSubtasksDone, TaskState::Completed),
    (TaskState::Execution, TaskEvent::SubtaskFailed, TaskState::ErrorHandling),
    (TaskState::ErrorHandling, TaskEvent::RequiresReplanning, TaskState::ArchitectPlanning),
    (TaskState::ErrorHandling, TaskEvent::RetrySubtask, TaskState::Execution),
    (TaskState::ErrorHandling, TaskEvent::PlanCancelled, TaskState::Completed),
    (TaskState::Completed, TaskEvent::Reset, TaskState::Idle),
];

/// Look up the target state for a `(state, event)` pair.
pub fn next_state(from: TaskState, event: TaskEvent) -> Option<TaskState> {
    TRANSITIONS
        .iter()
        .find(|(state, ev, _)| *state == from && *ev == event)
        .map(|(_, _, to)| *to)
}

/// Events accepted in the given state, in matrix order.
pub fn allowed_events(from: TaskState) -> Vec<TaskEvent> {
    TRANSITIONS
        .iter()
        .filter(|(state, _, _)| *state == from)
        .map(|(_, ev, _)| *ev)
        .collect()
}

/// States from which a fresh inbound message requires a reset first.
///
/// Every non-idle resting state qualifies: a follow-up message implicitly
/// abandons the interactive step the FSM was parked in, including a pending
/// replanning left behind by a plan-modification decision.
pub fn requires_reset_for_new_message(state: TaskState) -> bool {
    state != TaskState::Idle
}

/// Persisted FSM state for one conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsmContext {
    pub session_id: String,
    pub current_state: TaskState,
    pub metadata: Map<String, Value>,
}

impl FsmContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        FsmContext {
            session_id: session_id.into(),
            current_state: TaskState::Idle,
            metadata: Map::new(),
        }
    }

    pub fn can_transition(&self, event: TaskEvent) -> bool {
        next_state(self.current_state, event).is_some()
    }

    /// Apply `event`, returning the new state or an `InvalidTransition`.
    pub fn apply(&mut self, event: TaskEvent) -> RuntimeResult<TaskState> {
        match next_state(self.current_state, event) {
            Some(state) => {
                self.current_state = state;
                Ok(state)
            }
            None => Err(RuntimeError::InvalidTransition {
                from: self.current_state.as_str().to_string(),
                event: event.as_str().to_string(),
                allowed: allowed_events(self.current_state)
                    .iter()
                    .map(|e| e.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }

    pub fn reset(&mut self) {
        self.current_state = TaskState::Idle;
        self.metadata.clear();
    }
}

/// Repository-backed orchestrator over per-session FSM contexts.
pub struct FsmOrchestrator {
    repo: Arc<dyn FsmStateRepo>,
    contexts: Mutex<HashMap<String, FsmContext>>,
}

impl FsmOrchestrator {
    pub fn new(repo: Arc<dyn FsmStateRepo>) -> Self {
        FsmOrchestrator {
            repo,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the context for a session, restoring from storage or creating a
    /// fresh idle context.
    pub async fn get_or_create(&self, session_id: &str) -> RuntimeResult<FsmContext> {
        {
            let contexts = self.contexts.lock().await;
            if let Some(ctx) = contexts.get(session_id) {
                return Ok(ctx.clone());
            }
        }

        let context = match self.repo.get_state(session_id).await? {
            Some(stored) => {
                log::debug!(
                    "restored FSM context for session {}: state={}",
                    session_id,
                    stored.current_state.as_str()
                );
                stored
            }
            None => {
                let fresh = FsmContext::new(session_id);
                self.repo
                    .save_state(session_id, fresh.current_state, &fresh.metadata)
                    .await?;
                fresh
            }
        };

        let mut contexts = self.contexts.lock().await;
        contexts.insert(session_id.to_string(), context.clone());
        Ok(context)
    }

    pub async fn current_state(&self, session_id: &str) -> RuntimeResult<TaskState> {
        Ok(self.get_or_create(session_id).await?.current_state)
    }

    /// Validate and apply a transition, persisting the result atomically.
    pub async fn transition(
        &self,
        session_id: &str,
        event: TaskEvent,
        metadata: Option<Value>,
    ) -> RuntimeResult<TaskState> {
        let mut context = self.get_or_create(session_id).await?;
        let old_state = context.current_state;
        let new_state = context.apply(event).map_err(|err| {
            log::error!("{} (session {})", err, session_id);
            err
        })?;

        if let Some(Value::Object(patch)) = metadata {
            for (key, value) in patch {
                context.metadata.insert(key, value);
            }
        }

        self.repo
            .save_state(session_id, new_state, &context.metadata)
            .await?;

        log::info!(
            "FSM transition for session {}: {} -> {} (event: {})",
            session_id,
            old_state.as_str(),
            new_state.as_str(),
            event.as_str()
        );

        let mut contexts = self.contexts.lock().await;
        contexts.insert(session_id.to_string(), context);
        Ok(new_state)
    }

    /// Force the FSM back to idle, clearing metadata.
    pub async fn reset(&self, session_id: &str) -> RuntimeResult<()> {
        let mut context = self.get_or_create(session_id).await?;
        let old_state = context.current_state;
        context.reset();
        self.repo
            .save_state(session_id, context.current_state, &context.metadata)
            .await?;
        log::info!(
            "FSM reset for session {}: {} -> idle",
            session_id,
            old_state.as_str()
        );
        let mut contexts = self.contexts.lock().await;
        contexts.insert(session_id.to_string(), context);
        Ok(())
    }

    /// Drop a session's context from memory and storage.
    pub async fn remove(&self, session_id: &str) -> RuntimeResult<()> {
        self.contexts.lock().await.remove(session_id);
        self.repo.delete_state(session_id).await?;
        Ok(())
    }
}
