//! Error taxonomy for the orchestration runtime.
//!
//! Every fallible path in the crate surfaces one of the [`RuntimeError`]
//! variants below. Invariant violations are fatal to the current request and
//! become a terminal `error` chunk on the stream; they are never silently
//! recovered. FSM transition errors are programming errors and always raise.

use std::error::Error;
use std::fmt;

/// Result alias used across the runtime.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors produced by the orchestration runtime.
#[derive(Debug, Clone)]
pub enum RuntimeError {
    /// Appending to an inactive conversation, or exceeding the message cap.
    MessageValidation(String),
    /// Switching to the current agent, or exceeding the switch budget.
    AgentSwitch(String),
    /// Wraps storage failures (SQLite, serialization of stored rows).
    Repository(String),
    /// A referenced entity does not exist (404-shaped client error).
    NotFound(String),
    /// Plan lifecycle or plan validation failure.
    PlanExecution {
        message: String,
        plan_id: Option<String>,
    },
    /// Subtask lifecycle failure.
    SubtaskExecution {
        message: String,
        subtask_id: Option<String>,
    },
    /// Approval request not found when a decision arrives.
    ApprovalNotFound(String),
    /// Approval already carries a terminal decision; the state is unchanged.
    ApprovalAlreadyDecided { request_id: String, status: String },
    /// Invalid `(state, event)` pair against the transition matrix.
    InvalidTransition {
        from: String,
        event: String,
        allowed: String,
    },
    /// LLM provider failure (network, HTTP status, or response parse).
    Provider(String),
    /// Unknown tool name or arguments that fail the tool's schema.
    ToolValidation(String),
}

impl RuntimeError {
    /// Convenience constructor for plan failures.
    pub fn plan(message: impl Into<String>, plan_id: impl Into<String>) -> Self {
        RuntimeError::PlanExecution {
            message: message.into(),
            plan_id: Some(plan_id.into()),
        }
    }

    /// Convenience constructor for subtask failures.
    pub fn subtask(message: impl Into<String>, subtask_id: impl Into<String>) -> Self {
        RuntimeError::SubtaskExecution {
            message: message.into(),
            subtask_id: Some(subtask_id.into()),
        }
    }

    /// True for errors that should map to a 404 response at the transport.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RuntimeError::NotFound(_) | RuntimeError::ApprovalNotFound(_)
        )
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::MessageValidation(msg) => write!(f, "Message validation failed: {}", msg),
            RuntimeError::AgentSwitch(msg) => write!(f, "Agent switch failed: {}", msg),
            RuntimeError::Repository(msg) => write!(f, "Repository error: {}", msg),
            RuntimeError::NotFound(msg) => write!(f, "Not found: {}", msg),
            RuntimeError::PlanExecution { message, plan_id } => match plan_id {
                Some(id) => write!(f, "Plan execution error ({}): {}", id, message),
                None => write!(f, "Plan execution error: {}", message),
            },
            RuntimeError::SubtaskExecution {
                message,
                subtask_id,
            } => match subtask_id {
                Some(id) => write!(f, "Subtask execution error ({}): {}", id, message),
                None => write!(f, "Subtask execution error: {}", message),
            },
            RuntimeError::ApprovalNotFound(id) => write!(f, "Approval {} not found", id),
            RuntimeError::ApprovalAlreadyDecided { request_id, status } => write!(
                f,
                "Approval {} already decided (status: {})",
                request_id, status
            ),
            RuntimeError::InvalidTransition {
                from,
                event,
                allowed,
            } => write!(
                f,
                "Invalid FSM transition: {} -> {}. Allowed events: [{}]",
                from, event, allowed
            ),
            RuntimeError::Provider(msg) => write!(f, "LLM provider error: {}", msg),
            RuntimeError::ToolValidation(msg) => write!(f, "Tool validation failed: {}", msg),
        }
    }
}

impl Error for RuntimeError {}

impl From<rusqlite::Error> for RuntimeError {
    fn from(err: rusqlite::Error) -> Self {
        RuntimeError::Repository(err.to_string())
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        RuntimeError::Repository(format!("serialization: {}", err))
    }
}

impl From<reqwest::Error> for RuntimeError {
    fn from(err: reqwest::Error) -> Self {
        RuntimeError::Provider(err.to_string())
    }
}
