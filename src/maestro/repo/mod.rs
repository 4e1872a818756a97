//! Repository contracts and their SQLite implementations.
//!
//! One trait per aggregate. The domain layer only sees these traits; all SQL
//! lives in the `sqlite`-backed implementations. The runtime assumes
//! read-committed visibility: a write that must be observed by a later
//! request (planner output, approval decisions) commits before the call
//! returns.

mod approvals;
mod contexts;
mod conversations;
mod fsm_states;
mod plans;
mod sqlite;

pub use approvals::SqliteApprovalRepo;
pub use contexts::SqliteAgentContextRepo;
pub use conversations::SqliteConversationRepo;
pub use fsm_states::SqliteFsmStateRepo;
pub use plans::SqlitePlanRepo;
pub use sqlite::Database;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::maestro::agent_context::{AgentContext, AgentKind};
use crate::maestro::approval::{ApprovalRequestType, ApprovalStatus, PendingApproval};
use crate::maestro::error::RuntimeResult;
use crate::maestro::fsm::{FsmContext, TaskState};
use crate::maestro::plan::{ExecutionPlan, PlanStatus};
use crate::maestro::session::{Conversation, ConversationSnapshot};

/// Persistence for conversations, their messages, and snapshots.
///
/// `save` atomically replaces the stored message sequence: the new sequence
/// is written in the same transaction that clears the old one.
#[async_trait]
pub trait ConversationRepo: Send + Sync {
    async fn save(&self, conversation: &Conversation) -> RuntimeResult<()>;
    async fn find_by_id(&self, id: &str) -> RuntimeResult<Option<Conversation>>;
    async fn delete(&self, id: &str) -> RuntimeResult<bool>;
    /// Active conversations, most recently active first.
    async fn find_active(&self, limit: u32, offset: u32) -> RuntimeResult<Vec<Conversation>>;
    async fn find_by_activity_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> RuntimeResult<Vec<Conversation>>;
    /// Delete conversations idle for longer than `hours`; returns the count.
    async fn cleanup_older_than(&self, hours: u32) -> RuntimeResult<usize>;
    async fn count_active(&self) -> RuntimeResult<u64>;

    async fn save_snapshot(&self, snapshot: &ConversationSnapshot) -> RuntimeResult<()>;
    async fn get_snapshot(&self, id: &str) -> RuntimeResult<Option<ConversationSnapshot>>;
    async fn delete_snapshot(&self, id: &str) -> RuntimeResult<bool>;
}

/// Persistence for execution plans and their subtasks.
#[async_trait]
pub trait PlanRepo: Send + Sync {
    /// Persist the plan. With `commit = true` the write lands in its own
    /// committed transaction so a different request can read it immediately
    /// (the approval decision flow depends on this).
    async fn save(&self, plan: &ExecutionPlan, commit: bool) -> RuntimeResult<()>;
    async fn find_by_id(&self, id: &str) -> RuntimeResult<Option<ExecutionPlan>>;
    async fn delete(&self, id: &str) -> RuntimeResult<bool>;
    /// Newest plan for the conversation in `approved` or `in_progress`.
    async fn find_active_for_conversation(
        &self,
        conversation_id: &str,
    ) -> RuntimeResult<Option<ExecutionPlan>>;
    /// All plans for the conversation, newest first.
    async fn find_all_for_conversation(
        &self,
        conversation_id: &str,
        limit: u32,
        offset: u32,
    ) -> RuntimeResult<Vec<ExecutionPlan>>;
    async fn find_by_status(&self, status: PlanStatus) -> RuntimeResult<Vec<ExecutionPlan>>;
}

/// Persistence for pending approvals.
#[async_trait]
pub trait ApprovalRepo: Send + Sync {
    async fn save_pending(&self, approval: &PendingApproval) -> RuntimeResult<()>;
    async fn get_pending(&self, request_id: &str) -> RuntimeResult<Option<PendingApproval>>;
    async fn get_all_pending(
        &self,
        session_id: &str,
        request_type: Option<ApprovalRequestType>,
    ) -> RuntimeResult<Vec<PendingApproval>>;
    /// Record a terminal decision. Commits immediately so concurrent readers
    /// observe the outcome. Returns false when no pending row matched.
    async fn update_status(
        &self,
        request_id: &str,
        status: ApprovalStatus,
        decided_at: DateTime<Utc>,
        reason: Option<&str>,
    ) -> RuntimeResult<bool>;
    async fn count_pending(&self, session_id: &str) -> RuntimeResult<u64>;
    /// Remove pending rows created before `cutoff`; returns the count.
    async fn sweep_expired(&self, cutoff: DateTime<Utc>) -> RuntimeResult<usize>;
    async fn delete_pending(&self, request_id: &str) -> RuntimeResult<bool>;
}

/// Persistence for per-session FSM state. An absent row reads as idle.
#[async_trait]
pub trait FsmStateRepo: Send + Sync {
    async fn save_state(
        &self,
        session_id: &str,
        state: TaskState,
        metadata: &Map<String, Value>,
    ) -> RuntimeResult<()>;
    async fn get_state(&self, session_id: &str) -> RuntimeResult<Option<FsmContext>>;
    async fn delete_state(&self, session_id: &str) -> RuntimeResult<bool>;
    /// Shallow-merge `patch` into the stored metadata.
    async fn update_metadata(
        &self,
        session_id: &str,
        patch: &Map<String, Value>,
    ) -> RuntimeResult<()>;
}

/// Persistence for agent contexts and switch history.
#[async_trait]
pub trait AgentContextRepo: Send + Sync {
    async fn save(&self, context: &AgentContext) -> RuntimeResult<()>;
    async fn find_by_session_id(&self, session_id: &str) -> RuntimeResult<Option<AgentContext>>;
    async fn find_by_agent_type(
        &self,
        agent: AgentKind,
        limit: u32,
    ) -> RuntimeResult<Vec<AgentContext>>;
    async fn find_with_switches_above(
        &self,
        threshold: u32,
        limit: u32,
    ) -> RuntimeResult<Vec<AgentContext>>;
    /// Map of agent name to the number of sessions it currently owns.
    async fn usage_stats(&self) -> RuntimeResult<HashMap<String, u64>>;
}
