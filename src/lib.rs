// src/lib.rs

// Import the top-level `maestro` module.
pub mod maestro;

// Re-export the submodules at the crate root so callers can write
// maestro::fsm::TaskState instead of maestro::maestro::fsm::TaskState.
pub use maestro::{
    agent_context, agents, approval, chunk, config, error, event, executor, facade, fsm, locks,
    plan, plan_service, provider, repo, resolver, server, session, stream_handler, tools,
};

// Re-exporting key items for easier external access.
pub use maestro::agent_context::{AgentContext, AgentKind};
pub use maestro::approval::{ApprovalManager, ApprovalPolicy, PendingApproval};
pub use maestro::chunk::{ChunkType, StreamChunk};
pub use maestro::config::RuntimeConfig;
pub use maestro::error::{RuntimeError, RuntimeResult};
pub use maestro::facade::MessageFacade;
pub use maestro::fsm::{FsmOrchestrator, TaskEvent, TaskState};
pub use maestro::plan::{ExecutionPlan, PlanStatus, Subtask, SubtaskStatus};
pub use maestro::provider::{LlmClient, LlmResponse, ProxyClient};
pub use maestro::session::{Conversation, Message, Role, ToolCall};
