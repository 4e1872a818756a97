//! End-to-end flows through the message orchestration facade.

mod common;

use std::sync::Arc;

use serde_json::json;

use maestro::agent_context::AgentKind;
use maestro::approval::ApprovalStatus;
use maestro::chunk::ChunkType;
use maestro::config::RuntimeConfig;
use maestro::fsm::TaskState;
use maestro::plan::{PlanStatus, SubtaskStatus};
use maestro::provider::LlmClient;
use maestro::repo::{
    ConversationRepo, FsmStateRepo, PlanRepo, SqliteAgentContextRepo, SqliteConversationRepo,
    SqliteFsmStateRepo, SqlitePlanRepo,
};
use maestro::repo::{AgentContextRepo, Database};
use maestro::server::{build_state, AppState};
use maestro::session::{Conversation, Role};

use common::{
    atomic_classification, chunk_channel, complex_classification, drain_chunks, test_db,
    three_step_plan_response, ScriptedLlm,
};

struct World {
    state: AppState,
    db: Arc<Database>,
    llm: Arc<ScriptedLlm>,
}

async fn world(multi_agent: bool) -> World {
    let db = test_db();
    let llm = Arc::new(ScriptedLlm::new());
    let config = RuntimeConfig {
        multi_agent_mode: multi_agent,
        ..RuntimeConfig::default()
    };
    let state = build_state(config, db.clone(), llm.clone() as Arc<dyn LlmClient>);

    // Seed the session the scenarios talk to.
    let conversations = SqliteConversationRepo::new(db.clone());
    conversations.save(&Conversation::new("s1")).await.unwrap();

    World { state, db, llm }
}

impl World {
    fn conversations(&self) -> SqliteConversationRepo {
        SqliteConversationRepo::new(self.db.clone())
    }

    fn plans(&self) -> SqlitePlanRepo {
        SqlitePlanRepo::new(self.db.clone())
    }

    async fn fsm_state(&self) -> TaskState {
        SqliteFsmStateRepo::new(self.db.clone())
            .get_state("s1")
            .await
            .unwrap()
            .map(|c| c.current_state)
            .unwrap_or(TaskState::Idle)
    }
}

#[tokio::test]
async fn test_atomic_read_scenario() {
    let w = world(true).await;
    w.llm.push_response(atomic_classification("code")).await;
    w.llm
        .push_tool_call("call_1", "read_file", json!({"path": "utils.py"}))
        .await;

    let (tx, rx) = chunk_channel();
    w.state
        .facade
        .handle_user_message("s1", "What does file utils.py export?", &tx)
        .await;
    drop(tx);
    let chunks = drain_chunks(rx).await;

    // switch_agent to coder, then the tool call without approval.
    assert_eq!(chunks[0].chunk_type, ChunkType::SwitchAgent);
    assert_eq!(
        chunks[0].metadata.as_ref().unwrap()["target_agent"],
        "coder"
    );
    let tool = chunks.last().unwrap();
    assert_eq!(tool.chunk_type, ChunkType::ToolCall);
    assert_eq!(tool.tool_name.as_deref(), Some("read_file"));
    assert_eq!(tool.requires_approval, Some(false));
    assert!(tool.is_final);

    let context = SqliteAgentContextRepo::new(w.db.clone())
        .find_by_session_id("s1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(context.current_agent, AgentKind::Coder);
    assert_eq!(w.fsm_state().await, TaskState::Execution);

    // The IDE executes the read and reports back; the coder answers.
    w.llm.push_text("utils.py exports foo, bar.").await;
    let (tx, rx) = chunk_channel();
    w.state
        .facade
        .handle_tool_result("s1", "call_1", "def foo()...\ndef bar()...", false, &tx)
        .await;
    drop(tx);
    let chunks = drain_chunks(rx).await;
    let answer = chunks.last().unwrap();
    assert_eq!(answer.chunk_type, ChunkType::AssistantMessage);
    assert_eq!(answer.content.as_deref(), Some("utils.py exports foo, bar."));

    // Log shape: user, assistant-with-toolcalls, tool, assistant.
    let conversation = w.conversations().find_by_id("s1").await.unwrap().unwrap();
    let roles: Vec<Role> = conversation.messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );
    assert_eq!(conversation.messages[1].tool_calls.len(), 1);
    assert_eq!(
        conversation.messages[2].tool_call_id.as_deref(),
        Some("call_1")
    );
}

#[tokio::test]
async fn test_dangerous_tool_scenario() {
    let w = world(true).await;
    w.llm.push_response(atomic_classification("code")).await;
    w.llm
        .push_tool_call("call_7", "write_file", json!({"path": "a.py", "content": "..."}))
        .await;

    let (tx, rx) = chunk_channel();
    w.state
        .facade
        .handle_user_message("s1", "Write a.py", &tx)
        .await;
    drop(tx);
    let chunks = drain_chunks(rx).await;

    let tool = chunks.last().unwrap();
    assert_eq!(tool.chunk_type, ChunkType::ToolCall);
    assert_eq!(tool.requires_approval, Some(true));
    let request_id = tool.metadata.as_ref().unwrap()["approval_request_id"]
        .as_str()
        .unwrap()
        .to_string();

    // The pending approval carries the arguments.
    let pending = w
        .state
        .approvals
        .get_pending(&request_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pending.details["arguments"]["path"], "a.py");

    // A later request approves; the IDE is told to proceed.
    let (tx, rx) = chunk_channel();
    w.state
        .facade
        .handle_tool_decision("s1", &request_id, "approve", None, &tx)
        .await;
    drop(tx);
    let chunks = drain_chunks(rx).await;
    let status = chunks.last().unwrap();
    assert_eq!(status.chunk_type, ChunkType::Status);
    assert!(status.is_final);
    assert_eq!(status.metadata.as_ref().unwrap()["call_id"], "call_7");

    assert_eq!(
        w.state
            .approvals
            .get_pending(&request_id)
            .await
            .unwrap()
            .unwrap()
            .status,
        ApprovalStatus::Approved
    );

    // The IDE posts the write result and the coder completes.
    w.llm.push_text("File a.py written.").await;
    let (tx, rx) = chunk_channel();
    w.state
        .facade
        .handle_tool_result("s1", "call_7", "ok", false, &tx)
        .await;
    drop(tx);
    let chunks = drain_chunks(rx).await;
    assert_eq!(
        chunks.last().unwrap().content.as_deref(),
        Some("File a.py written.")
    );
}

#[tokio::test]
async fn test_tool_rejection_appends_notice_and_resumes() {
    let w = world(true).await;
    w.llm.push_response(atomic_classification("code")).await;
    w.llm
        .push_tool_call("call_5", "execute_command", json!({"command": "rm -rf /"}))
        .await;

    let (tx, rx) = chunk_channel();
    w.state
        .facade
        .handle_user_message("s1", "Clean the workspace", &tx)
        .await;
    drop(tx);
    let chunks = drain_chunks(rx).await;
    let request_id = chunks.last().unwrap().metadata.as_ref().unwrap()
        ["approval_request_id"]
        .as_str()
        .unwrap()
        .to_string();

    // Rejection resumes the turn with a tool-role rejection notice.
    w.llm.push_text("Understood, I will not run that.").await;
    let (tx, rx) = chunk_channel();
    w.state
        .facade
        .handle_tool_decision("s1", &request_id, "reject", None, &tx)
        .await;
    drop(tx);
    let chunks = drain_chunks(rx).await;
    assert_eq!(chunks.last().unwrap().chunk_type, ChunkType::AssistantMessage);

    let conversation = w.conversations().find_by_id("s1").await.unwrap().unwrap();
    let notice = conversation
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .unwrap();
    assert!(notice.content.contains("rejected by the user"));
    assert_eq!(notice.tool_call_id.as_deref(), Some("call_5"));
}

#[tokio::test]
async fn test_complex_plan_happy_path() {
    let w = world(true).await;
    w.llm.push_response(complex_classification()).await;
    w.llm.push_response(three_step_plan_response()).await;

    let (tx, rx) = chunk_channel();
    w.state
        .facade
        .handle_user_message("s1", "Add JWT auth with tests.", &tx)
        .await;
    drop(tx);
    let chunks = drain_chunks(rx).await;

    // The complex path surfaces the plan and suspends on approval.
    assert!(chunks
        .iter()
        .any(|c| c.chunk_type == ChunkType::PlanCreated));
    let gate = chunks.last().unwrap();
    assert_eq!(gate.chunk_type, ChunkType::PlanApprovalRequired);
    assert!(gate.is_final);
    let request_id = gate.approval_request_id.clone().unwrap();
    let plan_id = gate.plan_id.clone().unwrap();
    assert_eq!(
        gate.plan_summary.as_ref().unwrap()["subtasks_count"],
        3
    );
    assert_eq!(w.fsm_state().await, TaskState::PlanReview);

    let plan = w.plans().find_by_id(&plan_id).await.unwrap().unwrap();
    assert_eq!(plan.status, PlanStatus::Draft);

    // Approval arrives on a later request; three workers run in order.
    w.llm.push_text("auth module implemented").await;
    w.llm.push_text("middleware wired").await;
    w.llm.push_text("all tests pass").await;

    let (tx, rx) = chunk_channel();
    w.state
        .facade
        .handle_plan_decision("s1", &request_id, "approve", None, &tx)
        .await;
    drop(tx);
    let chunks = drain_chunks(rx).await;

    let summary = chunks.last().unwrap();
    assert_eq!(summary.chunk_type, ChunkType::ExecutionCompleted);
    assert_eq!(summary.metadata.as_ref().unwrap()["completed_subtasks"], 3);
    assert_eq!(summary.metadata.as_ref().unwrap()["total_subtasks"], 3);

    let plan = w.plans().find_by_id(&plan_id).await.unwrap().unwrap();
    assert_eq!(plan.status, PlanStatus::Completed);
    assert!(plan
        .subtasks
        .iter()
        .all(|s| s.status == SubtaskStatus::Done));
    assert_eq!(w.fsm_state().await, TaskState::Completed);
    assert_eq!(
        w.state
            .approvals
            .get_pending(&request_id)
            .await
            .unwrap()
            .unwrap()
            .status,
        ApprovalStatus::Approved
    );
}

#[tokio::test]
async fn test_plan_rejection_returns_to_idle() {
    let w = world(true).await;
    w.llm.push_response(complex_classification()).await;
    w.llm.push_response(three_step_plan_response()).await;

    let (tx, rx) = chunk_channel();
    w.state
        .facade
        .handle_user_message("s1", "Add JWT auth with tests.", &tx)
        .await;
    drop(tx);
    let chunks = drain_chunks(rx).await;
    let request_id = chunks.last().unwrap().approval_request_id.clone().unwrap();

    let (tx, rx) = chunk_channel();
    w.state
        .facade
        .handle_plan_decision("s1", &request_id, "reject", Some("too broad".into()), &tx)
        .await;
    drop(tx);
    let chunks = drain_chunks(rx).await;

    let rejected = chunks.last().unwrap();
    assert_eq!(rejected.chunk_type, ChunkType::PlanRejected);
    assert!(rejected.is_final);
    assert_eq!(w.fsm_state().await, TaskState::Idle);
}

#[tokio::test]
async fn test_plan_modification_hook() {
    let w = world(true).await;
    w.llm.push_response(complex_classification()).await;
    w.llm.push_response(three_step_plan_response()).await;

    let (tx, rx) = chunk_channel();
    w.state
        .facade
        .handle_user_message("s1", "Add JWT auth with tests.", &tx)
        .await;
    drop(tx);
    let chunks = drain_chunks(rx).await;
    let request_id = chunks.last().unwrap().approval_request_id.clone().unwrap();

    let (tx, rx) = chunk_channel();
    w.state
        .facade
        .handle_plan_decision(
            "s1",
            &request_id,
            "modify",
            Some("split the tests".into()),
            &tx,
        )
        .await;
    drop(tx);
    let chunks = drain_chunks(rx).await;

    // The hook stops after announcing replanning.
    let last = chunks.last().unwrap();
    assert_eq!(last.chunk_type, ChunkType::Status);
    assert!(last.is_final);
    assert_eq!(w.fsm_state().await, TaskState::ArchitectPlanning);
}

#[tokio::test]
async fn test_new_message_abandons_plan_review() {
    let w = world(true).await;
    w.llm.push_response(complex_classification()).await;
    w.llm.push_response(three_step_plan_response()).await;

    let (tx, rx) = chunk_channel();
    w.state
        .facade
        .handle_user_message("s1", "Add JWT auth with tests.", &tx)
        .await;
    drop(tx);
    drain_chunks(rx).await;
    assert_eq!(w.fsm_state().await, TaskState::PlanReview);

    // A follow-up message implicitly rejects the pending review.
    w.llm.push_response(atomic_classification("explain")).await;
    w.llm.push_text("It verifies JWT signatures.").await;

    let (tx, rx) = chunk_channel();
    w.state
        .facade
        .handle_user_message("s1", "explain what the middleware does", &tx)
        .await;
    drop(tx);
    let chunks = drain_chunks(rx).await;

    assert!(!chunks
        .iter()
        .any(|c| c.chunk_type == ChunkType::Error));
    assert_eq!(
        chunks[0].metadata.as_ref().unwrap()["target_agent"],
        "ask"
    );
    assert_eq!(w.fsm_state().await, TaskState::Execution);
}

#[tokio::test]
async fn test_unknown_approval_surfaces_not_found() {
    let w = world(true).await;

    let (tx, rx) = chunk_channel();
    w.state
        .facade
        .handle_plan_decision("s1", "no-such-approval", "approve", None, &tx)
        .await;
    drop(tx);
    let chunks = drain_chunks(rx).await;

    let err = chunks.last().unwrap();
    assert_eq!(err.chunk_type, ChunkType::Error);
    assert!(err.is_final);
    assert_eq!(err.metadata.as_ref().unwrap()["code"], "not_found");
}

#[tokio::test]
async fn test_single_agent_mode_routes_to_universal() {
    let w = world(false).await;
    // No classification call is consumed: routing is decided by the
    // registry contents alone.
    w.llm.push_text("done in one role").await;

    let (tx, rx) = chunk_channel();
    w.state
        .facade
        .handle_user_message("s1", "do the thing", &tx)
        .await;
    drop(tx);
    let chunks = drain_chunks(rx).await;

    assert_eq!(chunks[0].chunk_type, ChunkType::SwitchAgent);
    assert_eq!(
        chunks[0].metadata.as_ref().unwrap()["target_agent"],
        "universal"
    );
    assert_eq!(
        chunks.last().unwrap().content.as_deref(),
        Some("done in one role")
    );
    assert_eq!(w.llm.remaining().await, 0);
}

#[tokio::test]
async fn test_message_to_unknown_session_errors() {
    let w = world(true).await;
    let (tx, rx) = chunk_channel();
    w.state
        .facade
        .handle_user_message("ghost", "hello", &tx)
        .await;
    drop(tx);
    let chunks = drain_chunks(rx).await;
    let err = chunks.last().unwrap();
    assert_eq!(err.chunk_type, ChunkType::Error);
    assert_eq!(err.metadata.as_ref().unwrap()["code"], "not_found");
}
