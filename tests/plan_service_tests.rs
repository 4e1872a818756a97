//! Plan execution service: level ordering, fail-fast, cancellation.

mod common;

use std::sync::Arc;

use maestro::agent_context::AgentKind;
use maestro::agents::AgentRegistry;
use maestro::approval::{ApprovalManager, ApprovalPolicy};
use maestro::chunk::ChunkType;
use maestro::error::RuntimeError;
use maestro::event::RuntimeEvent;
use maestro::executor::SubtaskExecutor;
use maestro::plan::{ExecutionPlan, PlanStatus, Subtask, SubtaskStatus};
use maestro::plan_service::PlanExecutionService;
use maestro::repo::{
    ConversationRepo, PlanRepo, SqliteApprovalRepo, SqliteConversationRepo, SqlitePlanRepo,
};
use maestro::session::{Conversation, Message};
use maestro::stream_handler::StreamLlmHandler;
use maestro::tools::ToolRegistry;

use common::{chunk_channel, drain_chunks, test_db, RecordingEvents, ScriptedLlm};

struct Fixture {
    service: PlanExecutionService,
    plans: Arc<SqlitePlanRepo>,
    llm: Arc<ScriptedLlm>,
    events: Arc<RecordingEvents>,
}

async fn fixture() -> Fixture {
    let db = test_db();
    let events = Arc::new(RecordingEvents::new());
    let conversations = Arc::new(SqliteConversationRepo::new(db.clone()));
    let plans = Arc::new(SqlitePlanRepo::new(db.clone()));
    let approvals = Arc::new(ApprovalManager::new(
        Arc::new(SqliteApprovalRepo::new(db)),
        ApprovalPolicy::default_policy(),
        events.clone(),
    ));
    let llm = Arc::new(ScriptedLlm::new());
    let handler = Arc::new(StreamLlmHandler::new(
        llm.clone(),
        Arc::new(ToolRegistry::builtin()),
        conversations.clone(),
        approvals,
        events.clone(),
        "test-model",
    ));
    let executor = Arc::new(SubtaskExecutor::new(
        plans.clone(),
        conversations.clone(),
        Arc::new(AgentRegistry::multi_agent()),
        handler,
        events.clone(),
    ));
    let service = PlanExecutionService::new(plans.clone(), executor, events.clone());

    let mut conversation = Conversation::new("s1");
    conversation.add_message(Message::system("base")).unwrap();
    conversation
        .add_message(Message::user("Add JWT auth with tests."))
        .unwrap();
    conversations.save(&conversation).await.unwrap();

    Fixture {
        service,
        plans,
        llm,
        events,
    }
}

async fn seed_chain_plan(plans: &SqlitePlanRepo, status: PlanStatus) {
    // S1(coder) <- S2(coder) <- S3(debug): three sequential levels.
    let mut plan = ExecutionPlan::new("p1", "s1", "Add JWT auth with tests.");
    plan.add_subtask(Subtask::new("st-0", "Implement auth", AgentKind::Coder));
    let mut second = Subtask::new("st-1", "Wire middleware", AgentKind::Coder);
    second.dependencies = vec!["st-0".to_string()];
    plan.add_subtask(second);
    let mut third = Subtask::new("st-2", "Verify with tests", AgentKind::Debug);
    third.dependencies = vec!["st-1".to_string()];
    plan.add_subtask(third);
    plan.status = status;
    plans.save(&plan, true).await.unwrap();
}

#[tokio::test]
async fn test_happy_path_runs_all_levels_in_order() {
    let f = fixture().await;
    seed_chain_plan(&f.plans, PlanStatus::Approved).await;
    f.llm.push_text("auth implemented").await;
    f.llm.push_text("middleware wired").await;
    f.llm.push_text("tests green").await;

    let (tx, rx) = chunk_channel();
    f.service.execute("p1", "s1", &tx).await.unwrap();
    drop(tx);
    let chunks = drain_chunks(rx).await;

    let plan = f.plans.find_by_id("p1").await.unwrap().unwrap();
    assert_eq!(plan.status, PlanStatus::Completed);
    assert!(plan
        .subtasks
        .iter()
        .all(|s| s.status == SubtaskStatus::Done));

    // Three subtask completions, then plan_completed, then the 3/3 summary.
    assert_eq!(
        chunks
            .iter()
            .filter(|c| c.chunk_type == ChunkType::SubtaskCompleted)
            .count(),
        3
    );
    let summary = chunks.last().unwrap();
    assert_eq!(summary.chunk_type, ChunkType::ExecutionCompleted);
    assert!(summary.is_final);
    assert_eq!(summary.metadata.as_ref().unwrap()["completed_subtasks"], 3);
    assert_eq!(summary.metadata.as_ref().unwrap()["total_subtasks"], 3);
    assert!(summary
        .content
        .as_deref()
        .unwrap()
        .contains("3/3 subtasks successful"));

    // Dependency results flowed forward: the third worker ran after the
    // second completed (scripted order is consumed sequentially).
    assert_eq!(f.llm.remaining().await, 0);

    assert_eq!(
        f.events
            .count_matching(|e| matches!(e, RuntimeEvent::PlanExecutionStarted { .. })),
        1
    );
    assert_eq!(
        f.events
            .count_matching(|e| matches!(e, RuntimeEvent::PlanCompleted { .. })),
        1
    );
}

#[tokio::test]
async fn test_failed_subtask_stops_later_levels() {
    let f = fixture().await;
    seed_chain_plan(&f.plans, PlanStatus::Approved).await;
    // The first subtask trips an LLM-failure sentinel.
    f.llm.push_text("[Error] model returned garbage").await;

    let (tx, rx) = chunk_channel();
    f.service.execute("p1", "s1", &tx).await.unwrap();
    drop(tx);
    let chunks = drain_chunks(rx).await;

    let plan = f.plans.find_by_id("p1").await.unwrap().unwrap();
    assert_eq!(plan.status, PlanStatus::Failed);
    assert_eq!(plan.subtask("st-0").unwrap().status, SubtaskStatus::Failed);
    // Later levels were never attempted.
    assert_eq!(plan.subtask("st-1").unwrap().status, SubtaskStatus::Pending);
    assert_eq!(plan.subtask("st-2").unwrap().status, SubtaskStatus::Pending);
    assert_eq!(f.llm.remaining().await, 0);

    let last = chunks.last().unwrap();
    assert_eq!(last.chunk_type, ChunkType::Error);
    assert!(last.is_final);
    assert_eq!(last.metadata.as_ref().unwrap()["plan_id"], "p1");

    assert_eq!(
        f.events
            .count_matching(|e| matches!(e, RuntimeEvent::PlanFailed { .. })),
        1
    );
}

#[tokio::test]
async fn test_unapproved_plan_is_rejected() {
    let f = fixture().await;
    seed_chain_plan(&f.plans, PlanStatus::Draft).await;

    let (tx, _rx) = chunk_channel();
    let err = f.service.execute("p1", "s1", &tx).await.unwrap_err();
    assert!(matches!(err, RuntimeError::PlanExecution { .. }));
}

#[tokio::test]
async fn test_resumable_execution_skips_done_subtasks() {
    let f = fixture().await;
    // First subtask already done; plan resumes in progress.
    let mut plan = ExecutionPlan::new("p1", "s1", "goal");
    let mut first = Subtask::new("st-0", "done already", AgentKind::Coder);
    first.start().unwrap();
    first.complete("previous run").unwrap();
    plan.add_subtask(first);
    let mut second = Subtask::new("st-1", "remaining work", AgentKind::Coder);
    second.dependencies = vec!["st-0".to_string()];
    plan.add_subtask(second);
    plan.status = PlanStatus::InProgress;
    f.plans.save(&plan, true).await.unwrap();

    f.llm.push_text("remaining work finished").await;

    let (tx, rx) = chunk_channel();
    f.service.execute("p1", "s1", &tx).await.unwrap();
    drop(tx);
    drain_chunks(rx).await;

    let plan = f.plans.find_by_id("p1").await.unwrap().unwrap();
    assert_eq!(plan.status, PlanStatus::Completed);
    // Only the remaining subtask consumed a scripted reply.
    assert_eq!(f.llm.remaining().await, 0);
    assert_eq!(plan.subtask("st-0").unwrap().result.as_deref(), Some("previous run"));
}

#[tokio::test]
async fn test_cancelled_plan_never_starts() {
    let f = fixture().await;
    seed_chain_plan(&f.plans, PlanStatus::Approved).await;
    f.service.cancel("p1", "user aborted").await.unwrap();

    let plan = f.plans.find_by_id("p1").await.unwrap().unwrap();
    assert_eq!(plan.status, PlanStatus::Cancelled);

    // A cancelled plan is terminal: execution refuses to start and a second
    // cancel errors.
    let (tx, _rx) = chunk_channel();
    assert!(f.service.execute("p1", "s1", &tx).await.is_err());
    assert!(f.service.cancel("p1", "again").await.is_err());

    assert_eq!(
        f.events
            .count_matching(|e| matches!(e, RuntimeEvent::PlanCancelled { .. })),
        1
    );
}
