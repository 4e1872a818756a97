//! Single-turn invariants of the stream LLM handler.

mod common;

use std::sync::Arc;

use serde_json::json;

use maestro::approval::{ApprovalManager, ApprovalPolicy, ApprovalStatus};
use maestro::chunk::ChunkType;
use maestro::event::RuntimeEvent;
use maestro::repo::{ConversationRepo, SqliteApprovalRepo, SqliteConversationRepo};
use maestro::session::{Conversation, Message, Role, ToolCall};
use maestro::stream_handler::StreamLlmHandler;
use maestro::tools::ToolRegistry;

use common::{
    test_db, tool_call_response, RecordingEvents, ScriptedLlm, UnreachableLlm,
};

struct Fixture {
    handler: StreamLlmHandler,
    conversations: Arc<SqliteConversationRepo>,
    approvals: Arc<ApprovalManager>,
    events: Arc<RecordingEvents>,
    llm: Arc<ScriptedLlm>,
}

async fn fixture() -> Fixture {
    let db = test_db();
    let events = Arc::new(RecordingEvents::new());
    let conversations = Arc::new(SqliteConversationRepo::new(db.clone()));
    let approvals = Arc::new(ApprovalManager::new(
        Arc::new(SqliteApprovalRepo::new(db)),
        ApprovalPolicy::default_policy(),
        events.clone(),
    ));
    let llm = Arc::new(ScriptedLlm::new());
    let handler = StreamLlmHandler::new(
        llm.clone(),
        Arc::new(ToolRegistry::builtin()),
        conversations.clone(),
        approvals.clone(),
        events.clone(),
        "test-model",
    );

    let mut conversation = Conversation::new("s1");
    conversation.add_message(Message::user("hello")).unwrap();
    conversations.save(&conversation).await.unwrap();

    Fixture {
        handler,
        conversations,
        approvals,
        events,
        llm,
    }
}

fn history() -> Vec<serde_json::Value> {
    vec![json!({"role": "user", "content": "hello"})]
}

#[tokio::test]
async fn test_plain_reply_persists_and_emits_final_message() {
    let f = fixture().await;
    f.llm.push_text("All done.").await;

    let chunk = f.handler.handle_turn("s1", history(), None).await;
    assert_eq!(chunk.chunk_type, ChunkType::AssistantMessage);
    assert_eq!(chunk.content.as_deref(), Some("All done."));
    assert!(chunk.is_final);

    let conversation = f.conversations.find_by_id("s1").await.unwrap().unwrap();
    let last = conversation.messages.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert_eq!(last.content, "All done.");

    assert_eq!(
        f.events
            .count_matching(|e| matches!(e, RuntimeEvent::RequestCompleted { .. })),
        1
    );
}

#[tokio::test]
async fn test_multiple_tool_calls_keep_only_first() {
    let f = fixture().await;
    f.llm
        .push_response(tool_call_response(vec![
            ToolCall {
                id: "call_1".to_string(),
                name: "read_file".to_string(),
                arguments: json!({"path": "a.py"}),
            },
            ToolCall {
                id: "call_2".to_string(),
                name: "write_file".to_string(),
                arguments: json!({"path": "b.py", "content": "x"}),
            },
        ]))
        .await;

    let chunk = f.handler.handle_turn("s1", history(), None).await;
    assert_eq!(chunk.chunk_type, ChunkType::ToolCall);
    assert_eq!(chunk.tool_name.as_deref(), Some("read_file"));

    // The warning is attached to the chunk and the second call is dropped.
    let warnings = &chunk.metadata.as_ref().unwrap()["validation_warnings"];
    assert!(warnings[0]
        .as_str()
        .unwrap()
        .contains("LLM attempted to call 2 tools simultaneously"));

    let conversation = f.conversations.find_by_id("s1").await.unwrap().unwrap();
    let last = conversation.messages.last().unwrap();
    assert_eq!(last.tool_calls.len(), 1);
    assert_eq!(last.tool_calls[0].id, "call_1");
    assert_eq!(last.content, "");
}

#[tokio::test]
async fn test_dangerous_tool_queues_pending_approval() {
    let f = fixture().await;
    f.llm
        .push_tool_call("call_9", "write_file", json!({"path": "a.py", "content": "..."}))
        .await;

    let chunk = f.handler.handle_turn("s1", history(), None).await;
    assert_eq!(chunk.chunk_type, ChunkType::ToolCall);
    assert_eq!(chunk.requires_approval, Some(true));
    assert!(chunk.is_final);

    let request_id = chunk.metadata.as_ref().unwrap()["approval_request_id"]
        .as_str()
        .unwrap()
        .to_string();
    assert_eq!(request_id, "tool-approval-call_9");

    let pending = f.approvals.get_pending(&request_id).await.unwrap().unwrap();
    assert_eq!(pending.status, ApprovalStatus::Pending);
    assert_eq!(pending.subject, "write_file");
    assert_eq!(pending.details["arguments"]["path"], "a.py");

    assert_eq!(
        f.events
            .count_matching(|e| matches!(e, RuntimeEvent::ToolApprovalRequired { .. })),
        1
    );
}

#[tokio::test]
async fn test_safe_tool_needs_no_approval() {
    let f = fixture().await;
    f.llm
        .push_tool_call("call_3", "read_file", json!({"path": "utils.py"}))
        .await;

    let chunk = f.handler.handle_turn("s1", history(), None).await;
    assert_eq!(chunk.requires_approval, Some(false));
    assert_eq!(f.approvals.count_pending("s1").await.unwrap(), 0);
    assert_eq!(
        f.events
            .count_matching(|e| matches!(e, RuntimeEvent::ToolExecutionRequested { .. })),
        1
    );
}

#[tokio::test]
async fn test_empty_reply_records_warning() {
    let f = fixture().await;
    f.llm.push_text("").await;

    let chunk = f.handler.handle_turn("s1", history(), None).await;
    assert_eq!(chunk.chunk_type, ChunkType::AssistantMessage);
    let warnings = &chunk.metadata.as_ref().unwrap()["validation_warnings"];
    assert!(warnings[0]
        .as_str()
        .unwrap()
        .contains("empty content without tool calls"));
}

#[tokio::test]
async fn test_provider_failure_emits_error_chunk() {
    let db = test_db();
    let events = Arc::new(RecordingEvents::new());
    let conversations = Arc::new(SqliteConversationRepo::new(db.clone()));
    let approvals = Arc::new(ApprovalManager::new(
        Arc::new(SqliteApprovalRepo::new(db)),
        ApprovalPolicy::default_policy(),
        events.clone(),
    ));
    let handler = StreamLlmHandler::new(
        Arc::new(UnreachableLlm),
        Arc::new(ToolRegistry::builtin()),
        conversations,
        approvals,
        events.clone(),
        "test-model",
    );

    let chunk = handler.handle_turn("s1", history(), None).await;
    assert_eq!(chunk.chunk_type, ChunkType::Error);
    assert!(chunk.is_final);
    assert_eq!(
        events.count_matching(|e| matches!(e, RuntimeEvent::RequestFailed { .. })),
        1
    );
}
