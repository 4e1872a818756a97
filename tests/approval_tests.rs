//! Approval manager behaviour: decisions, idempotence, events, expiry.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use maestro::approval::{
    ApprovalManager, ApprovalPolicy, ApprovalRequestType, ApprovalStatus, PendingApproval,
};
use maestro::error::RuntimeError;
use maestro::event::RuntimeEvent;
use maestro::repo::SqliteApprovalRepo;

use common::{test_db, RecordingEvents};

fn manager() -> (ApprovalManager, Arc<RecordingEvents>) {
    let events = Arc::new(RecordingEvents::new());
    let manager = ApprovalManager::new(
        Arc::new(SqliteApprovalRepo::new(test_db())),
        ApprovalPolicy::default_policy(),
        events.clone(),
    );
    (manager, events)
}

fn tool_approval(request_id: &str) -> PendingApproval {
    PendingApproval::new(
        request_id,
        ApprovalRequestType::Tool,
        "write_file",
        "s1",
        json!({"call_id": "call_1", "tool_name": "write_file", "arguments": {"path": "a.py"}}),
        Some("File modification requires approval".to_string()),
    )
}

#[tokio::test]
async fn test_add_pending_publishes_event() {
    let (manager, events) = manager();
    manager.add_pending(tool_approval("req-1")).await.unwrap();

    assert_eq!(
        events.count_matching(|e| matches!(e, RuntimeEvent::ApprovalRequested { .. })),
        1
    );
    assert_eq!(manager.count_pending("s1").await.unwrap(), 1);
}

#[tokio::test]
async fn test_approve_is_idempotent_guarded() {
    let (manager, events) = manager();
    manager.add_pending(tool_approval("req-1")).await.unwrap();

    let approved = manager.approve("req-1").await.unwrap();
    assert_eq!(approved.status, ApprovalStatus::Approved);

    // The second decision errors and the stored status is unchanged.
    let err = manager.approve("req-1").await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::ApprovalAlreadyDecided { .. }
    ));
    let err = manager.reject("req-1", None).await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::ApprovalAlreadyDecided { .. }
    ));

    let stored = manager.get_pending("req-1").await.unwrap().unwrap();
    assert_eq!(stored.status, ApprovalStatus::Approved);

    // Exactly one terminal event went out.
    assert_eq!(
        events.count_matching(|e| matches!(e, RuntimeEvent::ApprovalApproved { .. })),
        1
    );
    assert_eq!(
        events.count_matching(|e| matches!(e, RuntimeEvent::ApprovalRejected { .. })),
        0
    );
}

#[tokio::test]
async fn test_reject_records_reason() {
    let (manager, events) = manager();
    manager.add_pending(tool_approval("req-1")).await.unwrap();

    manager
        .reject("req-1", Some("too risky".to_string()))
        .await
        .unwrap();
    let stored = manager.get_pending("req-1").await.unwrap().unwrap();
    assert_eq!(stored.status, ApprovalStatus::Rejected);
    assert_eq!(stored.decision_reason.as_deref(), Some("too risky"));

    assert!(events.snapshot().iter().any(|e| matches!(
        e,
        RuntimeEvent::ApprovalRejected { reason: Some(r), .. } if r == "too risky"
    )));
}

#[tokio::test]
async fn test_decision_on_unknown_request_is_not_found() {
    let (manager, _) = manager();
    let err = manager.approve("missing").await.unwrap_err();
    assert!(matches!(err, RuntimeError::ApprovalNotFound(_)));
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_sweep_expired_then_approve_fails() {
    let (manager, _) = manager();

    let mut stale = tool_approval("req-stale");
    stale.created_at = chrono::Utc::now() - chrono::Duration::seconds(600);
    manager.add_pending(stale).await.unwrap();
    manager.add_pending(tool_approval("req-fresh")).await.unwrap();

    assert_eq!(manager.count_pending("s1").await.unwrap(), 2);
    let swept = manager.sweep_expired(Duration::from_secs(300)).await.unwrap();
    assert_eq!(swept, 1);
    assert_eq!(manager.count_pending("s1").await.unwrap(), 1);

    let err = manager.approve("req-stale").await.unwrap_err();
    assert!(matches!(err, RuntimeError::ApprovalNotFound(_)));
    manager.approve("req-fresh").await.unwrap();
}

#[tokio::test]
async fn test_policy_consultation_through_manager() {
    let (manager, _) = manager();

    let (required, reason) = manager.should_require_approval(
        ApprovalRequestType::Tool,
        "execute_command",
        &json!({"command": "rm -rf /"}),
    );
    assert!(required);
    assert!(reason.unwrap().contains("Command execution"));

    let (required, _) = manager.should_require_approval(
        ApprovalRequestType::Tool,
        "list_files",
        &json!({"path": "."}),
    );
    assert!(!required);
}
