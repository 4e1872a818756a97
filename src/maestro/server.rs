//! HTTP transport: router, streaming bodies, and runtime assembly.
//!
//! The server exposes the session endpoints and converts each facade call
//! into a newline-delimited JSON stream of [`StreamChunk`]s. Handlers that
//! stream spawn the facade work onto its own task; the response body drains
//! the chunk channel until the producer finishes.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::maestro::agents::{AgentRegistry, ArchitectAgent, OrchestratorAgent, TaskClassifier};
use crate::maestro::approval::{ApprovalManager, ApprovalPolicy, ApprovalRequestType};
use crate::maestro::chunk::StreamChunk;
use crate::maestro::config::RuntimeConfig;
use crate::maestro::error::{RuntimeError, RuntimeResult};
use crate::maestro::event::{EventHandler, LoggingEventHandler};
use crate::maestro::executor::SubtaskExecutor;
use crate::maestro::facade::MessageFacade;
use crate::maestro::fsm::FsmOrchestrator;
use crate::maestro::locks::SessionLocks;
use crate::maestro::plan_service::PlanExecutionService;
use crate::maestro::provider::{LlmClient, ProxyClient};
use crate::maestro::repo::{
    ConversationRepo, Database, SqliteAgentContextRepo, SqliteApprovalRepo,
    SqliteConversationRepo, SqliteFsmStateRepo, SqlitePlanRepo,
};
use crate::maestro::session::Conversation;
use crate::maestro::stream_handler::StreamLlmHandler;
use crate::maestro::tools::ToolRegistry;

/// Conversations idle for longer than this are reclaimed by maintenance.
const CONVERSATION_RETENTION_HOURS: u32 = 168;

/// Shared application state handed to every route.
#[derive(Clone)]
pub struct AppState {
    pub facade: Arc<MessageFacade>,
    pub conversations: Arc<dyn ConversationRepo>,
    pub approvals: Arc<ApprovalManager>,
    pub config: Arc<RuntimeConfig>,
}

/// Wire the full runtime over the given database and provider client.
pub fn build_state(
    config: RuntimeConfig,
    db: Arc<Database>,
    llm: Arc<dyn LlmClient>,
) -> AppState {
    let events: Arc<dyn EventHandler> = Arc::new(LoggingEventHandler);

    let conversations: Arc<dyn ConversationRepo> =
        Arc::new(SqliteConversationRepo::new(db.clone()));
    let plans = Arc::new(SqlitePlanRepo::new(db.clone()));
    let approvals_repo = Arc::new(SqliteApprovalRepo::new(db.clone()));
    let fsm_repo = Arc::new(SqliteFsmStateRepo::new(db.clone()));
    let contexts = Arc::new(SqliteAgentContextRepo::new(db));

    let approvals = Arc::new(ApprovalManager::new(
        approvals_repo,
        ApprovalPolicy::default_policy(),
        events.clone(),
    ));
    let fsm = Arc::new(FsmOrchestrator::new(fsm_repo));
    let registry = Arc::new(if config.multi_agent_mode {
        AgentRegistry::multi_agent()
    } else {
        AgentRegistry::single_agent()
    });
    let tools = Arc::new(ToolRegistry::builtin());

    let handler = Arc::new(StreamLlmHandler::new(
        llm.clone(),
        tools,
        conversations.clone(),
        approvals.clone(),
        events.clone(),
        config.model.clone(),
    ));

    let classifier = Arc::new(TaskClassifier::new(llm.clone(), config.model.clone()));
    let architect = Arc::new(ArchitectAgent::new(
        plans.clone(),
        llm,
        config.model.clone(),
    ));
    let orchestrator = Arc::new(OrchestratorAgent::new(
        fsm.clone(),
        classifier,
        registry.clone(),
        architect,
        approvals.clone(),
        plans.clone(),
    ));

    let executor = Arc::new(SubtaskExecutor::new(
        plans.clone(),
        conversations.clone(),
        registry.clone(),
        handler.clone(),
        events.clone(),
    ));
    let plan_service = Arc::new(PlanExecutionService::new(
        plans.clone(),
        executor,
        events,
    ));

    let facade = Arc::new(MessageFacade::new(
        Arc::new(SessionLocks::new()),
        conversations.clone(),
        contexts,
        plans,
        fsm,
        approvals.clone(),
        registry,
        orchestrator,
        plan_service,
        handler,
    ));

    AppState {
        facade,
        conversations,
        approvals,
        config: Arc::new(config),
    }
}

/// Open the database and assemble the production runtime.
pub fn initialize(config: RuntimeConfig) -> RuntimeResult<AppState> {
    let db = Arc::new(Database::open(&config.db_path)?);
    let llm: Arc<dyn LlmClient> = Arc::new(ProxyClient::from_config(&config));
    Ok(build_state(config, db, llm))
}

/// Background sweepers: approval expiry and conversation retention.
pub fn spawn_maintenance(state: &AppState) {
    let approvals = state.approvals.clone();
    let ttl = Duration::from_secs(state.config.approval_timeout_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ttl);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = approvals.sweep_expired(ttl).await {
                log::error!("approval sweeper failed: {}", err);
            }
        }
    });

    let conversations = state.conversations.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = conversations
                .cleanup_older_than(CONVERSATION_RETENTION_HOURS)
                .await
            {
                log::error!("conversation cleanup failed: {}", err);
            }
        }
    });
}

/// Build the HTTP router over the application state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/messages", post(post_message))
        .route("/sessions/{id}/tool-results", post(post_tool_result))
        .route("/sessions/{id}/plan-decision", post(post_plan_decision))
        .route("/sessions/{id}/tool-decision", post(post_tool_decision))
        .route(
            "/sessions/{id}/pending-approvals",
            get(get_pending_approvals),
        )
        .route(
            "/sessions/{id}/plans/{plan_id}/subtasks/{subtask_id}/retry",
            post(post_subtask_retry),
        )
        .with_state(state)
}

/// Run the daemon until the process is terminated.
pub async fn run(config: RuntimeConfig) -> RuntimeResult<()> {
    let bind_addr = config.bind_addr.clone();
    let state = initialize(config)?;
    spawn_maintenance(&state);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| RuntimeError::Repository(format!("bind {}: {}", bind_addr, e)))?;
    log::info!("maestro listening on {}", bind_addr);
    axum::serve(listener, app)
        .await
        .map_err(|e| RuntimeError::Repository(format!("server: {}", e)))
}

// ── Request bodies ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    title: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PostMessageRequest {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ToolResultRequest {
    #[serde(alias = "callId")]
    #[allow(dead_code)]
    call_id: Option<String>,
    #[serde(alias = "toolCallId")]
    tool_call_id: String,
    result: String,
    #[serde(default, alias = "isError")]
    is_error: bool,
}

#[derive(Debug, Deserialize)]
struct PlanDecisionRequest {
    #[serde(alias = "approvalRequestId")]
    approval_request_id: String,
    decision: String,
    feedback: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ToolDecisionRequest {
    #[serde(alias = "approvalRequestId")]
    approval_request_id: String,
    decision: String,
    #[serde(alias = "modifiedArguments")]
    modified_arguments: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct PendingQuery {
    #[serde(rename = "type")]
    request_type: Option<String>,
}

// ── Handlers ─────────────────────────────────────────────────────────────

async fn healthz() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn create_session(
    State(state): State<AppState>,
    body: Option<Json<CreateSessionRequest>>,
) -> Response {
    let mut conversation = Conversation::new(Uuid::new_v4().to_string());
    if let Some(Json(request)) = body {
        conversation.title = request.title;
        conversation.description = request.description;
    }
    match state.conversations.save(&conversation).await {
        Ok(()) => (
            StatusCode::CREATED,
            Json(json!({
                "session_id": conversation.id,
                "title": conversation.title,
                "created_at": conversation.created_at.to_rfc3339(),
            })),
        )
            .into_response(),
        Err(err) => internal_error(err),
    }
}

async fn list_sessions(State(state): State<AppState>) -> Response {
    match state.conversations.find_active(100, 0).await {
        Ok(conversations) => {
            let sessions: Vec<Value> = conversations
                .iter()
                .map(|c| {
                    json!({
                        "session_id": c.id,
                        "title": c.title,
                        "is_active": c.is_active,
                        "last_activity": c.last_activity.to_rfc3339(),
                    })
                })
                .collect();
            Json(json!({"sessions": sessions})).into_response()
        }
        Err(err) => internal_error(err),
    }
}

async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.conversations.find_by_id(&id).await {
        Ok(Some(conversation)) => Json(json!({
            "session_id": conversation.id,
            "title": conversation.title,
            "description": conversation.description,
            "is_active": conversation.is_active,
            "created_at": conversation.created_at.to_rfc3339(),
            "last_activity": conversation.last_activity.to_rfc3339(),
            "message_count": conversation.message_count(),
            "messages": conversation.history_for_llm(None),
        }))
        .into_response(),
        Ok(None) => not_found(format!("session {}", id)),
        Err(err) => internal_error(err),
    }
}

async fn post_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PostMessageRequest>,
) -> Response {
    match state.conversations.find_by_id(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found(format!("session {}", id)),
        Err(err) => return internal_error(err),
    }

    let (tx, rx) = mpsc::channel::<StreamChunk>(64);
    let facade = state.facade.clone();
    tokio::spawn(async move {
        facade.handle_user_message(&id, &body.content, &tx).await;
    });
    stream_response(rx)
}

async fn post_tool_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ToolResultRequest>,
) -> Response {
    match state.conversations.find_by_id(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found(format!("session {}", id)),
        Err(err) => return internal_error(err),
    }

    let (tx, rx) = mpsc::channel::<StreamChunk>(64);
    let facade = state.facade.clone();
    tokio::spawn(async move {
        facade
            .handle_tool_result(&id, &body.tool_call_id, &body.result, body.is_error, &tx)
            .await;
    });
    stream_response(rx)
}

async fn post_plan_decision(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PlanDecisionRequest>,
) -> Response {
    // Approval-not-found is a client error, shaped before the stream opens.
    match state.facade.peek_pending(&body.approval_request_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found(format!("approval {}", body.approval_request_id)),
        Err(err) => return internal_error(err),
    }

    let (tx, rx) = mpsc::channel::<StreamChunk>(64);
    let facade = state.facade.clone();
    tokio::spawn(async move {
        facade
            .handle_plan_decision(
                &id,
                &body.approval_request_id,
                &body.decision,
                body.feedback,
                &tx,
            )
            .await;
    });
    stream_response(rx)
}

async fn post_tool_decision(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ToolDecisionRequest>,
) -> Response {
    match state.facade.peek_pending(&body.approval_request_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found(format!("approval {}", body.approval_request_id)),
        Err(err) => return internal_error(err),
    }

    let (tx, rx) = mpsc::channel::<StreamChunk>(64);
    let facade = state.facade.clone();
    tokio::spawn(async move {
        facade
            .handle_tool_decision(
                &id,
                &body.approval_request_id,
                &body.decision,
                body.modified_arguments,
                &tx,
            )
            .await;
    });
    stream_response(rx)
}

async fn post_subtask_retry(
    State(state): State<AppState>,
    Path((id, plan_id, subtask_id)): Path<(String, String, String)>,
) -> Response {
    match state.conversations.find_by_id(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found(format!("session {}", id)),
        Err(err) => return internal_error(err),
    }

    let (tx, rx) = mpsc::channel::<StreamChunk>(64);
    let facade = state.facade.clone();
    tokio::spawn(async move {
        facade
            .handle_subtask_retry(&id, &plan_id, &subtask_id, &tx)
            .await;
    });
    stream_response(rx)
}

async fn get_pending_approvals(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PendingQuery>,
) -> Response {
    let request_type = query
        .request_type
        .as_deref()
        .and_then(ApprovalRequestType::parse);
    match state.facade.list_pending(&id, request_type).await {
        Ok(pending) => Json(json!({"pending": pending})).into_response(),
        Err(err) => internal_error(err),
    }
}

// ── Response helpers ─────────────────────────────────────────────────────

/// Drain the chunk channel into a newline-delimited JSON body.
fn stream_response(rx: mpsc::Receiver<StreamChunk>) -> Response {
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| {
            (
                Ok::<Bytes, std::convert::Infallible>(Bytes::from(chunk.to_json_line())),
                rx,
            )
        })
    });
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn not_found(what: String) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("Not found: {}", what)})),
    )
        .into_response()
}

fn internal_error(err: RuntimeError) -> Response {
    log::error!("request failed: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": err.to_string()})),
    )
        .into_response()
}
