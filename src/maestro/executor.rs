//! Subtask execution with conversational context isolation.
//!
//! Each subtask runs against a fresh working message log: the executor
//! snapshots the conversation, resets it to the base system prompt plus a
//! synthetic preamble carrying the plan goal and the results of completed
//! dependencies, and only then invokes the assigned worker. Tool-call ids
//! from one subtask can therefore never collide with another's, and a worker
//! sees exactly the information it needs. Every exit path (success,
//! failure, or fault) restores the conversation from the snapshot
//! (preserving the final assistant message as the subtask result) and
//! deletes the snapshot.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;

use crate::maestro::agents::{AgentRegistry, WorkerAgent};
use crate::maestro::chunk::{emit, ChunkSender, ChunkType, StreamChunk};
use crate::maestro::error::{RuntimeError, RuntimeResult};
use crate::maestro::event::{EventHandler, RuntimeEvent};
use crate::maestro::plan::SubtaskStatus;
use crate::maestro::repo::{ConversationRepo, PlanRepo};
use crate::maestro::session::{ConversationSnapshot, Message};
use crate::maestro::stream_handler::StreamLlmHandler;

/// Assistant content that marks an LLM-side failure even when no error chunk
/// was produced.
const LLM_FAILURE_SENTINELS: &[&str] =
    &["[Error]", "LiteLLM proxy unavailable", "No tool output found"];

/// Outcome of the isolated worker run.
struct WorkerRun {
    /// Error message when the run must mark the subtask failed.
    failure: Option<String>,
    /// Aggregated assistant text, recorded as the subtask result on success.
    result_text: String,
}

pub struct SubtaskExecutor {
    plans: Arc<dyn PlanRepo>,
    conversations: Arc<dyn ConversationRepo>,
    registry: Arc<AgentRegistry>,
    handler: Arc<StreamLlmHandler>,
    events: Arc<dyn EventHandler>,
}

impl SubtaskExecutor {
    pub fn new(
        plans: Arc<dyn PlanRepo>,
        conversations: Arc<dyn ConversationRepo>,
        registry: Arc<AgentRegistry>,
        handler: Arc<StreamLlmHandler>,
        events: Arc<dyn EventHandler>,
    ) -> Self {
        SubtaskExecutor {
            plans,
            conversations,
            registry,
            handler,
            events,
        }
    }

    /// Execute one subtask, forwarding every worker chunk verbatim and
    /// leaving the subtask in a terminal status (`done` or `failed`).
    pub async fn execute(
        &self,
        plan_id: &str,
        subtask_id: &str,
        session_id: &str,
        tx: &ChunkSender,
    ) -> RuntimeResult<()> {
        log::info!(
            "starting execution of subtask {} from plan {}",
            subtask_id,
            plan_id
        );

        let mut plan = self
            .plans
            .find_by_id(plan_id)
            .await?
            .ok_or_else(|| RuntimeError::subtask(format!("plan {} not found", plan_id), subtask_id))?;

        let subtask = plan.subtask(subtask_id).ok_or_else(|| {
            RuntimeError::subtask(
                format!("subtask not found in plan {}", plan_id),
                subtask_id,
            )
        })?;
        if subtask.status != SubtaskStatus::Pending {
            return Err(RuntimeError::subtask(
                format!(
                    "subtask is not pending (current: {})",
                    subtask.status.as_str()
                ),
                subtask_id,
            ));
        }

        let agent = subtask.agent;
        let description = subtask.description.clone();
        let profile = self
            .registry
            .get(agent)
            .ok_or_else(|| {
                RuntimeError::subtask(format!("agent {} not available", agent), subtask_id)
            })?
            .clone();

        // Dependency results from completed predecessors.
        let dependency_context: Vec<(String, String)> = subtask
            .dependencies
            .iter()
            .filter_map(|dep_id| plan.subtask(dep_id))
            .filter(|dep| dep.status == SubtaskStatus::Done)
            .map(|dep| {
                (
                    dep.description.clone(),
                    dep.result.clone().unwrap_or_default(),
                )
            })
            .collect();

        plan.subtask_mut(subtask_id)
            .expect("subtask checked above")
            .start()?;
        self.events
            .on_event(&RuntimeEvent::SubtaskStarted {
                plan_id: plan_id.to_string(),
                subtask_id: subtask_id.to_string(),
                agent: agent.as_str().to_string(),
            })
            .await;
        self.plans.save(&plan, true).await?;

        // Snapshot the conversation, then install the isolated context.
        let mut conversation = self
            .conversations
            .find_by_id(session_id)
            .await?
            .ok_or_else(|| {
                RuntimeError::subtask(format!("conversation {} not found", session_id), subtask_id)
            })?;
        let snapshot = ConversationSnapshot::capture(&conversation);
        self.conversations.save_snapshot(&snapshot).await?;
        log::info!(
            "created isolated context for subtask {} (snapshot: {})",
            subtask_id,
            snapshot.id
        );

        let base_prompt = conversation
            .base_system_prompt()
            .unwrap_or(&profile.system_prompt)
            .to_string();
        let preamble = build_preamble(&plan.goal, &description, &dependency_context);
        conversation.messages = vec![
            Message::system(base_prompt),
            Message::system(preamble),
            Message::user(&description),
        ];
        self.conversations.save(&conversation).await?;

        // Run the worker, forwarding its chunks as they arrive.
        let run = self
            .run_worker(profile.kind, session_id, tx, profile.clone())
            .await;

        // Terminal status, events, and the final chunk for this subtask.
        let outcome = match run {
            Ok(run) => self.settle(plan_id, subtask_id, agent.as_str(), run, tx).await,
            Err(err) => {
                // Fault path: mark failed unless something already settled it.
                let message = err.to_string();
                log::error!("error executing subtask {}: {}", subtask_id, message);
                self.mark_failed_if_open(plan_id, subtask_id, &message).await;
                emit(
                    tx,
                    StreamChunk::error(&message)
                        .with_metadata(json!({"subtask_id": subtask_id, "status": "failed"})),
                )
                .await;
                Ok(())
            }
        };

        // Restore on every exit path, keeping the final assistant message as
        // the visible subtask result.
        if let Err(err) = self.restore_snapshot(session_id, &snapshot).await {
            log::error!("error restoring snapshot {}: {}", snapshot.id, err);
        }

        outcome
    }

    /// Reset a failed subtask and run it again.
    pub async fn retry(
        &self,
        plan_id: &str,
        subtask_id: &str,
        session_id: &str,
        tx: &ChunkSender,
    ) -> RuntimeResult<()> {
        log::info!("retrying failed subtask {}", subtask_id);

        let mut plan = self
            .plans
            .find_by_id(plan_id)
            .await?
            .ok_or_else(|| RuntimeError::subtask(format!("plan {} not found", plan_id), subtask_id))?;
        let subtask = plan.subtask_mut(subtask_id).ok_or_else(|| {
            RuntimeError::subtask(
                format!("subtask not found in plan {}", plan_id),
                subtask_id,
            )
        })?;
        if subtask.status != SubtaskStatus::Failed {
            return Err(RuntimeError::subtask(
                format!(
                    "subtask is not failed (current: {})",
                    subtask.status.as_str()
                ),
                subtask_id,
            ));
        }

        subtask.reset_to_pending();
        subtask.retry_count += 1;
        let retry_count = subtask.retry_count;
        self.plans.save(&plan, true).await?;
        self.events
            .on_event(&RuntimeEvent::SubtaskRetried {
                plan_id: plan_id.to_string(),
                subtask_id: subtask_id.to_string(),
                retry_count,
            })
            .await;

        self.execute(plan_id, subtask_id, session_id, tx).await
    }

    /// Run the worker on its own task, forwarding and inspecting each chunk.
    async fn run_worker(
        &self,
        kind: crate::maestro::agent_context::AgentKind,
        session_id: &str,
        tx: &ChunkSender,
        profile: crate::maestro::agents::AgentProfile,
    ) -> RuntimeResult<WorkerRun> {
        let (worker_tx, mut worker_rx) = mpsc::channel::<StreamChunk>(64);
        let worker = WorkerAgent::new(profile, self.handler.clone(), self.conversations.clone());
        let session = session_id.to_string();
        let join = tokio::spawn(async move { worker.process(&session, &worker_tx).await });

        let mut failure: Option<String> = None;
        let mut content_parts: Vec<String> = Vec::new();

        while let Some(chunk) = worker_rx.recv().await {
            if chunk.chunk_type == ChunkType::Error {
                failure = Some(
                    chunk
                        .error
                        .clone()
                        .unwrap_or_else(|| "subtask failed with error".to_string()),
                );
            }
            if let Some(content) = &chunk.content {
                if !content.is_empty() {
                    content_parts.push(content.clone());
                }
            }
            log::debug!(
                "forwarded chunk from {} agent: type={:?}, is_final={}",
                kind,
                chunk.chunk_type,
                chunk.is_final
            );
            emit(tx, chunk).await;
        }

        match join.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(err) => {
                return Err(RuntimeError::SubtaskExecution {
                    message: format!("worker task panicked: {}", err),
                    subtask_id: None,
                })
            }
        }

        let result_text = content_parts.join("\n");
        if failure.is_none() {
            if let Some(sentinel) = LLM_FAILURE_SENTINELS
                .iter()
                .find(|s| result_text.contains(*s))
            {
                failure = Some(format!(
                    "LLM failure detected in subtask output: {}",
                    sentinel
                ));
            }
        }

        Ok(WorkerRun {
            failure,
            result_text,
        })
    }

    /// Record the terminal subtask status and emit the closing chunk.
    async fn settle(
        &self,
        plan_id: &str,
        subtask_id: &str,
        agent: &str,
        run: WorkerRun,
        tx: &ChunkSender,
    ) -> RuntimeResult<()> {
        let mut plan = self
            .plans
            .find_by_id(plan_id)
            .await?
            .ok_or_else(|| RuntimeError::subtask(format!("plan {} not found", plan_id), subtask_id))?;
        let subtask = plan.subtask_mut(subtask_id).ok_or_else(|| {
            RuntimeError::subtask(
                format!("subtask not found in plan {}", plan_id),
                subtask_id,
            )
        })?;

        match run.failure {
            Some(error) => {
                let truncated: String = error.chars().take(500).collect();
                subtask.fail(&truncated)?;
                self.plans.save(&plan, true).await?;
                self.events
                    .on_event(&RuntimeEvent::SubtaskFailed {
                        plan_id: plan_id.to_string(),
                        subtask_id: subtask_id.to_string(),
                        error: truncated.clone(),
                    })
                    .await;
                log::error!("subtask {} failed: {:.200}", subtask_id, truncated);
                emit(
                    tx,
                    StreamChunk::error(&truncated)
                        .with_metadata(json!({
                            "subtask_id": subtask_id,
                            "status": "failed",
                            "agent": agent,
                        })),
                )
                .await;
            }
            None => {
                subtask.complete(&run.result_text)?;
                let metadata = json!({
                    "subtask_id": subtask_id,
                    "status": "completed",
                    "agent": agent,
                    "started_at": subtask.started_at.map(|t| t.to_rfc3339()),
                    "completed_at": subtask.completed_at.map(|t| t.to_rfc3339()),
                    "duration_seconds": subtask.duration_seconds(),
                });
                self.plans.save(&plan, true).await?;
                self.events
                    .on_event(&RuntimeEvent::SubtaskCompleted {
                        plan_id: plan_id.to_string(),
                        subtask_id: subtask_id.to_string(),
                    })
                    .await;
                log::info!("subtask {} completed by {} agent", subtask_id, agent);
                let mut chunk = StreamChunk::new(ChunkType::SubtaskCompleted);
                chunk.content = Some(format!("Subtask {} completed", subtask_id));
                chunk.metadata = Some(metadata);
                chunk.is_final = true;
                emit(tx, chunk).await;
            }
        }
        Ok(())
    }

    /// Fault path: fail the subtask only when it is still open.
    async fn mark_failed_if_open(&self, plan_id: &str, subtask_id: &str, error: &str) {
        let plan = match self.plans.find_by_id(plan_id).await {
            Ok(Some(plan)) => plan,
            _ => return,
        };
        let mut plan = plan;
        if let Some(subtask) = plan.subtask_mut(subtask_id) {
            if matches!(
                subtask.status,
                SubtaskStatus::Pending | SubtaskStatus::Running | SubtaskStatus::Blocked
            ) {
                // A pending subtask must pass through running before failing.
                if subtask.status == SubtaskStatus::Pending {
                    let _ = subtask.start();
                }
                if subtask.fail(error).is_ok() {
                    let _ = self.plans.save(&plan, true).await;
                    self.events
                        .on_event(&RuntimeEvent::SubtaskFailed {
                            plan_id: plan_id.to_string(),
                            subtask_id: subtask_id.to_string(),
                            error: error.to_string(),
                        })
                        .await;
                    log::info!("subtask {} marked as failed", subtask_id);
                }
            } else {
                log::warn!(
                    "subtask {} already terminal ({}), skipping fail",
                    subtask_id,
                    subtask.status.as_str()
                );
            }
        }
    }

    /// Put the pre-run message log back, appending the last assistant
    /// message of the isolated run as the visible subtask result, then drop
    /// the snapshot.
    async fn restore_snapshot(
        &self,
        session_id: &str,
        snapshot: &ConversationSnapshot,
    ) -> RuntimeResult<()> {
        let mut conversation = self
            .conversations
            .find_by_id(session_id)
            .await?
            .ok_or_else(|| RuntimeError::NotFound(format!("conversation {}", session_id)))?;

        let subtask_result = conversation.last_assistant_message().cloned();

        conversation.messages = snapshot.messages.clone();
        if let Some(result) = subtask_result {
            conversation.messages.push(Message::assistant(result.content));
        }
        self.conversations.save(&conversation).await?;
        self.conversations.delete_snapshot(&snapshot.id).await?;
        log::info!(
            "restored session {} from snapshot {}",
            session_id,
            snapshot.id
        );
        Ok(())
    }
}

fn build_preamble(goal: &str, description: &str, dependencies: &[(String, String)]) -> String {
    let mut preamble = format!(
        "You are executing one subtask of a larger plan.\n\nPlan goal: {}\n\nYour subtask: {}\n",
        goal, description
    );
    if !dependencies.is_empty() {
        preamble.push_str("\nResults of completed prerequisite subtasks:\n");
        for (i, (dep_description, dep_result)) in dependencies.iter().enumerate() {
            preamble.push_str(&format!(
                "{}. {}\n   Result: {}\n",
                i + 1,
                dep_description,
                dep_result
            ));
        }
    }
    preamble.push_str("\nFocus only on this subtask.");
    preamble
}
