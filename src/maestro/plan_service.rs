//! Plan execution service.
//!
//! Drives an approved plan to completion: computes execution levels from the
//! dependency graph, runs each level's subtasks sequentially in insertion
//! order, reloads the plan between subtasks to observe side effects, and
//! stops at the first failure without attempting later levels. Terminal plan
//! transitions are always durable before the corresponding chunk is emitted.

use std::sync::Arc;

use serde_json::json;

use crate::maestro::chunk::{emit, ChunkSender, ChunkType, StreamChunk};
use crate::maestro::error::{RuntimeError, RuntimeResult};
use crate::maestro::event::{EventHandler, RuntimeEvent};
use crate::maestro::executor::SubtaskExecutor;
use crate::maestro::plan::{ExecutionPlan, PlanStatus, SubtaskStatus};
use crate::maestro::repo::PlanRepo;
use crate::maestro::resolver::DependencyResolver;

pub struct PlanExecutionService {
    plans: Arc<dyn PlanRepo>,
    executor: Arc<SubtaskExecutor>,
    resolver: DependencyResolver,
    events: Arc<dyn EventHandler>,
}

impl PlanExecutionService {
    pub fn new(
        plans: Arc<dyn PlanRepo>,
        executor: Arc<SubtaskExecutor>,
        events: Arc<dyn EventHandler>,
    ) -> Self {
        PlanExecutionService {
            plans,
            executor,
            resolver: DependencyResolver::new(),
            events,
        }
    }

    /// Execute the plan level by level, forwarding every chunk to `tx`.
    pub async fn execute(
        &self,
        plan_id: &str,
        session_id: &str,
        tx: &ChunkSender,
    ) -> RuntimeResult<()> {
        log::info!("starting execution of plan {}", plan_id);

        let mut plan = self.load(plan_id).await?;
        if !matches!(plan.status, PlanStatus::Approved | PlanStatus::InProgress) {
            return Err(RuntimeError::plan(
                format!(
                    "plan is not ready for execution (current: {})",
                    plan.status.as_str()
                ),
                plan_id,
            ));
        }
        if plan.subtasks.is_empty() {
            return Err(RuntimeError::plan("plan has no subtasks", plan_id));
        }

        plan.start()?;
        self.plans.save(&plan, true).await?;
        self.events
            .on_event(&RuntimeEvent::PlanExecutionStarted {
                plan_id: plan_id.to_string(),
                session_id: session_id.to_string(),
            })
            .await;

        emit(
            tx,
            StreamChunk::status(format!("Plan {} execution started", plan_id)).with_metadata(
                json!({
                    "plan_id": plan_id,
                    "goal": plan.goal,
                    "subtask_count": plan.subtasks.len(),
                    "status": "in_progress",
                }),
            ),
        )
        .await;

        let levels = self.resolver.execution_levels(&plan)?;
        log::info!("execution order for plan {}: {:?}", plan_id, levels);

        for level in levels {
            // Sequential inside the level, insertion order preserved.
            for subtask_id in level {
                let current = self.load(plan_id).await?;

                // Cancellation gate: never start the next subtask of a
                // cancelled plan.
                if current.status == PlanStatus::Cancelled {
                    log::info!("plan {} cancelled; stopping before {}", plan_id, subtask_id);
                    emit(
                        tx,
                        StreamChunk::status(format!("Plan {} cancelled", plan_id))
                            .with_metadata(json!({"plan_id": plan_id, "status": "cancelled"}))
                            .finalize(true),
                    )
                    .await;
                    return Ok(());
                }

                // Resumable execution: completed subtasks are skipped.
                let status = current
                    .subtask(&subtask_id)
                    .map(|s| s.status)
                    .ok_or_else(|| {
                        RuntimeError::plan(
                            format!("subtask {} missing during execution", subtask_id),
                            plan_id,
                        )
                    })?;
                if status == SubtaskStatus::Done {
                    continue;
                }

                self.executor
                    .execute(plan_id, &subtask_id, session_id, tx)
                    .await?;

                // Reload to observe the executor's writes.
                let reloaded = self.load(plan_id).await?;
                let settled = reloaded.subtask(&subtask_id).map(|s| s.status);
                if settled == Some(SubtaskStatus::Failed) {
                    let error = reloaded
                        .subtask(&subtask_id)
                        .and_then(|s| s.error.clone())
                        .unwrap_or_else(|| "subtask failed".to_string());
                    return self.fail_plan(reloaded, &subtask_id, &error, tx).await;
                }
            }
        }

        let mut plan = self.load(plan_id).await?;
        let total = plan.subtasks.len();
        let done = plan.done_count();
        plan.complete()?;
        self.plans.save(&plan, true).await?;
        self.events
            .on_event(&RuntimeEvent::PlanCompleted {
                plan_id: plan_id.to_string(),
                total_subtasks: total,
                successful_subtasks: done,
            })
            .await;
        log::info!("plan {} completed successfully", plan_id);

        let mut completed = StreamChunk::new(ChunkType::PlanCompleted);
        completed.content = Some(format!("Plan {} completed successfully", plan_id));
        completed.plan_id = Some(plan_id.to_string());
        completed.metadata = Some(json!({
            "plan_id": plan_id,
            "status": "completed",
            "subtask_count": total,
            "started_at": plan.started_at.map(|t| t.to_rfc3339()),
            "completed_at": plan.completed_at.map(|t| t.to_rfc3339()),
        }));
        emit(tx, completed).await;

        let mut summary = StreamChunk::new(ChunkType::ExecutionCompleted);
        summary.content = Some(format!(
            "Plan execution completed: {}/{} subtasks successful",
            done, total
        ));
        summary.plan_id = Some(plan_id.to_string());
        summary.metadata = Some(json!({
            "plan_id": plan_id,
            "completed_subtasks": done,
            "total_subtasks": total,
            "status": "completed",
        }));
        summary.is_final = true;
        emit(tx, summary).await;

        Ok(())
    }

    /// Shared handle to the subtask executor (retry endpoint).
    pub fn executor(&self) -> Arc<SubtaskExecutor> {
        self.executor.clone()
    }

    /// Cancel a plan before its next subtask starts.
    pub async fn cancel(&self, plan_id: &str, reason: &str) -> RuntimeResult<()> {
        log::info!("cancelling plan {}: {}", plan_id, reason);
        let mut plan = self.load(plan_id).await?;
        plan.cancel()?;
        self.plans.save(&plan, true).await?;
        self.events
            .on_event(&RuntimeEvent::PlanCancelled {
                plan_id: plan_id.to_string(),
                reason: reason.to_string(),
            })
            .await;
        Ok(())
    }

    async fn load(&self, plan_id: &str) -> RuntimeResult<ExecutionPlan> {
        self.plans
            .find_by_id(plan_id)
            .await?
            .ok_or_else(|| RuntimeError::plan("plan not found", plan_id))
    }

    async fn fail_plan(
        &self,
        mut plan: ExecutionPlan,
        subtask_id: &str,
        error: &str,
        tx: &ChunkSender,
    ) -> RuntimeResult<()> {
        log::error!(
            "subtask {} failed, stopping execution of plan {}",
            subtask_id,
            plan.id
        );
        let message = format!("Subtask {} failed: {}", subtask_id, error);
        if !plan.status.is_terminal() {
            plan.fail(&message)?;
            self.plans.save(&plan, true).await?;
        }
        self.events
            .on_event(&RuntimeEvent::PlanFailed {
                plan_id: plan.id.clone(),
                error: message.clone(),
            })
            .await;

        emit(
            tx,
            StreamChunk::error(format!("Plan execution failed: {}", message)).with_metadata(
                json!({
                    "plan_id": plan.id,
                    "subtask_id": subtask_id,
                    "status": "failed",
                }),
            ),
        )
        .await;
        Ok(())
    }
}
