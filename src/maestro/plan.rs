//! Execution plan aggregate.
//!
//! An [`ExecutionPlan`] owns its ordered [`Subtask`] list. Subtasks reference
//! their dependencies by id (never by pointer), and the dependency graph is
//! resolved through the owning collection (see the resolver module). Status
//! changes on both aggregates are guarded: a subtask never jumps from
//! `pending` to `done` without passing through `running`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::maestro::agent_context::AgentKind;
use crate::maestro::error::{RuntimeError, RuntimeResult};

/// Default time estimate when the planner omits one.
pub const DEFAULT_ESTIMATED_TIME: &str = "5 min";

/// Lifecycle status of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    Approved,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Draft => "draft",
            PlanStatus::Approved => "approved",
            PlanStatus::InProgress => "in_progress",
            PlanStatus::Completed => "completed",
            PlanStatus::Failed => "failed",
            PlanStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<PlanStatus> {
        match value {
            "draft" => Some(PlanStatus::Draft),
            "approved" => Some(PlanStatus::Approved),
            "in_progress" => Some(PlanStatus::InProgress),
            "completed" => Some(PlanStatus::Completed),
            "failed" => Some(PlanStatus::Failed),
            "cancelled" => Some(PlanStatus::Cancelled),
            _ => None,
        }
    }

    /// Completed, failed and cancelled plans are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlanStatus::Completed | PlanStatus::Failed | PlanStatus::Cancelled
        )
    }
}

/// Lifecycle status of a subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    Running,
    Done,
    Failed,
    Blocked,
}

impl SubtaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubtaskStatus::Pending => "pending",
            SubtaskStatus::Running => "running",
            SubtaskStatus::Done => "done",
            SubtaskStatus::Failed => "failed",
            SubtaskStatus::Blocked => "blocked",
        }
    }

    pub fn parse(value: &str) -> Option<SubtaskStatus> {
        match value {
            "pending" => Some(SubtaskStatus::Pending),
            "running" => Some(SubtaskStatus::Running),
            "done" => Some(SubtaskStatus::Done),
            "failed" => Some(SubtaskStatus::Failed),
            "blocked" => Some(SubtaskStatus::Blocked),
            _ => None,
        }
    }
}

/// One node in a plan's dependency DAG, assigned to exactly one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub description: String,
    /// Assigned worker. Never the architect, which only creates plans.
    pub agent: AgentKind,
    /// Ids of subtasks that must be `done` before this one starts.
    pub dependencies: Vec<String>,
    pub status: SubtaskStatus,
    pub estimated_time: String,
    pub result: Option<String>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Free-form extras; the planner stores the original 0-based dependency
    /// indices here for display.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Subtask {
    pub fn new(id: impl Into<String>, description: impl Into<String>, agent: AgentKind) -> Self {
        Subtask {
            id: id.into(),
            description: description.into(),
            agent,
            dependencies: Vec::new(),
            status: SubtaskStatus::Pending,
            estimated_time: DEFAULT_ESTIMATED_TIME.to_string(),
            result: None,
            error: None,
            retry_count: 0,
            started_at: None,
            completed_at: None,
            metadata: None,
        }
    }

    /// Move `pending -> running`.
    pub fn start(&mut self) -> RuntimeResult<()> {
        if self.status != SubtaskStatus::Pending {
            return Err(RuntimeError::subtask(
                format!(
                    "cannot start subtask in status '{}'",
                    self.status.as_str()
                ),
                &self.id,
            ));
        }
        self.status = SubtaskStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Move `running -> done`, recording the result.
    pub fn complete(&mut self, result: impl Into<String>) -> RuntimeResult<()> {
        if self.status != SubtaskStatus::Running {
            return Err(RuntimeError::subtask(
                format!(
                    "cannot complete subtask in status '{}'",
                    self.status.as_str()
                ),
                &self.id,
            ));
        }
        self.status = SubtaskStatus::Done;
        self.result = Some(result.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Move `running -> failed`, recording the error.
    pub fn fail(&mut self, error: impl Into<String>) -> RuntimeResult<()> {
        if self.status != SubtaskStatus::Running {
            return Err(RuntimeError::subtask(
                format!("cannot fail subtask in status '{}'", self.status.as_str()),
                &self.id,
            ));
        }
        self.status = SubtaskStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Reset a failed subtask for a retry attempt.
    pub fn reset_to_pending(&mut self) {
        self.status = SubtaskStatus::Pending;
        self.result = None;
        self.error = None;
        self.started_at = None;
        self.completed_at = None;
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

/// An ordered decomposition of a goal into subtasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: String,
    pub conversation_id: String,
    pub goal: String,
    pub status: PlanStatus,
    pub subtasks: Vec<Subtask>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionPlan {
    pub fn new(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        goal: impl Into<String>,
    ) -> Self {
        ExecutionPlan {
            id: id.into(),
            conversation_id: conversation_id.into(),
            goal: goal.into(),
            status: PlanStatus::Draft,
            subtasks: Vec::new(),
            error: None,
            created_at: Utc::now(),
            approved_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn add_subtask(&mut self, subtask: Subtask) {
        self.subtasks.push(subtask);
    }

    pub fn subtask(&self, id: &str) -> Option<&Subtask> {
        self.subtasks.iter().find(|s| s.id == id)
    }

    pub fn subtask_mut(&mut self, id: &str) -> Option<&mut Subtask> {
        self.subtasks.iter_mut().find(|s| s.id == id)
    }

    /// Move `draft -> approved`.
    pub fn approve(&mut self) -> RuntimeResult<()> {
        if self.status != PlanStatus::Draft {
            return Err(RuntimeError::plan(
                format!("cannot approve plan in status '{}'", self.status.as_str()),
                &self.id,
            ));
        }
        self.status = PlanStatus::Approved;
        self.approved_at = Some(Utc::now());
        Ok(())
    }

    /// Move `approved | in_progress -> in_progress` (resumable execution).
    pub fn start(&mut self) -> RuntimeResult<()> {
        match self.status {
            PlanStatus::Approved => {
                self.status = PlanStatus::InProgress;
                self.started_at = Some(Utc::now());
                Ok(())
            }
            PlanStatus::InProgress => Ok(()),
            other => Err(RuntimeError::plan(
                format!("cannot start plan in status '{}'", other.as_str()),
                &self.id,
            )),
        }
    }

    pub fn complete(&mut self) -> RuntimeResult<()> {
        if self.status != PlanStatus::InProgress {
            return Err(RuntimeError::plan(
                format!("cannot complete plan in status '{}'", self.status.as_str()),
                &self.id,
            ));
        }
        self.status = PlanStatus::Completed;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> RuntimeResult<()> {
        if self.status.is_terminal() {
            return Err(RuntimeError::plan(
                format!("cannot fail plan in status '{}'", self.status.as_str()),
                &self.id,
            ));
        }
        self.status = PlanStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn cancel(&mut self) -> RuntimeResult<()> {
        if self.status.is_terminal() {
            return Err(RuntimeError::plan(
                format!("cannot cancel plan in status '{}'", self.status.as_str()),
                &self.id,
            ));
        }
        self.status = PlanStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn done_count(&self) -> usize {
        self.subtasks
            .iter()
            .filter(|s| s.status == SubtaskStatus::Done)
            .count()
    }

    /// Rough wall-clock estimate derived from the subtask count.
    pub fn total_estimated_time(&self) -> String {
        let n = self.subtasks.len();
        if n == 0 {
            "0 min".to_string()
        } else if n <= 3 {
            format!("{} min", n * 5)
        } else if n <= 10 {
            format!("{} min", n * 3)
        } else {
            format!("{} min", n / 2)
        }
    }

    /// Projection shown to the user during plan review.
    pub fn summary(&self) -> Value {
        let subtasks: Vec<Value> = self
            .subtasks
            .iter()
            .map(|s| {
                json!({
                    "id": s.id,
                    "description": s.description,
                    "agent": s.agent.as_str(),
                    "estimated_time": s.estimated_time,
                    "dependencies": s.dependencies,
                    "metadata": s.metadata.clone().unwrap_or(Value::Null),
                })
            })
            .collect();
        json!({
            "plan_id": self.id,
            "goal": self.goal,
            "status": self.status.as_str(),
            "subtasks_count": self.subtasks.len(),
            "total_estimated_time": self.total_estimated_time(),
            "subtasks": subtasks,
        })
    }

    /// Render the summary as a markdown checklist for the review chunk.
    pub fn format_for_review(&self) -> String {
        let mut lines = vec![
            "**Execution Plan Created**".to_string(),
            String::new(),
            format!("**Goal:** {}", self.goal),
            format!("**Subtasks:** {}", self.subtasks.len()),
            format!("**Estimated Time:** {}", self.total_estimated_time()),
            String::new(),
            "**Subtasks:**".to_string(),
        ];
        for (i, subtask) in self.subtasks.iter().enumerate() {
            let dep_indices: Vec<usize> = subtask
                .metadata
                .as_ref()
                .and_then(|m| m.get("dependency_indices"))
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_u64().map(|n| n as usize))
                        .collect()
                })
                .unwrap_or_default();
            let deps = if dep_indices.is_empty() {
                String::new()
            } else {
                // 1-based for display.
                format!(
                    " (depends on: {})",
                    dep_indices
                        .iter()
                        .map(|d| (d + 1).to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            };
            lines.push(format!(
                "{}. [{}] {} ({}){}",
                i + 1,
                subtask.agent.as_str().to_uppercase(),
                subtask.description,
                subtask.estimated_time,
                deps
            ));
        }
        lines.push(String::new());
        lines.push("Plan ready for execution. Awaiting approval...".to_string());
        lines.join("\n")
    }
}
