//! Architect agent: goal decomposition into an execution plan.
//!
//! `create_plan` asks the model for a JSON array of subtasks with 0-based
//! dependency indices, validates the decomposition (no subtask may belong to
//! the architect, every dependency must point strictly backwards), allocates
//! subtask ids up front, and commits the plan in `draft` status so the
//! request that later carries the approval decision can read it. LLM or
//! parse failures degrade to a keyword heuristic; validation failures do
//! not, because a malformed decomposition is an error rather than something
//! to paper over.

use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::maestro::agent_context::AgentKind;
use crate::maestro::agents::extract_json_payload;
use crate::maestro::error::{RuntimeError, RuntimeResult};
use crate::maestro::plan::{ExecutionPlan, Subtask, DEFAULT_ESTIMATED_TIME};
use crate::maestro::provider::LlmClient;
use crate::maestro::repo::PlanRepo;

/// Agents a subtask may be assigned to.
const VALID_SUBTASK_AGENTS: &[&str] = &["coder", "debug", "ask"];

/// Planner for complex tasks.
pub struct ArchitectAgent {
    plans: Arc<dyn PlanRepo>,
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl ArchitectAgent {
    pub fn new(plans: Arc<dyn PlanRepo>, llm: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        ArchitectAgent {
            plans,
            llm,
            model: model.into(),
        }
    }

    /// Decompose `task` into a draft plan and return its id.
    pub async fn create_plan(
        &self,
        session_id: &str,
        task: &str,
        context: &Value,
    ) -> RuntimeResult<String> {
        log::info!("architect creating plan for task: {:.100}", task);

        let analysis = self.analyze_task(task, context).await;
        validate_analysis(&analysis)?;

        let subtask_specs = analysis
            .get("subtasks")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut plan = ExecutionPlan::new(Uuid::new_v4().to_string(), session_id, task);

        // Ids are allocated up front so integer dependencies can be rewritten
        // into id references in one pass.
        let subtask_ids: Vec<String> = subtask_specs
            .iter()
            .map(|_| Uuid::new_v4().to_string())
            .collect();

        for (i, spec) in subtask_specs.iter().enumerate() {
            let description = spec
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let agent_name = spec.get("agent").and_then(|v| v.as_str()).unwrap_or("coder");
            let agent = AgentKind::parse(agent_name).ok_or_else(|| {
                RuntimeError::plan(format!("unknown agent '{}'", agent_name), &plan.id)
            })?;

            let dep_indices: Vec<usize> = spec
                .get("dependencies")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_u64().map(|n| n as usize))
                        .collect()
                })
                .unwrap_or_default();

            let mut subtask = Subtask::new(&subtask_ids[i], description, agent);
            subtask.dependencies = dep_indices.iter().map(|&d| subtask_ids[d].clone()).collect();
            subtask.estimated_time = spec
                .get("estimated_time")
                .and_then(|v| v.as_str())
                .unwrap_or(DEFAULT_ESTIMATED_TIME)
                .to_string();
            // Original indices kept for 1-based display during review.
            subtask.metadata = Some(json!({
                "index": i,
                "dependency_indices": dep_indices,
            }));
            plan.add_subtask(subtask);
        }

        // Committed immediately: the approval decision arrives on a later
        // request and must be able to read this plan.
        self.plans.save(&plan, true).await?;

        log::info!(
            "plan {} created and committed with {} subtasks",
            plan.id,
            plan.subtasks.len()
        );
        Ok(plan.id)
    }

    /// Ask the model for a decomposition; fall back to the heuristic on any
    /// LLM or parse failure.
    async fn analyze_task(&self, task: &str, context: &Value) -> Value {
        let prompt = build_planning_prompt(task, context);
        let messages = vec![
            json!({"role": "system", "content": "You are an expert software architect."}),
            json!({"role": "user", "content": prompt}),
        ];

        let response = match self
            .llm
            .chat_completion(&self.model, &messages, &[], Some(0.7), None)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                log::warn!("planning LLM call failed, using heuristic decomposition: {}", err);
                return heuristic_decomposition(task);
            }
        };

        let payload = extract_json_payload(&response.content);
        match serde_json::from_str::<Value>(&payload) {
            Ok(analysis) => {
                log::info!(
                    "LLM task analysis successful: {} subtasks identified",
                    analysis
                        .get("subtasks")
                        .and_then(|v| v.as_array())
                        .map(|a| a.len())
                        .unwrap_or(0)
                );
                analysis
            }
            Err(err) => {
                log::warn!(
                    "failed to parse planner reply as JSON ({}); using heuristic decomposition",
                    err
                );
                heuristic_decomposition(task)
            }
        }
    }
}

fn build_planning_prompt(task: &str, context: &Value) -> String {
    let context_text = if context.is_null() {
        "None".to_string()
    } else {
        serde_json::to_string_pretty(context).unwrap_or_else(|_| "None".to_string())
    };
    format!(
        r#"You are an expert software architect. Analyze this task and break it down into concrete, executable subtasks.

Task: {task}

Context: {context_text}

Requirements:
1. Each subtask must be concrete and actionable
2. Assign each subtask to the appropriate agent:
   - "coder": For code changes, file creation, implementation
   - "debug": For troubleshooting, fixing bugs, investigating issues
   - "ask": For answering questions, providing explanations
3. NEVER assign subtasks to "architect" - architect only creates plans
4. Specify dependencies by index (0-based) if subtasks depend on each other
5. Provide realistic time estimates

Respond with JSON only:
{{
  "reasoning": "Brief explanation of the decomposition strategy",
  "subtasks": [
    {{
      "description": "Clear description of what to do",
      "agent": "coder",
      "dependencies": [],
      "estimated_time": "5 min"
    }}
  ]
}}

JSON response:"#
    )
}

/// Keyword heuristic used when the LLM path fails: one coder subtask, plus a
/// dependent debug verification subtask when the goal smells like it needs
/// one.
fn heuristic_decomposition(task: &str) -> Value {
    let lower = task.to_lowercase();
    let mut subtasks = Vec::new();

    if ["create", "implement", "add", "build"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        subtasks.push(json!({
            "description": format!("Implement: {}", task),
            "agent": "coder",
            "dependencies": [],
            "estimated_time": "10 min",
        }));
    }

    if ["test", "verify", "check"].iter().any(|kw| lower.contains(kw)) {
        let deps: Vec<usize> = if subtasks.is_empty() { vec![] } else { vec![0] };
        subtasks.push(json!({
            "description": format!("Test and verify: {}", task),
            "agent": "debug",
            "dependencies": deps,
            "estimated_time": "5 min",
        }));
    }

    if subtasks.is_empty() {
        subtasks.push(json!({
            "description": task,
            "agent": "coder",
            "dependencies": [],
            "estimated_time": "10 min",
        }));
    }

    json!({
        "reasoning": "Heuristic decomposition (LLM analysis unavailable)",
        "subtasks": subtasks,
    })
}

/// Validate a decomposition before any plan row is written.
fn validate_analysis(analysis: &Value) -> RuntimeResult<()> {
    let subtasks = analysis
        .get("subtasks")
        .ok_or_else(|| plan_error("Analysis missing 'subtasks' field"))?;
    let subtasks = subtasks
        .as_array()
        .ok_or_else(|| plan_error("'subtasks' must be a list"))?;
    if subtasks.is_empty() {
        return Err(plan_error("Analysis has no subtasks"));
    }

    for (i, subtask) in subtasks.iter().enumerate() {
        if subtask.get("description").and_then(|v| v.as_str()).is_none() {
            return Err(plan_error(format!("Subtask {} missing 'description'", i)));
        }
        let agent = subtask
            .get("agent")
            .and_then(|v| v.as_str())
            .ok_or_else(|| plan_error(format!("Subtask {} missing 'agent'", i)))?;
        if agent == "architect" {
            return Err(plan_error(format!(
                "Subtask {} assigned to 'architect'. Architect cannot execute subtasks, only \
                 create plans.",
                i
            )));
        }
        if !VALID_SUBTASK_AGENTS.contains(&agent) {
            return Err(plan_error(format!(
                "Subtask {} has invalid agent: '{}'. Must be one of: {:?}",
                i, agent, VALID_SUBTASK_AGENTS
            )));
        }

        if let Some(deps) = subtask.get("dependencies") {
            let deps = deps
                .as_array()
                .ok_or_else(|| plan_error(format!("Subtask {} dependencies must be a list", i)))?;
            for dep in deps {
                let index = dep.as_i64().ok_or_else(|| {
                    plan_error(format!("Subtask {} dependency index must be integer", i))
                })?;
                // Strict forward dependencies: only earlier subtasks.
                if index < 0 || index >= i as i64 {
                    return Err(plan_error(format!(
                        "Subtask {} has invalid dependency index: {}",
                        i, index
                    )));
                }
            }
        }
    }

    log::debug!("plan analysis validated: {} subtasks", subtasks.len());
    Ok(())
}

fn plan_error(message: impl Into<String>) -> RuntimeError {
    RuntimeError::PlanExecution {
        message: message.into(),
        plan_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_only_dependencies() {
        // Subtask 0 depends on 1: not strictly backwards, rejected.
        let analysis = json!({
            "subtasks": [
                {"description": "a", "agent": "coder", "dependencies": [1]},
                {"description": "b", "agent": "coder", "dependencies": [0]},
            ]
        });
        let err = validate_analysis(&analysis).unwrap_err();
        assert!(err
            .to_string()
            .contains("Subtask 0 has invalid dependency index: 1"));
    }

    #[test]
    fn test_architect_assignment_rejected() {
        let analysis = json!({
            "subtasks": [{"description": "a", "agent": "architect", "dependencies": []}]
        });
        assert!(validate_analysis(&analysis).is_err());
    }

    #[test]
    fn test_empty_subtasks_rejected() {
        assert!(validate_analysis(&json!({"subtasks": []})).is_err());
        assert!(validate_analysis(&json!({})).is_err());
    }

    #[test]
    fn test_valid_analysis_passes() {
        let analysis = json!({
            "subtasks": [
                {"description": "a", "agent": "coder", "dependencies": []},
                {"description": "b", "agent": "debug", "dependencies": [0]},
            ]
        });
        validate_analysis(&analysis).unwrap();
    }

    #[test]
    fn test_heuristic_adds_verification_step() {
        let analysis = heuristic_decomposition("Implement the login form and test it");
        let subtasks = analysis["subtasks"].as_array().unwrap();
        assert_eq!(subtasks.len(), 2);
        assert_eq!(subtasks[0]["agent"], "coder");
        assert_eq!(subtasks[1]["agent"], "debug");
        assert_eq!(subtasks[1]["dependencies"][0], 0);
    }
}
