//! Dependency resolution over a plan's subtask DAG.
//!
//! Subtasks reference dependencies by id through the owning plan, so the
//! graph carries no owning pointers and cycle detection is a plain DFS with
//! a recursion stack. Tie-break everywhere is insertion order.

use std::collections::{HashMap, HashSet};

use crate::maestro::error::{RuntimeError, RuntimeResult};
use crate::maestro::plan::{ExecutionPlan, SubtaskStatus};

/// Stateless resolver for subtask ordering and validation.
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyResolver;

impl DependencyResolver {
    pub fn new() -> Self {
        DependencyResolver
    }

    /// Ids of pending subtasks whose dependencies are all `done`, in
    /// insertion order.
    pub fn ready_set(&self, plan: &ExecutionPlan) -> Vec<String> {
        let done: HashSet<&str> = plan
            .subtasks
            .iter()
            .filter(|s| s.status == SubtaskStatus::Done)
            .map(|s| s.id.as_str())
            .collect();

        plan.subtasks
            .iter()
            .filter(|s| s.status == SubtaskStatus::Pending)
            .filter(|s| s.dependencies.iter().all(|d| done.contains(d.as_str())))
            .map(|s| s.id.clone())
            .collect()
    }

    /// DFS cycle detection with a recursion stack; true on any back-edge.
    pub fn has_cycle(&self, plan: &ExecutionPlan) -> bool {
        let graph: HashMap<&str, &[String]> = plan
            .subtasks
            .iter()
            .map(|s| (s.id.as_str(), s.dependencies.as_slice()))
            .collect();

        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack: HashSet<&str> = HashSet::new();

        for subtask in &plan.subtasks {
            if !visited.contains(subtask.id.as_str())
                && cycle_dfs(subtask.id.as_str(), &graph, &mut visited, &mut stack)
            {
                log::warn!("cyclic dependency detected in plan {}", plan.id);
                return true;
            }
        }
        false
    }

    /// Group subtask ids into execution levels.
    ///
    /// Level *k* contains every subtask whose dependencies all live in levels
    /// `< k`; subtasks inside a level are independent of each other. Errors
    /// on a cyclic graph (the levels would never drain).
    pub fn execution_levels(&self, plan: &ExecutionPlan) -> RuntimeResult<Vec<Vec<String>>> {
        if self.has_cycle(plan) {
            return Err(RuntimeError::plan(
                "cannot determine execution order: cyclic dependencies detected",
                &plan.id,
            ));
        }

        let mut levels: Vec<Vec<String>> = Vec::new();
        let mut placed: HashSet<&str> = HashSet::new();
        let mut remaining: Vec<&str> = plan.subtasks.iter().map(|s| s.id.as_str()).collect();
        let deps: HashMap<&str, &[String]> = plan
            .subtasks
            .iter()
            .map(|s| (s.id.as_str(), s.dependencies.as_slice()))
            .collect();

        while !remaining.is_empty() {
            let mut level: Vec<String> = Vec::new();
            remaining.retain(|id| {
                let ready = deps[id].iter().all(|d| placed.contains(d.as_str()));
                if ready {
                    level.push((*id).to_string());
                }
                !ready
            });

            if level.is_empty() {
                // Unreachable after the cycle check unless deps dangle.
                return Err(RuntimeError::plan(
                    format!("deadlock in dependency graph; stuck subtasks: {:?}", remaining),
                    &plan.id,
                ));
            }
            for id in &level {
                placed.insert(lookup(plan, id));
            }
            levels.push(level);
        }

        log::debug!("plan {} resolved into {} levels", plan.id, levels.len());
        Ok(levels)
    }

    /// Validate the dependency graph: cycles, dangling references, and
    /// self-dependencies. Returns the list of errors, empty when clean.
    pub fn validate(&self, plan: &ExecutionPlan) -> Vec<String> {
        let mut errors = Vec::new();

        if self.has_cycle(plan) {
            errors.push("Cyclic dependencies detected".to_string());
        }

        let ids: HashSet<&str> = plan.subtasks.iter().map(|s| s.id.as_str()).collect();
        for subtask in &plan.subtasks {
            for dep in &subtask.dependencies {
                if !ids.contains(dep.as_str()) {
                    errors.push(format!(
                        "Subtask {} depends on non-existent subtask {}",
                        subtask.id, dep
                    ));
                }
            }
            if subtask.dependencies.iter().any(|d| d == &subtask.id) {
                errors.push(format!("Subtask {} has self-dependency", subtask.id));
            }
        }

        errors
    }

    /// Subtasks that (transitively or directly) depend on `subtask_id`.
    pub fn dependents(&self, plan: &ExecutionPlan, subtask_id: &str) -> Vec<String> {
        plan.subtasks
            .iter()
            .filter(|s| s.dependencies.iter().any(|d| d == subtask_id))
            .map(|s| s.id.clone())
            .collect()
    }
}

// Re-borrow an id from the plan so placed-set entries outlive the level vec.
fn lookup<'a>(plan: &'a ExecutionPlan, id: &str) -> &'a str {
    plan.subtasks
        .iter()
        .find(|s| s.id == id)
        .map(|s| s.id.as_str())
        .unwrap_or("")
}

fn cycle_dfs<'a>(
    node: &'a str,
    graph: &HashMap<&'a str, &'a [String]>,
    visited: &mut HashSet<&'a str>,
    stack: &mut HashSet<&'a str>,
) -> bool {
    visited.insert(node);
    stack.insert(node);

    if let Some(deps) = graph.get(node) {
        for dep in deps.iter() {
            let dep = dep.as_str();
            if !visited.contains(dep) {
                if graph.contains_key(dep) && cycle_dfs(dep, graph, visited, stack) {
                    return true;
                }
            } else if stack.contains(dep) {
                log::warn!("cycle detected: {} -> {}", node, dep);
                return true;
            }
        }
    }

    stack.remove(node);
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maestro::agent_context::AgentKind;
    use crate::maestro::plan::Subtask;

    fn plan_with(deps: &[&[usize]]) -> ExecutionPlan {
        let mut plan = ExecutionPlan::new("p1", "s1", "goal");
        for (i, dep_list) in deps.iter().enumerate() {
            let mut subtask = Subtask::new(format!("st-{}", i), format!("task {}", i), AgentKind::Coder);
            subtask.dependencies = dep_list.iter().map(|d| format!("st-{}", d)).collect();
            plan.add_subtask(subtask);
        }
        plan
    }

    #[test]
    fn test_ready_set_requires_done_dependencies() {
        let resolver = DependencyResolver::new();
        let mut plan = plan_with(&[&[], &[0], &[1]]);
        assert_eq!(resolver.ready_set(&plan), vec!["st-0"]);

        let first = plan.subtask_mut("st-0").unwrap();
        first.start().unwrap();
        first.complete("ok").unwrap();
        assert_eq!(resolver.ready_set(&plan), vec!["st-1"]);
    }

    #[test]
    fn test_cycle_detection_matches_validate() {
        let resolver = DependencyResolver::new();
        let cyclic = plan_with(&[&[1], &[0]]);
        assert!(resolver.has_cycle(&cyclic));
        assert!(resolver
            .validate(&cyclic)
            .iter()
            .any(|e| e.contains("Cyclic")));

        let acyclic = plan_with(&[&[], &[0], &[0, 1]]);
        assert!(!resolver.has_cycle(&acyclic));
        assert!(resolver.validate(&acyclic).is_empty());
    }

    #[test]
    fn test_execution_levels_law() {
        let resolver = DependencyResolver::new();
        // st-0 and st-1 independent, st-2 needs both, st-3 needs st-2.
        let plan = plan_with(&[&[], &[], &[0, 1], &[2]]);
        let levels = resolver.execution_levels(&plan).unwrap();
        assert_eq!(levels, vec![
            vec!["st-0".to_string(), "st-1".to_string()],
            vec!["st-2".to_string()],
            vec!["st-3".to_string()],
        ]);

        // Union covers every subtask and levels are disjoint.
        let all: Vec<&String> = levels.iter().flatten().collect();
        assert_eq!(all.len(), plan.subtasks.len());
        let unique: std::collections::HashSet<&String> = all.iter().copied().collect();
        assert_eq!(unique.len(), all.len());
    }

    #[test]
    fn test_execution_levels_rejects_cycle() {
        let resolver = DependencyResolver::new();
        let plan = plan_with(&[&[1], &[0]]);
        assert!(resolver.execution_levels(&plan).is_err());
    }

    #[test]
    fn test_validate_reports_dangling_and_self_deps() {
        let resolver = DependencyResolver::new();
        let mut plan = plan_with(&[&[]]);
        plan.subtasks[0].dependencies = vec!["st-0".to_string(), "st-9".to_string()];
        let errors = resolver.validate(&plan);
        assert!(errors.iter().any(|e| e.contains("self-dependency")));
        assert!(errors.iter().any(|e| e.contains("non-existent")));
    }
}
