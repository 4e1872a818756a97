//! The closed set of agents and their profiles.
//!
//! Agents are variants of [`AgentKind`] with a system prompt, a tool
//! allow-list, and optional file-pattern write restrictions. The registry
//! contents are fixed at boot: multi-agent mode carries all six variants,
//! single-agent mode only the orchestrator and the universal worker. The
//! mode is a configuration switch, not a branch in the routing code.

mod architect;
mod classifier;
mod orchestrator;
mod worker;

pub use architect::ArchitectAgent;
pub use classifier::{Classification, TaskClassifier};
pub use orchestrator::{OrchestratorAgent, OrchestratorOutcome};
pub use worker::WorkerAgent;

use std::collections::HashMap;

use regex::Regex;

pub use crate::maestro::agent_context::AgentKind;

pub const ORCHESTRATOR_PROMPT: &str = "You are the orchestrator of a multi-agent coding \
assistant. You never solve tasks yourself: you analyze each request and route it to the \
specialist best suited to handle it.";

pub const CODER_PROMPT: &str = "You are a senior software engineer. You implement features, \
write code, and modify files. Work in small verifiable steps and use the available tools to \
inspect and change the workspace. Call at most one tool at a time and wait for its result.";

pub const ARCHITECT_PROMPT: &str = "You are a software architect. You design systems, write \
technical specifications, and decompose complex goals into ordered, executable subtasks. You \
may only create or edit markdown (.md) documents; code changes belong to the coder.";

pub const DEBUG_PROMPT: &str = "You are a debugging specialist. You investigate failures, \
reproduce issues, and verify fixes. Prefer reading code and running commands over guessing. \
Call at most one tool at a time and wait for its result.";

pub const ASK_PROMPT: &str = "You are a technical explainer. You answer questions about the \
codebase and its concepts clearly and concisely, reading files when needed.";

pub const UNIVERSAL_PROMPT: &str = "You are a full-stack coding assistant handling analysis, \
implementation, debugging, and explanation in a single role. Use the available tools to \
inspect and change the workspace; call at most one tool at a time and wait for its result.";

/// Static description of one agent: prompt, allow-list, file restrictions.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub kind: AgentKind,
    pub system_prompt: String,
    pub allowed_tools: Vec<String>,
    /// Regex patterns limiting which files the agent may write.
    pub file_restrictions: Vec<String>,
}

impl AgentProfile {
    fn new(kind: AgentKind, system_prompt: &str, allowed_tools: &[&str]) -> Self {
        AgentProfile {
            kind,
            system_prompt: system_prompt.to_string(),
            allowed_tools: allowed_tools.iter().map(|t| t.to_string()).collect(),
            file_restrictions: Vec::new(),
        }
    }

    fn with_file_restrictions(mut self, patterns: &[&str]) -> Self {
        self.file_restrictions = patterns.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn can_use_tool(&self, tool_name: &str) -> bool {
        self.allowed_tools.iter().any(|t| t == tool_name)
    }

    /// True when the agent may write the given path. No restrictions means
    /// every path is allowed.
    pub fn can_edit_file(&self, path: &str) -> bool {
        if self.file_restrictions.is_empty() {
            return true;
        }
        self.file_restrictions.iter().any(|pattern| {
            Regex::new(pattern)
                .map(|re| re.is_match(path))
                .unwrap_or(false)
        })
    }
}

/// The agents available in this deployment, fixed at boot.
pub struct AgentRegistry {
    profiles: HashMap<AgentKind, AgentProfile>,
}

impl AgentRegistry {
    /// Full multi-agent deployment.
    pub fn multi_agent() -> Self {
        let profiles = [
            AgentProfile::new(
                AgentKind::Orchestrator,
                ORCHESTRATOR_PROMPT,
                &["read_file", "list_files", "search_in_code"],
            ),
            AgentProfile::new(
                AgentKind::Coder,
                CODER_PROMPT,
                &[
                    "read_file",
                    "write_file",
                    "list_files",
                    "create_directory",
                    "execute_command",
                    "search_in_code",
                    "attempt_completion",
                    "ask_followup_question",
                ],
            ),
            AgentProfile::new(
                AgentKind::Architect,
                ARCHITECT_PROMPT,
                &[
                    "read_file",
                    "write_file",
                    "list_files",
                    "search_in_code",
                    "attempt_completion",
                    "ask_followup_question",
                    "create_plan",
                ],
            )
            .with_file_restrictions(&[r".*\.md$"]),
            AgentProfile::new(
                AgentKind::Debug,
                DEBUG_PROMPT,
                &[
                    "read_file",
                    "list_files",
                    "search_in_code",
                    "execute_command",
                    "attempt_completion",
                    "ask_followup_question",
                ],
            ),
            AgentProfile::new(
                AgentKind::Ask,
                ASK_PROMPT,
                &[
                    "read_file",
                    "list_files",
                    "search_in_code",
                    "attempt_completion",
                    "ask_followup_question",
                ],
            ),
            universal_profile(),
        ];
        AgentRegistry {
            profiles: profiles.into_iter().map(|p| (p.kind, p)).collect(),
        }
    }

    /// Single-agent deployment: every message routes to the universal agent.
    pub fn single_agent() -> Self {
        let profiles = [
            AgentProfile::new(
                AgentKind::Orchestrator,
                ORCHESTRATOR_PROMPT,
                &["read_file", "list_files", "search_in_code"],
            ),
            universal_profile(),
        ];
        AgentRegistry {
            profiles: profiles.into_iter().map(|p| (p.kind, p)).collect(),
        }
    }

    pub fn get(&self, kind: AgentKind) -> Option<&AgentProfile> {
        self.profiles.get(&kind)
    }

    pub fn contains(&self, kind: AgentKind) -> bool {
        self.profiles.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// True when only the orchestrator and the universal agent exist.
    pub fn is_single_agent_mode(&self) -> bool {
        self.profiles.len() == 2 && self.profiles.contains_key(&AgentKind::Universal)
    }
}

fn universal_profile() -> AgentProfile {
    AgentProfile::new(
        AgentKind::Universal,
        UNIVERSAL_PROMPT,
        &[
            "read_file",
            "write_file",
            "list_files",
            "create_directory",
            "delete_file",
            "move_file",
            "execute_command",
            "search_in_code",
            "search_files",
            "attempt_completion",
            "ask_followup_question",
        ],
    )
}

/// Strip a markdown code fence from an LLM reply, returning the payload.
///
/// Handles ```json fences, generic ``` fences, and bare payloads.
pub(crate) fn extract_json_payload(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        if let Some(end) = rest.find("```") {
            return rest[..end].trim().to_string();
        }
    }
    if let Some(start) = trimmed.find("```") {
        let rest = &trimmed[start + 3..];
        if let Some(end) = rest.find("```") {
            return rest[..end].trim().to_string();
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_agent_mode_detection() {
        assert!(AgentRegistry::single_agent().is_single_agent_mode());
        assert!(!AgentRegistry::multi_agent().is_single_agent_mode());
        assert_eq!(AgentRegistry::multi_agent().len(), 6);
    }

    #[test]
    fn test_architect_file_restrictions() {
        let registry = AgentRegistry::multi_agent();
        let architect = registry.get(AgentKind::Architect).unwrap();
        assert!(architect.can_edit_file("docs/design.md"));
        assert!(!architect.can_edit_file("src/main.rs"));

        let coder = registry.get(AgentKind::Coder).unwrap();
        assert!(coder.can_edit_file("src/main.rs"));
    }

    #[test]
    fn test_extract_json_payload() {
        assert_eq!(extract_json_payload("{\"a\": 1}"), "{\"a\": 1}");
        assert_eq!(
            extract_json_payload("prefix\n```json\n{\"a\": 1}\n```\nsuffix"),
            "{\"a\": 1}"
        );
        assert_eq!(extract_json_payload("```\n[1, 2]\n```"), "[1, 2]");
    }
}
