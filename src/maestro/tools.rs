//! Tool registry and per-agent filtering.
//!
//! The registry holds immutable [`ToolSpec`]s indexed by name and is
//! read-only after startup. Three execution modes exist: **local** tools run
//! in-process, **ide** tools run in the external collaborator reached over
//! the streaming channel, and **remote** tools run on some other RPC
//! surface. A small set of *virtual* tool names is never executed at all;
//! the core intercepts them to drive orchestration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::maestro::error::{RuntimeError, RuntimeResult};

/// Tool names the core intercepts instead of executing.
pub const VIRTUAL_TOOLS: &[&str] = &["attempt_completion", "ask_followup_question", "create_plan"];

/// Functional category of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    FileSystem,
    Command,
    Search,
    Agent,
    Utility,
}

/// Where a tool executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolExecutionMode {
    Local,
    Ide,
    Remote,
}

/// Permission a tool's execution requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolPermission {
    Read,
    Write,
    Execute,
}

/// Immutable description of one tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// snake_case tool name.
    pub name: String,
    pub description: String,
    /// JSON-schema object describing the accepted arguments.
    pub parameters: Value,
    pub category: ToolCategory,
    pub mode: ToolExecutionMode,
    pub permission: ToolPermission,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        category: ToolCategory,
        mode: ToolExecutionMode,
        permission: ToolPermission,
    ) -> Self {
        ToolSpec {
            name: name.into(),
            description: description.into(),
            parameters,
            category,
            mode,
            permission,
        }
    }

    /// Whether the core intercepts this tool instead of executing it.
    pub fn is_virtual(&self) -> bool {
        VIRTUAL_TOOLS.contains(&self.name.as_str())
    }

    /// Serialize in the chat-completions `tools` array entry shape.
    pub fn to_openai(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// Catalog of tool specs, immutable after construction.
pub struct ToolRegistry {
    specs: Vec<ToolSpec>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new(specs: Vec<ToolSpec>) -> Self {
        let by_name = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| (spec.name.clone(), i))
            .collect();
        ToolRegistry { specs, by_name }
    }

    /// The built-in catalog: IDE-side file and command tools, local search
    /// helpers, and the virtual orchestration tools.
    pub fn builtin() -> Self {
        let path_param = |desc: &str| {
            json!({
                "type": "object",
                "properties": {"path": {"type": "string", "description": desc}},
                "required": ["path"],
            })
        };

        ToolRegistry::new(vec![
            ToolSpec::new(
                "read_file",
                "Read the contents of a file",
                path_param("Path of the file to read"),
                ToolCategory::FileSystem,
                ToolExecutionMode::Ide,
                ToolPermission::Read,
            ),
            ToolSpec::new(
                "write_file",
                "Create or overwrite a file with the given content",
                json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string", "description": "Path of the file to write"},
                        "content": {"type": "string", "description": "Full file content"},
                    },
                    "required": ["path", "content"],
                }),
                ToolCategory::FileSystem,
                ToolExecutionMode::Ide,
                ToolPermission::Write,
            ),
            ToolSpec::new(
                "list_files",
                "List files under a directory",
                path_param("Directory to list"),
                ToolCategory::FileSystem,
                ToolExecutionMode::Ide,
                ToolPermission::Read,
            ),
            ToolSpec::new(
                "create_directory",
                "Create a directory (and parents)",
                path_param("Directory to create"),
                ToolCategory::FileSystem,
                ToolExecutionMode::Ide,
                ToolPermission::Write,
            ),
            ToolSpec::new(
                "delete_file",
                "Delete a file",
                path_param("Path of the file to delete"),
                ToolCategory::FileSystem,
                ToolExecutionMode::Local,
                ToolPermission::Write,
            ),
            ToolSpec::new(
                "move_file",
                "Move or rename a file",
                json!({
                    "type": "object",
                    "properties": {
                        "source": {"type": "string"},
                        "destination": {"type": "string"},
                    },
                    "required": ["source", "destination"],
                }),
                ToolCategory::FileSystem,
                ToolExecutionMode::Local,
                ToolPermission::Write,
            ),
            ToolSpec::new(
                "execute_command",
                "Run a shell command in the workspace",
                json!({
                    "type": "object",
                    "properties": {
                        "command": {"type": "string", "description": "Command line to run"},
                        "cwd": {"type": "string", "description": "Working directory"},
                    },
                    "required": ["command"],
                }),
                ToolCategory::Command,
                ToolExecutionMode::Ide,
                ToolPermission::Execute,
            ),
            ToolSpec::new(
                "search_in_code",
                "Search the codebase for a pattern",
                json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string", "description": "Pattern to search for"},
                        "path": {"type": "string", "description": "Restrict to a subtree"},
                    },
                    "required": ["query"],
                }),
                ToolCategory::Search,
                ToolExecutionMode::Ide,
                ToolPermission::Read,
            ),
            ToolSpec::new(
                "search_files",
                "Find files by name pattern",
                json!({
                    "type": "object",
                    "properties": {"pattern": {"type": "string"}},
                    "required": ["pattern"],
                }),
                ToolCategory::Search,
                ToolExecutionMode::Local,
                ToolPermission::Read,
            ),
            ToolSpec::new(
                "attempt_completion",
                "Signal that the current task is complete",
                json!({
                    "type": "object",
                    "properties": {"result": {"type": "string", "description": "Final result summary"}},
                    "required": ["result"],
                }),
                ToolCategory::Agent,
                ToolExecutionMode::Local,
                ToolPermission::Read,
            ),
            ToolSpec::new(
                "ask_followup_question",
                "Ask the user a clarifying question",
                json!({
                    "type": "object",
                    "properties": {"question": {"type": "string"}},
                    "required": ["question"],
                }),
                ToolCategory::Agent,
                ToolExecutionMode::Local,
                ToolPermission::Read,
            ),
            ToolSpec::new(
                "create_plan",
                "Request decomposition of the task into an execution plan",
                json!({
                    "type": "object",
                    "properties": {"goal": {"type": "string"}},
                    "required": ["goal"],
                }),
                ToolCategory::Agent,
                ToolExecutionMode::Local,
                ToolPermission::Read,
            ),
        ])
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.by_name.get(name).map(|&i| &self.specs[i])
    }

    pub fn names(&self) -> Vec<&str> {
        self.specs.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Return the allow-listed subset in the chat-completions tools shape.
    ///
    /// `None` means every tool; unknown requested names are logged and
    /// ignored.
    pub fn filter(&self, allowed: Option<&[String]>) -> Vec<Value> {
        match allowed {
            None => self.specs.iter().map(|s| s.to_openai()).collect(),
            Some(names) => {
                let unknown: Vec<&String> = names
                    .iter()
                    .filter(|n| !self.by_name.contains_key(n.as_str()))
                    .collect();
                if !unknown.is_empty() {
                    log::warn!(
                        "requested unknown tools: {:?}; available: {:?}",
                        unknown,
                        self.names()
                    );
                }
                self.specs
                    .iter()
                    .filter(|s| names.iter().any(|n| n == &s.name))
                    .map(|s| s.to_openai())
                    .collect()
            }
        }
    }

    /// Validate one tool call against its spec: the tool must exist, every
    /// `required` argument must be present, and declared argument types must
    /// match.
    pub fn validate_call(&self, name: &str, arguments: &Value) -> RuntimeResult<()> {
        let spec = self.get(name).ok_or_else(|| {
            RuntimeError::ToolValidation(format!("unknown tool '{}'", name))
        })?;

        let schema = &spec.parameters;
        if let Some(required) = schema.get("required").and_then(|v| v.as_array()) {
            for field in required.iter().filter_map(|v| v.as_str()) {
                if arguments.get(field).is_none() {
                    return Err(RuntimeError::ToolValidation(format!(
                        "tool '{}' missing required argument '{}'",
                        name, field
                    )));
                }
            }
        }

        if let Some(properties) = schema.get("properties").and_then(|v| v.as_object()) {
            for (field, prop) in properties {
                let declared = prop.get("type").and_then(|v| v.as_str());
                let value = match arguments.get(field) {
                    Some(v) => v,
                    None => continue,
                };
                if let Some(expected) = declared {
                    if !type_matches(expected, value) {
                        return Err(RuntimeError::ToolValidation(format!(
                            "tool '{}' argument '{}' expects {}, got {}",
                            name,
                            field,
                            expected,
                            json_type_name(value)
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog() {
        let registry = ToolRegistry::builtin();
        assert!(registry.get("read_file").is_some());
        assert!(registry.get("create_plan").unwrap().is_virtual());
        assert!(!registry.get("write_file").unwrap().is_virtual());
    }

    #[test]
    fn test_filter_ignores_unknown_names() {
        let registry = ToolRegistry::builtin();
        let allowed = vec!["read_file".to_string(), "no_such_tool".to_string()];
        let filtered = registry.filter(Some(&allowed));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0]["function"]["name"], "read_file");
    }

    #[test]
    fn test_filter_none_returns_all() {
        let registry = ToolRegistry::builtin();
        assert_eq!(registry.filter(None).len(), registry.len());
    }

    #[test]
    fn test_validate_call() {
        let registry = ToolRegistry::builtin();

        registry
            .validate_call("read_file", &json!({"path": "a.py"}))
            .unwrap();

        let err = registry
            .validate_call("read_file", &json!({}))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ToolValidation(_)));

        let err = registry
            .validate_call("read_file", &json!({"path": 42}))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ToolValidation(_)));

        let err = registry
            .validate_call("no_such_tool", &json!({}))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ToolValidation(_)));
    }
}
