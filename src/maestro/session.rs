//! Conversation aggregate: the per-session message log.
//!
//! A [`Conversation`] owns its ordered [`Message`] sequence and the business
//! rules around it: inactive conversations reject appends, the log never
//! exceeds `max_messages`, `last_activity` advances on every successful
//! append, and the title auto-derives from the first user message. Snapshots
//! are opaque copies of the message list used by the subtask executor to
//! isolate one subtask's context; they live only for the duration of that
//! subtask.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::maestro::error::{RuntimeError, RuntimeResult};

/// Title length cap applied when deriving the title from the first user
/// message.
const TITLE_MAX_CHARS: usize = 500;

/// Default message cap per conversation.
pub const DEFAULT_MAX_MESSAGES: usize = 1000;

/// Role of a message in the conversation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }

    pub fn parse(value: &str) -> Option<Role> {
        match value {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// A structured tool invocation request emitted by the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id, e.g. `"call_abc123"`.
    pub id: String,
    /// Tool name matching a registry entry.
    pub name: String,
    /// Parsed JSON arguments.
    pub arguments: Value,
}

impl ToolCall {
    /// Serialize in the chat-completions `tool_calls` array shape.
    pub fn to_wire(&self) -> Value {
        json!({
            "id": self.id,
            "type": "function",
            "function": {
                "name": self.name,
                "arguments": self.arguments.to_string(),
            }
        })
    }
}

/// One entry in a conversation's message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    /// Message body. Empty when the message only carries tool calls.
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Pairs a tool-role message with the assistant tool call it answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Message {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            metadata: None,
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Message::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Message::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Message::new(Role::System, content)
    }

    /// Tool-role message answering the assistant call `tool_call_id`.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut message = Message::new(Role::Tool, content);
        message.tool_call_id = Some(tool_call_id.into());
        message
    }

    /// Attach tool calls (builder pattern).
    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    /// Attach a sender name (builder pattern).
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Serialize in the chat-completions message shape.
    pub fn to_llm_format(&self) -> Value {
        let mut obj = json!({
            "role": self.role.as_str(),
            "content": self.content,
        });
        if !self.tool_calls.is_empty() {
            obj["tool_calls"] = Value::Array(self.tool_calls.iter().map(|c| c.to_wire()).collect());
        }
        if let Some(id) = &self.tool_call_id {
            obj["tool_call_id"] = json!(id);
        }
        if let Some(name) = &self.name {
            obj["name"] = json!(name);
        }
        obj
    }
}

/// The per-session dialogue between a user and the agent system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub messages: Vec<Message>,
    pub is_active: bool,
    pub max_messages: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Conversation {
            id: id.into(),
            title: None,
            description: None,
            messages: Vec::new(),
            is_active: true,
            max_messages: DEFAULT_MAX_MESSAGES,
            created_at: now,
            last_activity: now,
        }
    }

    /// Append a message, enforcing the activity and size invariants.
    ///
    /// `last_activity` is monotonic: appends never move it backwards even if
    /// the wall clock does.
    pub fn add_message(&mut self, message: Message) -> RuntimeResult<()> {
        if !self.is_active {
            return Err(RuntimeError::MessageValidation(format!(
                "cannot append to inactive conversation '{}'",
                self.id
            )));
        }
        if self.messages.len() >= self.max_messages {
            return Err(RuntimeError::MessageValidation(format!(
                "message limit exceeded ({}) for conversation '{}'",
                self.max_messages, self.id
            )));
        }

        let derive_title = self.title.is_none() && message.role == Role::User;
        if derive_title {
            let content = message.content.trim();
            if !content.is_empty() {
                self.title = Some(content.chars().take(TITLE_MAX_CHARS).collect());
            }
        }

        self.messages.push(message);

        let now = Utc::now();
        if now > self.last_activity {
            self.last_activity = now;
        }
        Ok(())
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// History in the chat-completions wire shape, optionally truncated to
    /// the most recent `max` entries.
    pub fn history_for_llm(&self, max: Option<usize>) -> Vec<Value> {
        let messages: &[Message] = match max {
            Some(n) if n < self.messages.len() => &self.messages[self.messages.len() - n..],
            _ => &self.messages,
        };
        messages.iter().map(|m| m.to_llm_format()).collect()
    }

    /// Content of the leading system message, if the log starts with one.
    pub fn base_system_prompt(&self) -> Option<&str> {
        self.messages
            .first()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
    }

    /// Most recent assistant message carrying non-empty content.
    pub fn last_assistant_message(&self) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant && !m.content.is_empty())
    }

    /// Locate the assistant message holding the given tool call id.
    pub fn find_tool_call(&self, tool_call_id: &str) -> Option<(&Message, &ToolCall)> {
        for message in self.messages.iter().rev() {
            if message.role != Role::Assistant {
                continue;
            }
            if let Some(call) = message.tool_calls.iter().find(|c| c.id == tool_call_id) {
                return Some((message, call));
            }
        }
        None
    }

    pub fn deactivate(&mut self) {
        self.is_active = false;
    }
}

/// Opaque timestamped copy of a conversation's message list.
///
/// Private to a single subtask execution; the executor deletes it on restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub id: String,
    pub conversation_id: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
}

impl ConversationSnapshot {
    pub fn capture(conversation: &Conversation) -> Self {
        ConversationSnapshot {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation.id.clone(),
            messages: conversation.messages.clone(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_derives_from_first_user_message() {
        let mut conversation = Conversation::new("s1");
        conversation
            .add_message(Message::system("prompt"))
            .unwrap();
        assert!(conversation.title.is_none());
        conversation
            .add_message(Message::user("Add JWT auth with tests."))
            .unwrap();
        assert_eq!(conversation.title.as_deref(), Some("Add JWT auth with tests."));
        // A later user message does not overwrite it.
        conversation.add_message(Message::user("second")).unwrap();
        assert_eq!(conversation.title.as_deref(), Some("Add JWT auth with tests."));
    }

    #[test]
    fn test_inactive_conversation_rejects_appends() {
        let mut conversation = Conversation::new("s1");
        conversation.deactivate();
        let err = conversation.add_message(Message::user("hi")).unwrap_err();
        assert!(matches!(err, RuntimeError::MessageValidation(_)));
    }

    #[test]
    fn test_message_cap_enforced() {
        let mut conversation = Conversation::new("s1");
        conversation.max_messages = 2;
        conversation.add_message(Message::user("one")).unwrap();
        conversation.add_message(Message::assistant("two")).unwrap();
        let err = conversation.add_message(Message::user("three")).unwrap_err();
        assert!(matches!(err, RuntimeError::MessageValidation(_)));
    }

    #[test]
    fn test_llm_format_includes_tool_fields() {
        let call = ToolCall {
            id: "call_1".into(),
            name: "read_file".into(),
            arguments: serde_json::json!({"path": "a.py"}),
        };
        let assistant = Message::assistant("").with_tool_calls(vec![call]);
        let wire = assistant.to_llm_format();
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "read_file");

        let tool = Message::tool("call_1", "contents");
        let wire = tool.to_llm_format();
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "call_1");
    }
}
