//! Stream chunk protocol.
//!
//! Every progress or result emission from the core flows to callers as a
//! [`StreamChunk`], a single tagged envelope serialized as one JSON object
//! per line of the response body. A chunk carries `is_final = true` when the
//! producer will emit no more chunks for the current call.
//!
//! # Wire shape
//!
//! ```json
//! {"type": "tool_call", "call_id": "call_1", "tool_name": "read_file",
//!  "arguments": {"path": "a.py"}, "requires_approval": false, "is_final": true}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Discriminant of a [`StreamChunk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    AssistantMessage,
    ToolCall,
    ToolResult,
    Status,
    SwitchAgent,
    Error,
    PlanCreated,
    PlanApprovalRequired,
    PlanRejected,
    PlanCompleted,
    SubtaskCompleted,
    ExecutionCompleted,
}

/// A single emission on the response stream.
///
/// All payload fields are optional on the wire; absent fields are omitted
/// from the serialized object. Use the constructors for the common shapes and
/// the `with_*` builders to attach extras.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(rename = "type")]
    pub chunk_type: ChunkType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_summary: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires_approval: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_final: bool,
}

impl StreamChunk {
    /// Create an empty chunk of the given type.
    pub fn new(chunk_type: ChunkType) -> Self {
        StreamChunk {
            chunk_type,
            content: None,
            token: None,
            tool_name: None,
            arguments: None,
            call_id: None,
            tool_call_id: None,
            approval_request_id: None,
            plan_id: None,
            plan_summary: None,
            error: None,
            requires_approval: None,
            metadata: None,
            is_final: false,
        }
    }

    /// Final assistant message for the current call.
    pub fn assistant_message(content: impl Into<String>) -> Self {
        let content = content.into();
        let mut chunk = StreamChunk::new(ChunkType::AssistantMessage);
        chunk.token = Some(content.clone());
        chunk.content = Some(content);
        chunk.is_final = true;
        chunk
    }

    /// Tool call request destined for the IDE-side executor.
    pub fn tool_call(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: Value,
        requires_approval: bool,
    ) -> Self {
        let mut chunk = StreamChunk::new(ChunkType::ToolCall);
        chunk.call_id = Some(call_id.into());
        chunk.tool_name = Some(tool_name.into());
        chunk.arguments = Some(arguments);
        chunk.requires_approval = Some(requires_approval);
        chunk.is_final = true;
        chunk
    }

    /// Non-final progress note.
    pub fn status(content: impl Into<String>) -> Self {
        let mut chunk = StreamChunk::new(ChunkType::Status);
        chunk.content = Some(content.into());
        chunk
    }

    /// Routing decision emitted by the orchestrator.
    pub fn switch_agent(content: impl Into<String>) -> Self {
        let mut chunk = StreamChunk::new(ChunkType::SwitchAgent);
        chunk.content = Some(content.into());
        chunk.is_final = true;
        chunk
    }

    /// Terminal error for the current call.
    pub fn error(message: impl Into<String>) -> Self {
        let mut chunk = StreamChunk::new(ChunkType::Error);
        chunk.error = Some(message.into());
        chunk.is_final = true;
        chunk
    }

    /// Attach a metadata object (builder pattern).
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Mark or unmark the chunk as the last one for the current call.
    pub fn finalize(mut self, is_final: bool) -> Self {
        self.is_final = is_final;
        self
    }

    /// Serialize to one newline-terminated JSON line for the transport.
    pub fn to_json_line(&self) -> String {
        let mut line =
            serde_json::to_string(self).unwrap_or_else(|_| "{\"type\":\"error\"}".to_string());
        line.push('\n');
        line
    }
}

/// Sending half of a chunk stream; the transport owns the receiving half.
pub type ChunkSender = mpsc::Sender<StreamChunk>;

/// Forward a chunk to the transport, ignoring a dropped receiver.
///
/// A client disconnect must not abort processing: state transitions already
/// made have to stay durable, so sends to a closed channel are logged and
/// discarded.
pub async fn emit(tx: &ChunkSender, chunk: StreamChunk) {
    if tx.send(chunk).await.is_err() {
        log::debug!("stream receiver dropped; chunk discarded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_call_wire_shape() {
        let chunk = StreamChunk::tool_call("call_1", "read_file", json!({"path": "a.py"}), false);
        let value: Value = serde_json::from_str(chunk.to_json_line().trim()).unwrap();
        assert_eq!(value["type"], "tool_call");
        assert_eq!(value["call_id"], "call_1");
        assert_eq!(value["tool_name"], "read_file");
        assert_eq!(value["arguments"]["path"], "a.py");
        assert_eq!(value["requires_approval"], false);
        assert_eq!(value["is_final"], true);
        // Absent fields are omitted entirely.
        assert!(value.get("content").is_none());
        assert!(value.get("plan_id").is_none());
    }

    #[test]
    fn test_non_final_omits_flag() {
        let value: Value =
            serde_json::from_str(StreamChunk::status("working").to_json_line().trim()).unwrap();
        assert!(value.get("is_final").is_none());
    }

    #[test]
    fn test_round_trip() {
        let chunk = StreamChunk::assistant_message("done").with_metadata(json!({"k": 1}));
        let parsed: StreamChunk =
            serde_json::from_str(&serde_json::to_string(&chunk).unwrap()).unwrap();
        assert_eq!(parsed.chunk_type, ChunkType::AssistantMessage);
        assert_eq!(parsed.content.as_deref(), Some("done"));
        assert!(parsed.is_final);
    }
}
