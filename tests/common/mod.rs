//! Shared test support: scripted LLM, recording event handler, in-memory
//! database helpers.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use maestro::chunk::StreamChunk;
use maestro::error::{RuntimeError, RuntimeResult};
use maestro::event::{EventHandler, RuntimeEvent};
use maestro::provider::{LlmClient, LlmResponse, TokenUsage};
use maestro::repo::Database;
use maestro::session::ToolCall;

/// LLM stub that replays a queue of scripted responses in order.
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<LlmResponse>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        ScriptedLlm {
            responses: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn push_text(&self, content: &str) {
        self.responses.lock().await.push_back(text_response(content));
    }

    pub async fn push_tool_call(&self, call_id: &str, name: &str, arguments: Value) {
        self.responses
            .lock()
            .await
            .push_back(tool_call_response(vec![ToolCall {
                id: call_id.to_string(),
                name: name.to_string(),
                arguments,
            }]));
    }

    pub async fn push_response(&self, response: LlmResponse) {
        self.responses.lock().await.push_back(response);
    }

    pub async fn remaining(&self) -> usize {
        self.responses.lock().await.len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat_completion(
        &self,
        _model: &str,
        _messages: &[Value],
        _tools: &[Value],
        _temperature: Option<f32>,
        _max_tokens: Option<u32>,
    ) -> RuntimeResult<LlmResponse> {
        self.responses
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| RuntimeError::Provider("scripted responses exhausted".to_string()))
    }
}

/// LLM stub that always fails, for fallback-path tests.
pub struct UnreachableLlm;

#[async_trait]
impl LlmClient for UnreachableLlm {
    async fn chat_completion(
        &self,
        _model: &str,
        _messages: &[Value],
        _tools: &[Value],
        _temperature: Option<f32>,
        _max_tokens: Option<u32>,
    ) -> RuntimeResult<LlmResponse> {
        Err(RuntimeError::Provider("proxy unreachable".to_string()))
    }
}

pub fn text_response(content: &str) -> LlmResponse {
    LlmResponse {
        content: content.to_string(),
        tool_calls: Vec::new(),
        usage: TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        },
        model: "test-model".to_string(),
        finish_reason: Some("stop".to_string()),
    }
}

pub fn tool_call_response(tool_calls: Vec<ToolCall>) -> LlmResponse {
    LlmResponse {
        content: String::new(),
        tool_calls,
        usage: TokenUsage::default(),
        model: "test-model".to_string(),
        finish_reason: Some("tool_calls".to_string()),
    }
}

/// A classifier reply marking the task atomic for the given specialist.
pub fn atomic_classification(agent: &str) -> LlmResponse {
    text_response(&format!(
        "{{\"is_atomic\": true, \"agent\": \"{}\", \"confidence\": \"high\", \
         \"reason\": \"single step\"}}",
        agent
    ))
}

/// A classifier reply marking the task complex.
pub fn complex_classification() -> LlmResponse {
    text_response(
        "{\"is_atomic\": false, \"agent\": \"plan\", \"confidence\": \"high\", \
         \"reason\": \"multiple components\"}",
    )
}

/// Event handler that records everything it sees.
#[derive(Default)]
pub struct RecordingEvents {
    events: std::sync::Mutex<Vec<RuntimeEvent>>,
}

impl RecordingEvents {
    pub fn new() -> Self {
        RecordingEvents::default()
    }

    pub fn snapshot(&self) -> Vec<RuntimeEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count_matching(&self, predicate: impl Fn(&RuntimeEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }
}

#[async_trait]
impl EventHandler for RecordingEvents {
    async fn on_event(&self, event: &RuntimeEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub fn test_db() -> Arc<Database> {
    Arc::new(Database::open_in_memory().expect("in-memory database"))
}

/// Collect every chunk a producer wrote to the channel.
pub async fn drain_chunks(mut rx: mpsc::Receiver<StreamChunk>) -> Vec<StreamChunk> {
    let mut chunks = Vec::new();
    while let Some(chunk) = rx.recv().await {
        chunks.push(chunk);
    }
    chunks
}

/// A fresh chunk channel with room for a whole scenario.
pub fn chunk_channel() -> (mpsc::Sender<StreamChunk>, mpsc::Receiver<StreamChunk>) {
    mpsc::channel(256)
}

/// JSON planner reply decomposing into coder -> coder -> debug.
pub fn three_step_plan_response() -> LlmResponse {
    text_response(
        &json!({
            "reasoning": "implement, wire up, verify",
            "subtasks": [
                {"description": "Implement the JWT auth module", "agent": "coder",
                 "dependencies": [], "estimated_time": "10 min"},
                {"description": "Wire auth middleware into the routes", "agent": "coder",
                 "dependencies": [0], "estimated_time": "5 min"},
                {"description": "Run and verify the auth tests", "agent": "debug",
                 "dependencies": [1], "estimated_time": "5 min"},
            ]
        })
        .to_string(),
    )
}
