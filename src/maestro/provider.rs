//! LLM provider client.
//!
//! The runtime reaches its model through an internal proxy speaking the
//! OpenAI chat-completions shape, authenticated with an `X-Internal-Auth`
//! header. The [`LlmClient`] trait abstracts the transport so agents and
//! tests can substitute scripted providers.

use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::maestro::config::RuntimeConfig;
use crate::maestro::error::{RuntimeError, RuntimeResult};
use crate::maestro::session::ToolCall;

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    ///
    /// A single client keeps TLS sessions and DNS lookups warm across the
    /// many concurrent provider calls the runtime issues.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .timeout(Duration::from_secs(360))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Uniform provider response envelope.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// Assistant text; empty when the reply only carries tool calls.
    pub content: String,
    /// Tool invocations requested by the model, in reply order.
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
    /// Model identifier echoed by the provider.
    pub model: String,
    pub finish_reason: Option<String>,
}

/// Trait-driven abstraction over the chat-completion RPC.
///
/// Implementations must be thread-safe so a single client can be shared
/// between concurrent conversations.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send one chat completion request.
    ///
    /// `messages` and `tools` are already in the chat-completions wire
    /// shape; the client only adds transport concerns.
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[Value],
        tools: &[Value],
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> RuntimeResult<LlmResponse>;
}

/// Client for the internal LLM proxy.
pub struct ProxyClient {
    base_url: String,
    api_key: String,
}

impl ProxyClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let base_url = base_url.into();
        log::info!("proxy client initialized with base_url={}", base_url);
        ProxyClient {
            base_url,
            api_key: api_key.into(),
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        ProxyClient::new(&config.llm_proxy_url, &config.internal_api_key)
    }

    fn parse_response(&self, data: &Value, requested_model: &str) -> RuntimeResult<LlmResponse> {
        let message = data
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .ok_or_else(|| {
                RuntimeError::Provider("response missing choices[0].message".to_string())
            })?;

        let content = message
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let mut tool_calls = Vec::new();
        if let Some(calls) = message.get("tool_calls").and_then(|v| v.as_array()) {
            for call in calls {
                let id = call
                    .get("id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| RuntimeError::Provider("tool call missing id".to_string()))?;
                let function = call.get("function").ok_or_else(|| {
                    RuntimeError::Provider("tool call missing function".to_string())
                })?;
                let name = function
                    .get("name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| RuntimeError::Provider("tool call missing name".to_string()))?;
                // Arguments arrive either as a JSON string or an object.
                let arguments = match function.get("arguments") {
                    Some(Value::String(raw)) => serde_json::from_str(raw).unwrap_or_else(|_| {
                        log::warn!("failed to parse tool arguments as JSON: {}", raw);
                        json!({})
                    }),
                    Some(value) => value.clone(),
                    None => json!({}),
                };
                tool_calls.push(ToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    arguments,
                });
            }
        }

        let usage_data = data.get("usage").cloned().unwrap_or(Value::Null);
        let usage = TokenUsage {
            prompt_tokens: usage_data
                .get("prompt_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            completion_tokens: usage_data
                .get("completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            total_tokens: usage_data
                .get("total_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
        };

        let finish_reason = data
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("finish_reason"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let model = data
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or(requested_model)
            .to_string();

        Ok(LlmResponse {
            content,
            tool_calls,
            usage,
            model,
            finish_reason,
        })
    }
}

#[async_trait]
impl LlmClient for ProxyClient {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[Value],
        tools: &[Value],
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> RuntimeResult<LlmResponse> {
        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": false,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.to_vec());
        }
        if let Some(temperature) = temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        log::debug!(
            "calling LLM: model={}, messages={}, tools={}",
            model,
            messages.len(),
            tools.len()
        );

        let response = get_shared_http_client()
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("X-Internal-Auth", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            log::error!("LLM proxy returned {}: {}", status, text);
            return Err(RuntimeError::Provider(format!(
                "proxy returned {}: {}",
                status, text
            )));
        }

        let data: Value = response.json().await?;
        self.parse_response(&data, model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response_with_string_arguments() {
        let client = ProxyClient::new("http://localhost:8002", "key");
        let data = json!({
            "model": "gpt-4o",
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "read_file", "arguments": "{\"path\": \"a.py\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        });
        let parsed = client.parse_response(&data, "gpt-4o").unwrap();
        assert_eq!(parsed.content, "");
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].name, "read_file");
        assert_eq!(parsed.tool_calls[0].arguments["path"], "a.py");
        assert_eq!(parsed.usage.total_tokens, 15);
        assert_eq!(parsed.finish_reason.as_deref(), Some("tool_calls"));
    }

    #[test]
    fn test_parse_response_missing_usage() {
        let client = ProxyClient::new("http://localhost:8002", "key");
        let data = json!({
            "choices": [{"message": {"content": "hello"}}]
        });
        let parsed = client.parse_response(&data, "gpt-4o").unwrap();
        assert_eq!(parsed.content, "hello");
        assert_eq!(parsed.usage.total_tokens, 0);
        assert_eq!(parsed.model, "gpt-4o");
    }

    #[test]
    fn test_parse_response_rejects_malformed() {
        let client = ProxyClient::new("http://localhost:8002", "key");
        let err = client.parse_response(&json!({}), "gpt-4o").unwrap_err();
        assert!(matches!(err, RuntimeError::Provider(_)));
    }
}
