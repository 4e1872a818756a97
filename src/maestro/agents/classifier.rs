//! Task classifier: atomic vs. complex.
//!
//! The classifier asks the model for a strict-JSON verdict. A task is atomic
//! only when it is a single clear step one worker can complete without
//! exploring an existing project, making architectural decisions, or
//! touching multiple components. When the LLM path fails entirely (request
//! error or unparseable reply) the classifier degrades to keyword matching:
//! always atomic, defaulting to `code`, and logged so the degradation is
//! observable. The fallback never routes to the planner.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::maestro::agents::extract_json_payload;
use crate::maestro::error::{RuntimeError, RuntimeResult};
use crate::maestro::provider::LlmClient;

/// Specialist routes the classifier may pick.
pub const ROUTE_CODE: &str = "code";
pub const ROUTE_PLAN: &str = "plan";
pub const ROUTE_DEBUG: &str = "debug";
pub const ROUTE_EXPLAIN: &str = "explain";

const CLASSIFICATION_PROMPT: &str = r#"Classify the task strictly.

Definitions:

A task is ATOMIC only if ALL conditions are met:
- Single clear step
- Can be completed by ONE agent
- Does NOT require studying or exploring an existing project
- Does NOT involve building an application or system
- Does NOT require architectural or design decisions
- Does NOT involve multiple components or files

If ANY condition is false, the task is NON-ATOMIC.

Routing rules:
- NON-ATOMIC tasks MUST be routed to "plan" (Architect)
- ATOMIC tasks may be routed to "code", "debug", or "explain"

Respond with JSON ONLY:

{
  "is_atomic": true | false,
  "agent": "code | plan | debug | explain",
  "confidence": "high | medium | low",
  "reason": "short explanation"
}

Task: "#;

/// Outcome of a classification.
#[derive(Debug, Clone)]
pub struct Classification {
    pub is_atomic: bool,
    /// One of `code`, `plan`, `debug`, `explain`.
    pub agent: String,
    pub confidence: String,
    pub reason: String,
    /// `llm` or `fallback`.
    pub method: &'static str,
}

impl Classification {
    pub fn to_metadata(&self) -> Value {
        json!({
            "is_atomic": self.is_atomic,
            "agent": self.agent,
            "confidence": self.confidence,
            "reason": self.reason,
            "classification_method": self.method,
        })
    }
}

/// LLM-backed classifier with a conservative keyword fallback.
pub struct TaskClassifier {
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl TaskClassifier {
    pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        TaskClassifier {
            llm,
            model: model.into(),
        }
    }

    /// Classify a user message. Never fails: the keyword fallback absorbs
    /// every LLM-path error.
    pub async fn classify(&self, message: &str) -> Classification {
        match self.classify_with_llm(message).await {
            Ok(classification) => classification,
            Err(err) => {
                log::warn!(
                    "classifier falling back to keyword matching: {} (message: {:.80})",
                    err,
                    message
                );
                self.fallback_classify(message, &err.to_string())
            }
        }
    }

    async fn classify_with_llm(&self, message: &str) -> RuntimeResult<Classification> {
        let prompt = format!("{}{}", CLASSIFICATION_PROMPT, message);
        let messages = vec![json!({"role": "user", "content": prompt})];
        let response = self
            .llm
            .chat_completion(&self.model, &messages, &[], Some(0.0), None)
            .await?;

        let payload = extract_json_payload(&response.content);
        let parsed: Value = serde_json::from_str(&payload).map_err(|e| {
            RuntimeError::Provider(format!("classifier reply is not valid JSON: {}", e))
        })?;

        let is_atomic = parsed
            .get("is_atomic")
            .and_then(|v| v.as_bool())
            .ok_or_else(|| {
                RuntimeError::Provider("classifier reply missing is_atomic".to_string())
            })?;
        let agent = parsed
            .get("agent")
            .and_then(|v| v.as_str())
            .unwrap_or(ROUTE_CODE)
            .to_string();
        if ![ROUTE_CODE, ROUTE_PLAN, ROUTE_DEBUG, ROUTE_EXPLAIN].contains(&agent.as_str()) {
            return Err(RuntimeError::Provider(format!(
                "classifier picked unknown agent '{}'",
                agent
            )));
        }

        let classification = Classification {
            is_atomic,
            agent,
            confidence: parsed
                .get("confidence")
                .and_then(|v| v.as_str())
                .unwrap_or("medium")
                .to_string(),
            reason: parsed
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            method: "llm",
        };
        log::info!(
            "classified task: is_atomic={}, agent={}, confidence={}",
            classification.is_atomic,
            classification.agent,
            classification.confidence
        );
        Ok(classification)
    }

    /// Keyword fallback, used only when the LLM path fails entirely.
    ///
    /// Always atomic and never routes to the planner; design-flavored
    /// requests land on `code` rather than guessing at a plan.
    fn fallback_classify(&self, message: &str, cause: &str) -> Classification {
        let lower = message.to_lowercase();

        let agent = if ["debug", "error", "bug", "problem", "why", "investigate", "crash"]
            .iter()
            .any(|kw| lower.contains(kw))
        {
            ROUTE_DEBUG
        } else if ["explain", "what is", "how does", "help", "understand"]
            .iter()
            .any(|kw| lower.contains(kw))
        {
            ROUTE_EXPLAIN
        } else {
            ROUTE_CODE
        };

        Classification {
            is_atomic: true,
            agent: agent.to_string(),
            confidence: "low".to_string(),
            reason: format!("Fallback classification due to error: {}", cause),
            method: "fallback",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::maestro::provider::{LlmResponse, TokenUsage};

    struct FailingLlm;

    #[async_trait]
    impl LlmClient for FailingLlm {
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

    struct FixedLlm(String);

    #[async_trait]
    impl LlmClient for FixedLlm {
        async fn chat_completion(
            &self,
            _model: &str,
            _messages: &[Value],
            _tools: &[Value],
            _temperature: Option<f32>,
            _max_tokens: Option<u32>,
        ) -> RuntimeResult<LlmResponse> {
            Ok(LlmResponse {
                content: self.0.clone(),
                tool_calls: Vec::new(),
                usage: TokenUsage::default(),
                model: "test".to_string(),
                finish_reason: Some("stop".to_string()),
            })
        }
    }

    #[tokio::test]
    async fn test_llm_classification_parses_fenced_json() {
        let classifier = TaskClassifier::new(
            Arc::new(FixedLlm(
                "```json\n{\"is_atomic\": false, \"agent\": \"plan\", \
                 \"confidence\": \"high\", \"reason\": \"multi-file\"}\n```"
                    .to_string(),
            )),
            "test",
        );
        let result = classifier.classify("Add JWT auth with tests.").await;
        assert!(!result.is_atomic);
        assert_eq!(result.agent, "plan");
        assert_eq!(result.method, "llm");
    }

    #[tokio::test]
    async fn test_fallback_is_atomic_and_never_plans() {
        let classifier = TaskClassifier::new(Arc::new(FailingLlm), "test");
        let result = classifier
            .classify("Design and plan the architecture of a new system")
            .await;
        assert!(result.is_atomic);
        assert_eq!(result.method, "fallback");
        assert_ne!(result.agent, "plan");
    }

    #[tokio::test]
    async fn test_fallback_keyword_routes() {
        let classifier = TaskClassifier::new(Arc::new(FailingLlm), "test");
        assert_eq!(classifier.classify("why does this crash?").await.agent, "debug");
        assert_eq!(
            classifier.classify("explain this function").await.agent,
            "explain"
        );
        assert_eq!(classifier.classify("rename the field").await.agent, "code");
    }

    #[tokio::test]
    async fn test_garbage_reply_falls_back() {
        let classifier = TaskClassifier::new(
            Arc::new(FixedLlm("sure, I'd be happy to help!".to_string())),
            "test",
        );
        let result = classifier.classify("write a script").await;
        assert_eq!(result.method, "fallback");
        assert!(result.is_atomic);
        assert_eq!(result.agent, "code");
    }
}
