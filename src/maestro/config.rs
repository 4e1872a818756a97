//! Runtime configuration.
//!
//! The daemon is configured entirely through the environment. The struct is
//! intentionally minimal and read once at startup; no config-file parsing
//! dependencies are introduced.

use std::env;
use std::path::PathBuf;

/// Global configuration for the runtime, read from the environment.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Base URL of the LLM proxy (`LLM_PROXY_URL`).
    pub llm_proxy_url: String,
    /// Key sent as `X-Internal-Auth` to the proxy (`INTERNAL_API_KEY`).
    pub internal_api_key: String,
    /// Log filter passed to the logger (`LOG_LEVEL`).
    pub log_level: String,
    /// Multi-agent mode flag (`MULTI_AGENT_MODE`). When false the registry
    /// contains only the orchestrator and the universal agent.
    pub multi_agent_mode: bool,
    /// Socket address the HTTP server binds to (`MAESTRO_BIND`).
    pub bind_addr: String,
    /// SQLite database path (`MAESTRO_DB`).
    pub db_path: PathBuf,
    /// Model identifier forwarded to the proxy (`LLM_MODEL`).
    pub model: String,
    /// Pending approvals older than this many seconds are swept.
    pub approval_timeout_secs: u64,
    /// Per-request timeout for provider calls, in seconds.
    pub llm_timeout_secs: u64,
}

impl RuntimeConfig {
    /// Build a config from the process environment, falling back to the
    /// defaults documented on each field.
    pub fn from_env() -> Self {
        RuntimeConfig {
            llm_proxy_url: env_or("LLM_PROXY_URL", "http://localhost:8002"),
            internal_api_key: env_or("INTERNAL_API_KEY", "change-me-internal-key"),
            log_level: env_or("LOG_LEVEL", "info"),
            multi_agent_mode: env_bool("MULTI_AGENT_MODE", true),
            bind_addr: env_or("MAESTRO_BIND", "127.0.0.1:8080"),
            db_path: PathBuf::from(env_or("MAESTRO_DB", "maestro.db")),
            model: env_or("LLM_MODEL", "gpt-4o"),
            approval_timeout_secs: env_u64("MAESTRO_APPROVAL_TIMEOUT", 300),
            llm_timeout_secs: env_u64("MAESTRO_LLM_TIMEOUT", 360),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            llm_proxy_url: "http://localhost:8002".to_string(),
            internal_api_key: "change-me-internal-key".to_string(),
            log_level: "info".to_string(),
            multi_agent_mode: true,
            bind_addr: "127.0.0.1:8080".to_string(),
            db_path: PathBuf::from("maestro.db"),
            model: "gpt-4o".to_string(),
            approval_timeout_secs: 300,
            llm_timeout_secs: 360,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
