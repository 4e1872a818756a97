//! Per-conversation agent context.
//!
//! Tracks which agent currently owns a conversation and the append-only
//! history of agent switches. Switching to the agent already active is an
//! error, and the switch count is capped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::maestro::error::{RuntimeError, RuntimeResult};

/// Default cap on agent switches per conversation.
pub const DEFAULT_MAX_SWITCHES: u32 = 10;

/// The closed set of agents in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Orchestrator,
    Coder,
    Architect,
    Debug,
    Ask,
    Universal,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Orchestrator => "orchestrator",
            AgentKind::Coder => "coder",
            AgentKind::Architect => "architect",
            AgentKind::Debug => "debug",
            AgentKind::Ask => "ask",
            AgentKind::Universal => "universal",
        }
    }

    pub fn parse(value: &str) -> Option<AgentKind> {
        match value {
            "orchestrator" => Some(AgentKind::Orchestrator),
            "coder" => Some(AgentKind::Coder),
            "architect" => Some(AgentKind::Architect),
            "debug" => Some(AgentKind::Debug),
            "ask" => Some(AgentKind::Ask),
            "universal" => Some(AgentKind::Universal),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded agent switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSwitch {
    pub from: AgentKind,
    pub to: AgentKind,
    pub reason: String,
    pub confidence: String,
    pub at: DateTime<Utc>,
}

/// Which agent owns a conversation, plus the switch history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentContext {
    pub session_id: String,
    pub current_agent: AgentKind,
    pub switch_history: Vec<AgentSwitch>,
    pub switch_count: u32,
    pub max_switches: u32,
    pub updated_at: DateTime<Utc>,
}

impl AgentContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        AgentContext {
            session_id: session_id.into(),
            current_agent: AgentKind::Orchestrator,
            switch_history: Vec::new(),
            switch_count: 0,
            max_switches: DEFAULT_MAX_SWITCHES,
            updated_at: Utc::now(),
        }
    }

    /// Record a switch to `to`, appending to the history.
    ///
    /// Fails when `to` is already the current agent or the switch budget is
    /// exhausted.
    pub fn switch_to(
        &mut self,
        to: AgentKind,
        reason: impl Into<String>,
        confidence: impl Into<String>,
    ) -> RuntimeResult<()> {
        if to == self.current_agent {
            return Err(RuntimeError::AgentSwitch(format!(
                "agent '{}' is already active for session {}",
                to, self.session_id
            )));
        }
        if self.switch_count >= self.max_switches {
            return Err(RuntimeError::AgentSwitch(format!(
                "switch limit reached ({}) for session {}",
                self.max_switches, self.session_id
            )));
        }
        self.switch_history.push(AgentSwitch {
            from: self.current_agent,
            to,
            reason: reason.into(),
            confidence: confidence.into(),
            at: Utc::now(),
        });
        self.current_agent = to;
        self.switch_count += 1;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switch_to_same_agent_fails() {
        let mut ctx = AgentContext::new("s1");
        let err = ctx
            .switch_to(AgentKind::Orchestrator, "noop", "high")
            .unwrap_err();
        assert!(matches!(err, RuntimeError::AgentSwitch(_)));
    }

    #[test]
    fn test_switch_budget() {
        let mut ctx = AgentContext::new("s1");
        ctx.max_switches = 2;
        ctx.switch_to(AgentKind::Coder, "route", "high").unwrap();
        ctx.switch_to(AgentKind::Debug, "route", "high").unwrap();
        let err = ctx.switch_to(AgentKind::Ask, "route", "high").unwrap_err();
        assert!(matches!(err, RuntimeError::AgentSwitch(_)));
        assert_eq!(ctx.switch_count, 2);
        assert_eq!(ctx.switch_history.len(), 2);
        assert_eq!(ctx.current_agent, AgentKind::Debug);
    }
}
