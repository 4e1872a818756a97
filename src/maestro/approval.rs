//! Unified approval subsystem.
//!
//! One policy decides, for tools and plans alike, whether a request needs
//! a human in the loop. Matching rules are evaluated in order: the rule's
//! request type must equal the request's, the subject must match the rule's
//! regex, and every condition must hold against the request details. The
//! first match wins; otherwise the policy default applies. Pending requests
//! live in the repository until a decision arrives or the sweeper reclaims
//! them.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::maestro::error::{RuntimeError, RuntimeResult};
use crate::maestro::event::{EventHandler, RuntimeEvent};
use crate::maestro::repo::ApprovalRepo;

/// Kind of request an approval gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalRequestType {
    Tool,
    Plan,
}

impl ApprovalRequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalRequestType::Tool => "tool",
            ApprovalRequestType::Plan => "plan",
        }
    }

    pub fn parse(value: &str) -> Option<ApprovalRequestType> {
        match value {
            "tool" => Some(ApprovalRequestType::Tool),
            "plan" => Some(ApprovalRequestType::Plan),
            _ => None,
        }
    }
}

/// Decision state of an approval request. Exactly one terminal transition is
/// allowed; afterwards the record is immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<ApprovalStatus> {
        match value {
            "pending" => Some(ApprovalStatus::Pending),
            "approved" => Some(ApprovalStatus::Approved),
            "rejected" => Some(ApprovalStatus::Rejected),
            _ => None,
        }
    }
}

/// One approval policy rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub request_type: ApprovalRequestType,
    /// Regex matched against the subject, anchored at the start.
    pub subject_pattern: String,
    /// Condition map over the request details. Keys ending in `_gt`, `_lt`
    /// or `_eq` strip the suffix to name a detail field; `_gt`/`_lt` compare
    /// numerically, `_eq` compares for equality.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Map<String, Value>>,
    pub requires_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ApprovalRule {
    pub fn new(
        request_type: ApprovalRequestType,
        subject_pattern: impl Into<String>,
        requires_approval: bool,
    ) -> Self {
        ApprovalRule {
            request_type,
            subject_pattern: subject_pattern.into(),
            conditions: None,
            requires_approval,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_conditions(mut self, conditions: Map<String, Value>) -> Self {
        self.conditions = Some(conditions);
        self
    }
}

/// Ordered rule list with a global enable switch and a default decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    pub enabled: bool,
    pub rules: Vec<ApprovalRule>,
    pub default_requires_approval: bool,
}

impl ApprovalPolicy {
    /// The production default: mutating tools and all plans require
    /// approval, read-only tools do not, unknown subjects fall through to
    /// `default_requires_approval = false`.
    pub fn default_policy() -> Self {
        ApprovalPolicy {
            enabled: true,
            rules: vec![
                ApprovalRule::new(ApprovalRequestType::Tool, "write_file", true)
                    .with_reason("File modification requires approval"),
                ApprovalRule::new(ApprovalRequestType::Tool, "execute_command", true)
                    .with_reason("Command execution requires approval"),
                ApprovalRule::new(
                    ApprovalRequestType::Tool,
                    "delete_file|move_file|create_directory",
                    true,
                )
                .with_reason("File system operation requires approval"),
                ApprovalRule::new(
                    ApprovalRequestType::Tool,
                    "read_file|list_files|search_files",
                    false,
                ),
                ApprovalRule::new(ApprovalRequestType::Plan, ".*", true)
                    .with_reason("All complex plans require approval"),
            ],
            default_requires_approval: false,
        }
    }

    /// Policy that never requires approval (globally disabled).
    pub fn disabled() -> Self {
        ApprovalPolicy {
            enabled: false,
            rules: Vec::new(),
            default_requires_approval: false,
        }
    }

    /// Evaluate the policy for a request. Returns the decision and the
    /// matched rule's reason.
    pub fn decide(
        &self,
        request_type: ApprovalRequestType,
        subject: &str,
        details: &Value,
    ) -> (bool, Option<String>) {
        if !self.enabled {
            return (false, None);
        }

        for rule in &self.rules {
            if rule.request_type != request_type {
                continue;
            }
            if !subject_matches(&rule.subject_pattern, subject) {
                continue;
            }
            if let Some(conditions) = &rule.conditions {
                if !conditions_hold(conditions, details) {
                    continue;
                }
            }
            log::debug!(
                "approval rule matched: type={}, subject={}, requires_approval={}",
                request_type.as_str(),
                subject,
                rule.requires_approval
            );
            return (rule.requires_approval, rule.reason.clone());
        }

        log::debug!(
            "no approval rule matched for type={}, subject={}; default={}",
            request_type.as_str(),
            subject,
            self.default_requires_approval
        );
        (self.default_requires_approval, None)
    }
}

fn subject_matches(pattern: &str, subject: &str) -> bool {
    match Regex::new(&format!("^(?:{})", pattern)) {
        Ok(re) => re.is_match(subject),
        Err(err) => {
            log::warn!("invalid approval rule pattern '{}': {}", pattern, err);
            false
        }
    }
}

fn conditions_hold(conditions: &Map<String, Value>, details: &Value) -> bool {
    for (key, expected) in conditions {
        let (field, op) = if let Some(field) = key.strip_suffix("_gt") {
            (field, Comparison::Greater)
        } else if let Some(field) = key.strip_suffix("_lt") {
            (field, Comparison::Less)
        } else if let Some(field) = key.strip_suffix("_eq") {
            (field, Comparison::Equal)
        } else {
            continue;
        };

        let actual = match details.get(field) {
            Some(value) => value,
            None => return false,
        };

        let holds = match op {
            Comparison::Greater => match (actual.as_f64(), expected.as_f64()) {
                (Some(a), Some(e)) => a > e,
                _ => false,
            },
            Comparison::Less => match (actual.as_f64(), expected.as_f64()) {
                (Some(a), Some(e)) => a < e,
                _ => false,
            },
            Comparison::Equal => match (actual.as_f64(), expected.as_f64()) {
                (Some(a), Some(e)) => a == e,
                _ => actual == expected,
            },
        };
        if !holds {
            return false;
        }
    }
    true
}

enum Comparison {
    Greater,
    Less,
    Equal,
}

/// A persisted approval request awaiting (or carrying) a decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    pub request_id: String,
    pub request_type: ApprovalRequestType,
    pub subject: String,
    pub session_id: String,
    pub details: Value,
    pub reason: Option<String>,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub decision_at: Option<DateTime<Utc>>,
    pub decision_reason: Option<String>,
}

impl PendingApproval {
    pub fn new(
        request_id: impl Into<String>,
        request_type: ApprovalRequestType,
        subject: impl Into<String>,
        session_id: impl Into<String>,
        details: Value,
        reason: Option<String>,
    ) -> Self {
        PendingApproval {
            request_id: request_id.into(),
            request_type,
            subject: subject.into(),
            session_id: session_id.into(),
            details,
            reason,
            status: ApprovalStatus::Pending,
            created_at: Utc::now(),
            decision_at: None,
            decision_reason: None,
        }
    }
}

/// Queue-and-resolve manager over pending approvals.
///
/// Decisions publish their event synchronously before returning, so a
/// subsequent read from a different transaction observes the new state.
pub struct ApprovalManager {
    repo: Arc<dyn ApprovalRepo>,
    policy: ApprovalPolicy,
    events: Arc<dyn EventHandler>,
}

impl ApprovalManager {
    pub fn new(
        repo: Arc<dyn ApprovalRepo>,
        policy: ApprovalPolicy,
        events: Arc<dyn EventHandler>,
    ) -> Self {
        log::info!(
            "approval manager initialized (enabled={}, rules={})",
            policy.enabled,
            policy.rules.len()
        );
        ApprovalManager {
            repo,
            policy,
            events,
        }
    }

    pub fn policy(&self) -> &ApprovalPolicy {
        &self.policy
    }

    /// Evaluate the policy for a request.
    pub fn should_require_approval(
        &self,
        request_type: ApprovalRequestType,
        subject: &str,
        details: &Value,
    ) -> (bool, Option<String>) {
        self.policy.decide(request_type, subject, details)
    }

    /// Queue a pending approval and publish `ApprovalRequested`.
    pub async fn add_pending(&self, approval: PendingApproval) -> RuntimeResult<()> {
        self.repo.save_pending(&approval).await?;
        log::info!(
            "added pending approval: id={}, type={}, subject={}",
            approval.request_id,
            approval.request_type.as_str(),
            approval.subject
        );
        self.events
            .on_event(&RuntimeEvent::ApprovalRequested {
                request_id: approval.request_id.clone(),
                session_id: approval.session_id.clone(),
                request_type: approval.request_type.as_str().to_string(),
                subject: approval.subject.clone(),
            })
            .await;
        Ok(())
    }

    pub async fn get_pending(&self, request_id: &str) -> RuntimeResult<Option<PendingApproval>> {
        self.repo.get_pending(request_id).await
    }

    pub async fn get_all_pending(
        &self,
        session_id: &str,
        request_type: Option<ApprovalRequestType>,
    ) -> RuntimeResult<Vec<PendingApproval>> {
        self.repo.get_all_pending(session_id, request_type).await
    }

    pub async fn count_pending(&self, session_id: &str) -> RuntimeResult<u64> {
        self.repo.count_pending(session_id).await
    }

    /// Approve a pending request. Errors when absent or already decided; the
    /// stored status is left untouched in the latter case.
    pub async fn approve(&self, request_id: &str) -> RuntimeResult<PendingApproval> {
        self.decide(request_id, ApprovalStatus::Approved, None).await
    }

    /// Reject a pending request, optionally recording why.
    pub async fn reject(
        &self,
        request_id: &str,
        reason: Option<String>,
    ) -> RuntimeResult<PendingApproval> {
        self.decide(request_id, ApprovalStatus::Rejected, reason)
            .await
    }

    async fn decide(
        &self,
        request_id: &str,
        status: ApprovalStatus,
        reason: Option<String>,
    ) -> RuntimeResult<PendingApproval> {
        let mut approval = self
            .repo
            .get_pending(request_id)
            .await?
            .ok_or_else(|| RuntimeError::ApprovalNotFound(request_id.to_string()))?;

        if approval.status != ApprovalStatus::Pending {
            return Err(RuntimeError::ApprovalAlreadyDecided {
                request_id: request_id.to_string(),
                status: approval.status.as_str().to_string(),
            });
        }

        let decided_at = Utc::now();
        // The status update commits immediately so concurrent readers observe
        // the outcome.
        self.repo
            .update_status(request_id, status, decided_at, reason.as_deref())
            .await?;

        approval.status = status;
        approval.decision_at = Some(decided_at);
        approval.decision_reason = reason.clone();

        log::info!(
            "approval {}: {} ({})",
            status.as_str(),
            request_id,
            approval.subject
        );

        let event = match status {
            ApprovalStatus::Approved => RuntimeEvent::ApprovalApproved {
                request_id: request_id.to_string(),
                session_id: approval.session_id.clone(),
                request_type: approval.request_type.as_str().to_string(),
            },
            _ => RuntimeEvent::ApprovalRejected {
                request_id: request_id.to_string(),
                session_id: approval.session_id.clone(),
                request_type: approval.request_type.as_str().to_string(),
                reason,
            },
        };
        self.events.on_event(&event).await;

        Ok(approval)
    }

    /// Reclaim pending approvals older than `ttl`, removing them from the
    /// queue. Returns how many were swept.
    pub async fn sweep_expired(&self, ttl: Duration) -> RuntimeResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::seconds(ttl.as_secs() as i64);
        let swept = self.repo.sweep_expired(cutoff).await?;
        if swept > 0 {
            log::info!("swept {} expired pending approvals", swept);
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_policy_decisions() {
        let policy = ApprovalPolicy::default_policy();
        let details = json!({});

        let (required, reason) = policy.decide(ApprovalRequestType::Tool, "write_file", &details);
        assert!(required);
        assert!(reason.unwrap().contains("File modification"));

        let (required, _) = policy.decide(ApprovalRequestType::Tool, "read_file", &details);
        assert!(!required);

        // Unknown tools fall through to the default (false).
        let (required, _) = policy.decide(ApprovalRequestType::Tool, "frobnicate", &details);
        assert!(!required);

        // Every plan requires approval.
        let (required, _) = policy.decide(ApprovalRequestType::Plan, "Migrate auth", &details);
        assert!(required);
    }

    #[test]
    fn test_disabled_policy_never_requires() {
        let policy = ApprovalPolicy::disabled();
        let (required, _) =
            policy.decide(ApprovalRequestType::Tool, "execute_command", &json!({}));
        assert!(!required);
    }

    #[test]
    fn test_condition_suffixes() {
        let mut conditions = Map::new();
        conditions.insert("size_gt".to_string(), json!(1000));
        let rule = ApprovalRule::new(ApprovalRequestType::Tool, "write_file", true)
            .with_conditions(conditions);
        let policy = ApprovalPolicy {
            enabled: true,
            rules: vec![rule],
            default_requires_approval: false,
        };

        let (required, _) = policy.decide(
            ApprovalRequestType::Tool,
            "write_file",
            &json!({"size": 2048}),
        );
        assert!(required);

        // Condition fails: falls through to the default.
        let (required, _) = policy.decide(
            ApprovalRequestType::Tool,
            "write_file",
            &json!({"size": 10}),
        );
        assert!(!required);

        // Missing field never matches.
        let (required, _) = policy.decide(ApprovalRequestType::Tool, "write_file", &json!({}));
        assert!(!required);
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let policy = ApprovalPolicy {
            enabled: true,
            rules: vec![
                ApprovalRule::new(ApprovalRequestType::Tool, "write_.*", false),
                ApprovalRule::new(ApprovalRequestType::Tool, "write_file", true),
            ],
            default_requires_approval: true,
        };
        let (required, _) = policy.decide(ApprovalRequestType::Tool, "write_file", &json!({}));
        assert!(!required);
    }
}
