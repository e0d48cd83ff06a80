//! ACGS-Gate: Policy Evaluation
//!
//! The evaluator contract consumed by the deliberation lane, plus an
//! in-process rule-table evaluator used for tests and degraded operation.
//! Evaluation is deny-by-default: an input that matches no rule is denied
//! with reason [`REASON_NO_MATCHING_RULE`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::GateError;

/// Reason attached to deny-by-default decisions.
pub const REASON_NO_MATCHING_RULE: &str = "NO_MATCHING_RULE";

/// Reason marking a denial that may be overturned by a human reviewer.
pub const REASON_HITL_REQUIRED: &str = "HITL_REQUIRED";

/// Outcome of evaluating one decision input against one policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    /// Was the input allowed?
    pub allowed: bool,
    /// Ordered reasons backing the decision.
    pub reasons: Vec<String>,
    /// Policy that produced the decision.
    pub policy_id: String,
    /// Version of the policy that was active at evaluation time.
    pub policy_version: String,
    /// When the decision was produced.
    pub evaluated_at: DateTime<Utc>,
}

impl PolicyDecision {
    /// An allow decision with no qualifying reasons.
    pub fn allow(policy_id: impl Into<String>, policy_version: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reasons: Vec::new(),
            policy_id: policy_id.into(),
            policy_version: policy_version.into(),
            evaluated_at: Utc::now(),
        }
    }

    /// A deny decision carrying the given reasons.
    pub fn deny(
        policy_id: impl Into<String>,
        policy_version: impl Into<String>,
        reasons: Vec<String>,
    ) -> Self {
        Self {
            allowed: false,
            reasons,
            policy_id: policy_id.into(),
            policy_version: policy_version.into(),
            evaluated_at: Utc::now(),
        }
    }

    /// Whether this denial is gated on a human decision.
    pub fn requires_human(&self) -> bool {
        !self.allowed && self.reasons.iter().any(|r| r == REASON_HITL_REQUIRED)
    }
}

/// Input to a policy decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionInput {
    /// Role of the requesting principal.
    pub role: String,
    /// Action being attempted (e.g. "delete_resource").
    pub action: String,
    /// Free-form evaluation context.
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    /// Tenant scope, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl DecisionInput {
    pub fn new(role: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            action: action.into(),
            context: BTreeMap::new(),
            tenant_id: None,
        }
    }

    /// Attach a context value.
    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Scope the input to a tenant.
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Stable 128-bit fingerprint of the canonicalized input. Used as the
    /// cache and single-flight key; identical inputs always produce the
    /// same value regardless of map insertion order.
    pub fn fingerprint(&self) -> u128 {
        let canonical = canonical_json(
            &serde_json::to_value(self).unwrap_or(Value::Null),
        );
        let digest = Sha256::digest(canonical.as_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        u128::from_be_bytes(bytes)
    }
}

/// Serialize a JSON value with all object keys sorted, recursively.
///
/// This is the canonical encoding used for input fingerprints and for
/// audit record content addresses: byte-identical for semantically
/// identical values.
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<&String, &Value> = map.iter().collect();
                out.push('{');
                let mut first = true;
                for (k, v) in sorted {
                    if !first {
                        out.push(',');
                    }
                    first = false;
                    out.push_str(&serde_json::to_string(k).unwrap_or_default());
                    out.push(':');
                    write(v, out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                let mut first = true;
                for item in items {
                    if !first {
                        out.push(',');
                    }
                    first = false;
                    write(item, out);
                }
                out.push(']');
            }
            other => {
                out.push_str(&serde_json::to_string(other).unwrap_or_default());
            }
        }
    }

    let mut out = String::new();
    write(value, &mut out);
    out
}

/// Contract for policy evaluation backends.
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    /// Evaluate `input` against the named policy.
    async fn evaluate(
        &self,
        policy_id: &str,
        input: &DecisionInput,
    ) -> Result<PolicyDecision, GateError>;

    /// The currently-active version of the named policy.
    async fn active_version(&self, policy_id: &str) -> Result<String, GateError>;

    /// Policies visible to the given tenant (None = all).
    async fn list(&self, tenant: Option<&str>) -> Result<Vec<String>, GateError>;
}

/// Action a static rule takes when it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
    /// Deny, but flag the denial as overridable by a human reviewer.
    Review,
}

/// A single rule in a static policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Rule identifier.
    pub id: String,
    /// Action name this rule matches, or "*" for any.
    pub action_match: String,
    /// Context keys that must be present for the rule NOT to fire.
    /// Empty means the rule fires on action match alone.
    #[serde(default)]
    pub required_context: Vec<String>,
    /// What to do when the rule matches.
    pub action: RuleAction,
    /// Message recorded as a decision reason.
    #[serde(default)]
    pub message: Option<String>,
}

impl PolicyRule {
    fn matches(&self, input: &DecisionInput) -> bool {
        if self.action_match != "*" && self.action_match != input.action {
            return false;
        }
        // A rule with required context fires when any of those keys is
        // missing; complete context means the rule does not apply.
        if !self.required_context.is_empty() {
            return self
                .required_context
                .iter()
                .any(|k| !input.context.contains_key(k));
        }
        true
    }
}

/// A static policy: id, version, tenant scope, ordered rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticPolicy {
    pub id: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub rules: Vec<PolicyRule>,
}

/// In-process rule-table evaluator. Deny-by-default; first matching rule
/// wins. Used in tests and as the degraded-mode backend when no policy
/// endpoint is configured.
#[derive(Default)]
pub struct StaticPolicyEvaluator {
    policies: RwLock<BTreeMap<String, StaticPolicy>>,
}

impl StaticPolicyEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a policy.
    pub fn load(&self, policy: StaticPolicy) {
        self.policies.write().insert(policy.id.clone(), policy);
    }

    /// Remove a policy.
    pub fn unload(&self, policy_id: &str) -> Option<StaticPolicy> {
        self.policies.write().remove(policy_id)
    }
}

#[async_trait]
impl PolicyEvaluator for StaticPolicyEvaluator {
    async fn evaluate(
        &self,
        policy_id: &str,
        input: &DecisionInput,
    ) -> Result<PolicyDecision, GateError> {
        let policies = self.policies.read();
        let policy = policies
            .get(policy_id)
            .ok_or_else(|| GateError::PolicyNotFound(policy_id.to_string()))?;

        for rule in &policy.rules {
            if !rule.matches(input) {
                continue;
            }
            let mut reasons = Vec::new();
            if let Some(msg) = &rule.message {
                reasons.push(msg.clone());
            }
            return Ok(match rule.action {
                RuleAction::Allow => PolicyDecision {
                    allowed: true,
                    reasons,
                    policy_id: policy.id.clone(),
                    policy_version: policy.version.clone(),
                    evaluated_at: Utc::now(),
                },
                RuleAction::Deny => {
                    PolicyDecision::deny(&policy.id, &policy.version, reasons)
                }
                RuleAction::Review => {
                    reasons.push(REASON_HITL_REQUIRED.to_string());
                    PolicyDecision::deny(&policy.id, &policy.version, reasons)
                }
            });
        }

        Ok(PolicyDecision::deny(
            &policy.id,
            &policy.version,
            vec![REASON_NO_MATCHING_RULE.to_string()],
        ))
    }

    async fn active_version(&self, policy_id: &str) -> Result<String, GateError> {
        self.policies
            .read()
            .get(policy_id)
            .map(|p| p.version.clone())
            .ok_or_else(|| GateError::PolicyNotFound(policy_id.to_string()))
    }

    async fn list(&self, tenant: Option<&str>) -> Result<Vec<String>, GateError> {
        Ok(self
            .policies
            .read()
            .values()
            .filter(|p| match (tenant, &p.tenant_id) {
                (Some(t), Some(pt)) => t == pt,
                (_, None) => true,
                (None, Some(_)) => false,
            })
            .map(|p| p.id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deletion_policy() -> StaticPolicy {
        StaticPolicy {
            id: "agentbus.command".into(),
            version: "2.0.0".into(),
            tenant_id: None,
            rules: vec![
                PolicyRule {
                    id: "deny-unticketed-delete".into(),
                    action_match: "delete_resource".into(),
                    required_context: vec!["change_ticket".into()],
                    action: RuleAction::Deny,
                    message: Some("Resource deletion requires a change ticket".into()),
                },
                PolicyRule {
                    id: "allow-rest".into(),
                    action_match: "*".into(),
                    required_context: vec![],
                    action: RuleAction::Allow,
                    message: None,
                },
            ],
        }
    }

    #[tokio::test]
    async fn deny_by_default_when_no_rule_matches() {
        let eval = StaticPolicyEvaluator::new();
        eval.load(StaticPolicy {
            id: "empty".into(),
            version: "1".into(),
            tenant_id: None,
            rules: vec![],
        });

        let decision = eval
            .evaluate("empty", &DecisionInput::new("user", "anything"))
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reasons, vec![REASON_NO_MATCHING_RULE.to_string()]);
    }

    #[tokio::test]
    async fn missing_context_key_fires_deny_rule() {
        let eval = StaticPolicyEvaluator::new();
        eval.load(deletion_policy());

        let input = DecisionInput::new("operator", "delete_resource");
        let decision = eval.evaluate("agentbus.command", &input).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(
            decision.reasons,
            vec!["Resource deletion requires a change ticket".to_string()]
        );

        let input = input.with_context("change_ticket", json!("CHG-1234"));
        let decision = eval.evaluate("agentbus.command", &input).await.unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn unknown_policy_is_not_found() {
        let eval = StaticPolicyEvaluator::new();
        let err = eval
            .evaluate("nope", &DecisionInput::new("r", "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::PolicyNotFound(_)));
    }

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let v = json!({"b": 1, "a": {"z": [1, 2], "y": null}});
        assert_eq!(canonical_json(&v), r#"{"a":{"y":null,"z":[1,2]},"b":1}"#);
    }

    #[test]
    fn fingerprint_is_order_independent() {
        let a = DecisionInput::new("admin", "deploy")
            .with_context("env", json!("prod"))
            .with_context("region", json!("eu"));
        let b = DecisionInput::new("admin", "deploy")
            .with_context("region", json!("eu"))
            .with_context("env", json!("prod"));
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = DecisionInput::new("admin", "deploy").with_context("env", json!("dev"));
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn review_rule_marks_hitl() {
        let decision = PolicyDecision::deny(
            "p",
            "1",
            vec!["needs eyes".into(), REASON_HITL_REQUIRED.into()],
        );
        assert!(decision.requires_human());
    }
}
