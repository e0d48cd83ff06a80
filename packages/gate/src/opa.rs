//! ACGS-Gate: OPA-backed Policy Evaluator
//!
//! Talks to an Open Policy Agent data API. Every call runs under the policy
//! call budget (default 200ms) and is cancelled on breach. Error mapping:
//! connectivity failures become [`GateError::OpaConnection`], evaluation
//! failures [`GateError::PolicyEvaluation`], unknown policies
//! [`GateError::PolicyNotFound`].

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::error::GateError;
use crate::policy::{DecisionInput, PolicyDecision, PolicyEvaluator, REASON_NO_MATCHING_RULE};

/// Default per-call budget, per the policy interface contract.
pub const DEFAULT_CALL_BUDGET: Duration = Duration::from_millis(200);

/// OPA data-API response envelope.
#[derive(Debug, Deserialize)]
struct OpaResponse {
    result: Option<OpaResult>,
}

#[derive(Debug, Deserialize)]
struct OpaResult {
    #[serde(default)]
    allow: bool,
    #[serde(default)]
    reasons: Vec<String>,
    #[serde(default)]
    version: Option<String>,
}

/// Client for an OPA policy endpoint.
pub struct OpaClient {
    endpoint: String,
    client: reqwest::Client,
    call_budget: Duration,
}

impl OpaClient {
    /// Create a client for the given endpoint (e.g. `http://localhost:8181`).
    pub fn new(endpoint: impl Into<String>) -> Result<Self, GateError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(100))
            .build()
            .map_err(|e| GateError::OpaConnection(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
            call_budget: DEFAULT_CALL_BUDGET,
        })
    }

    /// Override the per-call budget.
    pub fn with_call_budget(mut self, budget: Duration) -> Self {
        self.call_budget = budget;
        self
    }

    fn data_url(&self, policy_id: &str) -> String {
        // OPA data paths use slashes; policy ids use dots.
        format!("{}/v1/data/{}", self.endpoint, policy_id.replace('.', "/"))
    }

    /// Liveness probe against the OPA health endpoint.
    pub async fn health_check(&self) -> Result<(), GateError> {
        let url = format!("{}/health", self.endpoint);
        let resp = tokio::time::timeout(self.call_budget, self.client.get(&url).send())
            .await
            .map_err(|_| GateError::OpaConnection("health check timed out".into()))?
            .map_err(|e| GateError::OpaConnection(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(GateError::OpaConnection(format!(
                "health check returned {}",
                resp.status()
            )))
        }
    }

    async fn evaluate_inner(
        &self,
        policy_id: &str,
        input: &DecisionInput,
    ) -> Result<PolicyDecision, GateError> {
        let url = self.data_url(policy_id);
        let body = json!({ "input": input });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    GateError::OpaConnection(e.to_string())
                } else {
                    GateError::PolicyEvaluation {
                        policy_id: policy_id.to_string(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(GateError::PolicyNotFound(policy_id.to_string()));
        }
        if !status.is_success() {
            return Err(GateError::PolicyEvaluation {
                policy_id: policy_id.to_string(),
                reason: format!("unexpected status {status}"),
            });
        }

        let parsed: OpaResponse = resp.json().await.map_err(|e| GateError::PolicyEvaluation {
            policy_id: policy_id.to_string(),
            reason: format!("malformed response: {e}"),
        })?;

        // Absent result document: the policy package exists but produced no
        // decision. Deny-by-default.
        let Some(result) = parsed.result else {
            return Ok(PolicyDecision::deny(
                policy_id,
                "unknown",
                vec![REASON_NO_MATCHING_RULE.to_string()],
            ));
        };

        let version = result.version.unwrap_or_else(|| "unknown".to_string());
        Ok(if result.allow {
            let mut decision = PolicyDecision::allow(policy_id, version);
            decision.reasons = result.reasons;
            decision
        } else {
            let mut reasons = result.reasons;
            if reasons.is_empty() {
                reasons.push(REASON_NO_MATCHING_RULE.to_string());
            }
            PolicyDecision::deny(policy_id, version, reasons)
        })
    }
}

#[async_trait]
impl PolicyEvaluator for OpaClient {
    async fn evaluate(
        &self,
        policy_id: &str,
        input: &DecisionInput,
    ) -> Result<PolicyDecision, GateError> {
        tokio::time::timeout(self.call_budget, self.evaluate_inner(policy_id, input))
            .await
            .map_err(|_| GateError::PolicyCallTimeout {
                policy_id: policy_id.to_string(),
                budget_ms: self.call_budget.as_millis() as u64,
            })?
    }

    async fn active_version(&self, policy_id: &str) -> Result<String, GateError> {
        let url = format!("{}/version", self.data_url(policy_id));
        let fetch = async {
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| GateError::OpaConnection(e.to_string()))?;
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                return Err(GateError::PolicyNotFound(policy_id.to_string()));
            }
            let parsed: OpaResponse =
                resp.json().await.map_err(|e| GateError::PolicyEvaluation {
                    policy_id: policy_id.to_string(),
                    reason: format!("malformed version response: {e}"),
                })?;
            Ok(parsed
                .result
                .and_then(|r| r.version)
                .unwrap_or_else(|| "unknown".to_string()))
        };
        tokio::time::timeout(self.call_budget, fetch)
            .await
            .map_err(|_| GateError::PolicyCallTimeout {
                policy_id: policy_id.to_string(),
                budget_ms: self.call_budget.as_millis() as u64,
            })?
    }

    async fn list(&self, _tenant: Option<&str>) -> Result<Vec<String>, GateError> {
        let url = format!("{}/v1/policies", self.endpoint);
        let fetch = async {
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| GateError::OpaConnection(e.to_string()))?;
            let parsed: serde_json::Value =
                resp.json().await.map_err(|e| GateError::OpaConnection(e.to_string()))?;
            Ok(parsed
                .get("result")
                .and_then(|r| r.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|p| p.get("id").and_then(|id| id.as_str()))
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default())
        };
        tokio::time::timeout(self.call_budget, fetch)
            .await
            .map_err(|_| GateError::PolicyCallTimeout {
                policy_id: "<list>".to_string(),
                budget_ms: self.call_budget.as_millis() as u64,
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_url_maps_dotted_ids_to_paths() {
        let client = OpaClient::new("http://localhost:8181/").unwrap();
        assert_eq!(
            client.data_url("agentbus.command.deliberation"),
            "http://localhost:8181/v1/data/agentbus/command/deliberation"
        );
    }

    #[test]
    fn response_parsing_defaults() {
        let parsed: OpaResponse =
            serde_json::from_str(r#"{"result": {"allow": true}}"#).unwrap();
        let result = parsed.result.unwrap();
        assert!(result.allow);
        assert!(result.reasons.is_empty());
        assert!(result.version.is_none());

        let parsed: OpaResponse = serde_json::from_str(r#"{}"#).unwrap();
        assert!(parsed.result.is_none());
    }

    #[tokio::test]
    async fn unreachable_endpoint_maps_to_connection_error() {
        // Nothing listens on this port; connect fails fast.
        let client = OpaClient::new("http://127.0.0.1:59999")
            .unwrap()
            .with_call_budget(Duration::from_millis(500));
        let err = client
            .evaluate("p", &DecisionInput::new("r", "a"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GateError::OpaConnection(_) | GateError::PolicyCallTimeout { .. }
        ));
    }
}
