//! ACGS-Bus: Error Taxonomy
//!
//! Every pipeline failure maps onto one of six kinds (constitutional,
//! security, infrastructure, resource, validation, configuration), which
//! in turn decide the recovery strategy and the user-visible error record.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use acgs_arbiter::{ArbiterError, FailureKind};
use acgs_gate::GateError;

/// Coarse error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Constitutional,
    Security,
    Infrastructure,
    Resource,
    Validation,
    Configuration,
}

/// Structured record attached to a message's terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub reason: String,
    pub correlation_id: Option<Uuid>,
    /// Suggested wait before retrying, when the failure is retryable.
    pub retry_after_ms: Option<u64>,
}

/// Bus-level errors.
#[derive(Debug, Error, Clone)]
pub enum BusError {
    #[error("constitutional hash mismatch: expected {expected}, got {observed}")]
    ConstitutionalHashMismatch { expected: String, observed: String },

    #[error("policy denied: {}", reasons.join("; "))]
    PolicyDenied { reasons: Vec<String> },

    #[error("role violation: {0}")]
    RoleViolation(String),

    #[error("suspicious payload: {0}")]
    SuspiciousPayload(String),

    #[error("dependency {0} is open")]
    DependencyOpen(String),

    #[error("policy evaluation unavailable: {0}")]
    PolicyUnavailable(String),

    #[error("policy not found: {0}")]
    PolicyNotFound(String),

    #[error("agent not registered: {0}")]
    AgentNotRegistered(String),

    #[error("unknown target agent: {0}")]
    UnknownTarget(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("queue {queue} is full")]
    QueueFull { queue: String },

    #[error("message exceeded {budget_ms}ms budget")]
    MessageTimeout { budget_ms: u64 },

    #[error("deliberation timed out")]
    DeliberationTimeout,

    #[error("handler failed: {0}")]
    HandlerFailed(String),

    #[error("delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("bus is not started")]
    BusNotStarted,

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl BusError {
    /// Which taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConstitutionalHashMismatch { .. } => ErrorKind::Constitutional,
            Self::PolicyDenied { .. } | Self::RoleViolation(_) | Self::SuspiciousPayload(_) => {
                ErrorKind::Security
            }
            Self::DependencyOpen(_)
            | Self::PolicyUnavailable(_)
            | Self::HandlerFailed(_)
            | Self::DeliveryFailed(_) => ErrorKind::Infrastructure,
            Self::QueueFull { .. }
            | Self::MessageTimeout { .. }
            | Self::DeliberationTimeout => ErrorKind::Resource,
            Self::AgentNotRegistered(_)
            | Self::UnknownTarget(_)
            | Self::Validation(_)
            | Self::BusNotStarted => ErrorKind::Validation,
            Self::PolicyNotFound(_) | Self::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Recovery classification, when automatic or manual recovery applies.
    /// Terminal denials (policy denied, suspicious payload) return `None`:
    /// they are final, not failures to recover from.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::ConstitutionalHashMismatch { .. } => Some(FailureKind::ConstitutionalViolation),
            Self::RoleViolation(_) => Some(FailureKind::RoleViolation),
            Self::PolicyDenied { .. } | Self::SuspiciousPayload(_) => None,
            Self::DependencyOpen(_) | Self::PolicyUnavailable(_) => {
                Some(FailureKind::OpaConnectivity)
            }
            Self::HandlerFailed(_) => Some(FailureKind::HandlerExecution),
            Self::DeliveryFailed(_) => Some(FailureKind::Delivery),
            Self::QueueFull { .. } => Some(FailureKind::PolicyResourceExhausted),
            Self::MessageTimeout { .. } => Some(FailureKind::MessageTimeout),
            Self::DeliberationTimeout => Some(FailureKind::DeliberationTimeout),
            Self::AgentNotRegistered(_) => Some(FailureKind::AgentNotRegistered),
            Self::UnknownTarget(_) | Self::Validation(_) => Some(FailureKind::Validation),
            Self::BusNotStarted => Some(FailureKind::BusNotStarted),
            Self::PolicyNotFound(_) | Self::Configuration(_) => {
                Some(FailureKind::PolicyConfigMissing)
            }
        }
    }

    /// Suggested retry delay for resource-kind failures (linear schedule,
    /// first attempt).
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self.kind() {
            ErrorKind::Resource => Some(1_000),
            ErrorKind::Infrastructure => Some(2_000),
            _ => None,
        }
    }

    /// The user-visible structured record.
    pub fn to_record(&self, correlation_id: Option<Uuid>) -> ErrorRecord {
        ErrorRecord {
            kind: self.kind(),
            reason: self.to_string(),
            correlation_id,
            retry_after_ms: self.retry_after_ms(),
        }
    }
}

impl From<GateError> for BusError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::ConstitutionalHashMismatch { expected, observed } => {
                Self::ConstitutionalHashMismatch { expected, observed }
            }
            GateError::MalformedFingerprint(s) => {
                Self::Validation(format!("malformed fingerprint: {s:?}"))
            }
            GateError::OpaConnection(reason) => Self::PolicyUnavailable(reason),
            GateError::PolicyEvaluation { policy_id, reason } => {
                Self::PolicyUnavailable(format!("{policy_id}: {reason}"))
            }
            GateError::PolicyNotFound(id) => Self::PolicyNotFound(id),
            GateError::PolicyCallTimeout { policy_id, budget_ms } => {
                Self::PolicyUnavailable(format!("{policy_id} exceeded {budget_ms}ms"))
            }
        }
    }
}

impl From<ArbiterError> for BusError {
    fn from(err: ArbiterError) -> Self {
        match err {
            ArbiterError::DependencyOpen(name) => Self::DependencyOpen(name),
            ArbiterError::QueueFull { .. } => Self::QueueFull {
                queue: "deliberation".to_string(),
            },
            ArbiterError::DeliberationTimeout { .. } => Self::DeliberationTimeout,
            ArbiterError::QueueStopped => Self::BusNotStarted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_cover_the_taxonomy() {
        assert_eq!(
            BusError::ConstitutionalHashMismatch {
                expected: "a".into(),
                observed: "b".into()
            }
            .kind(),
            ErrorKind::Constitutional
        );
        assert_eq!(
            BusError::PolicyDenied { reasons: vec![] }.kind(),
            ErrorKind::Security
        );
        assert_eq!(
            BusError::DependencyOpen("opa".into()).kind(),
            ErrorKind::Infrastructure
        );
        assert_eq!(
            BusError::MessageTimeout { budget_ms: 5000 }.kind(),
            ErrorKind::Resource
        );
        assert_eq!(
            BusError::AgentNotRegistered("x".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            BusError::PolicyNotFound("p".into()).kind(),
            ErrorKind::Configuration
        );
    }

    #[test]
    fn terminal_denials_have_no_recovery() {
        assert!(BusError::PolicyDenied { reasons: vec![] }
            .failure_kind()
            .is_none());
        assert!(BusError::SuspiciousPayload("x".into())
            .failure_kind()
            .is_none());
        assert_eq!(
            BusError::MessageTimeout { budget_ms: 1 }.failure_kind(),
            Some(FailureKind::MessageTimeout)
        );
    }

    #[test]
    fn record_carries_retry_hint_for_resource_errors() {
        let record = BusError::QueueFull {
            queue: "deliberation".into(),
        }
        .to_record(None);
        assert_eq!(record.kind, ErrorKind::Resource);
        assert!(record.retry_after_ms.is_some());

        let record = BusError::PolicyDenied { reasons: vec!["no".into()] }.to_record(None);
        assert!(record.retry_after_ms.is_none());
    }

    #[test]
    fn gate_errors_map_across() {
        let err: BusError = GateError::OpaConnection("refused".into()).into();
        assert!(matches!(err, BusError::PolicyUnavailable(_)));

        let err: BusError = GateError::ConstitutionalHashMismatch {
            expected: "e".into(),
            observed: "o".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Constitutional);
    }

    #[test]
    fn arbiter_errors_map_across() {
        let err: BusError = ArbiterError::QueueFull {
            occupancy: 10,
            capacity: 10,
        }
        .into();
        assert!(matches!(err, BusError::QueueFull { .. }));
    }
}
