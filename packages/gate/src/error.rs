//! ACGS-Gate: Error Types

use thiserror::Error;

/// Errors produced by the gate layer.
#[derive(Debug, Error, Clone)]
pub enum GateError {
    /// The observed constitutional hash does not match the expected one.
    /// Terminal, security-critical.
    #[error("constitutional hash mismatch: expected {expected}, got {observed}")]
    ConstitutionalHashMismatch { expected: String, observed: String },

    /// The observed value is not a well-formed fingerprint at all.
    #[error("malformed constitutional hash: {0:?}")]
    MalformedFingerprint(String),

    /// The policy endpoint could not be reached.
    #[error("OPA connection error: {0}")]
    OpaConnection(String),

    /// The policy endpoint was reached but evaluation failed.
    #[error("policy evaluation error for {policy_id}: {reason}")]
    PolicyEvaluation { policy_id: String, reason: String },

    /// The named policy does not exist.
    #[error("policy not found: {0}")]
    PolicyNotFound(String),

    /// The policy call exceeded its budget and was cancelled.
    #[error("policy call to {policy_id} exceeded {budget_ms}ms budget")]
    PolicyCallTimeout { policy_id: String, budget_ms: u64 },
}

impl GateError {
    /// True for errors that must never be retried automatically.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GateError::ConstitutionalHashMismatch { .. } | GateError::MalformedFingerprint(_)
        )
    }
}
