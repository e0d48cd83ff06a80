//! ACGS-Arbiter: Fault Isolation & Deliberation
//!
//! Features implemented:
//! - **Circuit Breaker**: per-dependency CLOSED/OPEN/HALF_OPEN breaker with
//!   probe-limited recovery and exponentially grown cooldowns
//! - **Recovery Orchestrator**: failure classification, prioritized retry
//!   queue, escalation to manual recovery
//! - **Deliberation Queue**: bounded, fail-closed queue gating high-impact
//!   messages on policy evaluation and optional human approval
//! - **Approval Route**: deny-safe human-in-the-loop contract with an
//!   in-memory desk for tests and single-node deployments

pub mod approval;
pub mod breaker;
pub mod deliberation;
pub mod error;
pub mod recovery;

// Re-exports
pub use approval::{
    ApprovalDecision, ApprovalRequest, ApprovalRoute, DenyAllApprovals, PendingApprovals,
};
pub use breaker::{
    BreakerConfig, BreakerRegistry, BreakerSnapshot, BreakerState, CallGuard, CircuitBreaker,
};
pub use deliberation::{DeliberationConfig, DeliberationQueue, DeliberationVerdict};
pub use error::ArbiterError;
pub use recovery::{
    FailureKind, RecoveryConfig, RecoveryHandler, RecoveryOrchestrator, RecoveryStats,
    RecoveryStrategy, RecoveryTask, RecoveryTaskState,
};
