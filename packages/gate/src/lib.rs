//! ACGS-Gate: Constitutional Validation & Policy Evaluation
//!
//! Features implemented:
//! - **Constitutional Hash Guard**: constant-time fingerprint verification,
//!   fail-closed on any mismatch
//! - **Policy Evaluator**: deny-by-default evaluation contract with an
//!   OPA-backed client and an in-process rule-table backend
//! - **Authorization Cache**: role-keyed decision cache with single-flight
//!   collapse of concurrent identical lookups
//! - **Policy Version Cache**: active-version tracking with change
//!   notifications that purge dependent authorization entries

pub mod authz_cache;
pub mod constitution;
pub mod error;
pub mod opa;
pub mod policy;
pub mod version_cache;

// Re-exports
pub use authz_cache::{AuthorizationCache, AuthzCacheStats, AuthzKey, DEFAULT_AUTHZ_TTL};
pub use constitution::{Fingerprint, HashGuard, FINGERPRINT_LEN};
pub use error::GateError;
pub use opa::{OpaClient, DEFAULT_CALL_BUDGET};
pub use policy::{
    canonical_json, DecisionInput, PolicyDecision, PolicyEvaluator, PolicyRule, RuleAction,
    StaticPolicy, StaticPolicyEvaluator, REASON_HITL_REQUIRED, REASON_NO_MATCHING_RULE,
};
pub use version_cache::{PolicyVersionCache, VersionChange, DEFAULT_VERSION_TTL};
