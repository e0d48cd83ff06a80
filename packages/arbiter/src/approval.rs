//! ACGS-Arbiter: Human Approval Route
//!
//! The deliberation lane parks denials marked HITL_REQUIRED here. The
//! route itself is an external system; resolution failure is deny-safe.
//! An in-memory implementation backs tests and single-node deployments.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Outcome of a human approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Reject,
    Expired,
}

/// A request for human review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Request id, unique per deliberation ticket.
    pub request_id: String,
    /// What is being approved (action, message summary).
    pub context: serde_json::Value,
    /// Approval chain, when the caller knows it. Absent chains are
    /// resolved by the approval subsystem itself.
    pub chain_id: Option<String>,
    pub requested_at: DateTime<Utc>,
    /// Hard deadline; past it the decision is Expired.
    pub deadline: DateTime<Utc>,
}

impl ApprovalRequest {
    pub fn new(
        request_id: impl Into<String>,
        context: serde_json::Value,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            context,
            chain_id: None,
            requested_at: Utc::now(),
            deadline,
        }
    }

    pub fn with_chain(mut self, chain_id: impl Into<String>) -> Self {
        self.chain_id = Some(chain_id.into());
        self
    }
}

/// External approval subsystem. Implementations must be deny-safe: any
/// internal failure maps to `Reject` or `Expired`, never `Approve`.
#[async_trait]
pub trait ApprovalRoute: Send + Sync {
    async fn request_approval(&self, request: ApprovalRequest) -> ApprovalDecision;
}

/// Route that rejects everything. The safe default when no approval
/// subsystem is wired up.
#[derive(Debug, Default, Clone)]
pub struct DenyAllApprovals;

#[async_trait]
impl ApprovalRoute for DenyAllApprovals {
    async fn request_approval(&self, request: ApprovalRequest) -> ApprovalDecision {
        tracing::warn!(
            request_id = %request.request_id,
            "no approval route configured, rejecting"
        );
        ApprovalDecision::Reject
    }
}

struct PendingEntry {
    request: ApprovalRequest,
    decide: oneshot::Sender<ApprovalDecision>,
}

/// In-memory approval desk: parked requests wait for
/// [`PendingApprovals::resolve`] or expire at their deadline.
#[derive(Default)]
pub struct PendingApprovals {
    pending: DashMap<String, PendingEntry>,
}

impl PendingApprovals {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Requests currently awaiting a decision.
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        self.pending.iter().map(|e| e.request.clone()).collect()
    }

    /// Record a human decision. Returns false if the request is unknown
    /// or already decided.
    pub fn resolve(&self, request_id: &str, decision: ApprovalDecision) -> bool {
        match self.pending.remove(request_id) {
            Some((_, entry)) => entry.decide.send(decision).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl ApprovalRoute for PendingApprovals {
    async fn request_approval(&self, request: ApprovalRequest) -> ApprovalDecision {
        let (tx, rx) = oneshot::channel();
        let request_id = request.request_id.clone();
        let deadline = request.deadline;
        self.pending.insert(
            request_id.clone(),
            PendingEntry {
                request,
                decide: tx,
            },
        );

        let wait = (deadline - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(decision)) => decision,
            // Resolver dropped or deadline passed: deny-safe.
            Ok(Err(_)) => ApprovalDecision::Reject,
            Err(_) => {
                self.pending.remove(&request_id);
                ApprovalDecision::Expired
            }
        }
    }
}
