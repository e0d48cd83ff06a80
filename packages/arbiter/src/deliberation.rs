//! ACGS-Arbiter: Deliberation Queue
//!
//! High-impact messages queue here for policy evaluation and, when the
//! policy demands it, a human decision. The queue is bounded and fails
//! closed above 90% occupancy. Submissions are single-flight on
//! `(policy_id, input-hash)`: concurrent duplicates share one evaluation
//! and every caller observes the same verdict.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

use acgs_gate::{AuthorizationCache, DecisionInput, PolicyDecision};
use acgs_sentinel::{event_types, EventSink, SecurityEvent, SecuritySeverity};

use crate::approval::{ApprovalDecision, ApprovalRequest, ApprovalRoute};
use crate::error::ArbiterError;

/// Queue tuning.
#[derive(Debug, Clone)]
pub struct DeliberationConfig {
    /// Queue capacity; submissions above 90% occupancy are rejected.
    pub capacity: usize,
    /// Worker pool size.
    pub workers: usize,
    /// Budget for a parked human decision.
    pub hitl_timeout: Duration,
}

impl Default for DeliberationConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            workers: 4,
            hitl_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of a deliberation, shared by every duplicate submitter.
#[derive(Debug, Clone)]
pub enum DeliberationVerdict {
    /// Policy (or a human) allowed the input.
    Allowed(PolicyDecision),
    /// Policy (or a human) denied the input.
    Denied(PolicyDecision),
    /// The parked human decision exceeded its deadline.
    TimedOut,
    /// Evaluation itself failed; the caller's failure policy applies.
    Failed(String),
}

type FlightKey = (String, u128);

struct Job {
    role: String,
    policy_id: String,
    input: DecisionInput,
    key: FlightKey,
}

struct Shared {
    config: DeliberationConfig,
    occupancy: AtomicUsize,
    in_flight: DashMap<FlightKey, watch::Receiver<Option<DeliberationVerdict>>>,
    publishers: DashMap<FlightKey, watch::Sender<Option<DeliberationVerdict>>>,
    authz: Arc<AuthorizationCache>,
    approvals: Arc<dyn ApprovalRoute>,
    events: Arc<dyn EventSink>,
}

/// Bounded deliberation queue with a worker pool.
pub struct DeliberationQueue {
    shared: Arc<Shared>,
    tx: mpsc::Sender<Job>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl DeliberationQueue {
    pub fn new(
        config: DeliberationConfig,
        authz: Arc<AuthorizationCache>,
        approvals: Arc<dyn ApprovalRoute>,
        events: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let shared = Arc::new(Shared {
            config,
            occupancy: AtomicUsize::new(0),
            in_flight: DashMap::new(),
            publishers: DashMap::new(),
            authz,
            approvals,
            events,
        });

        let queue = Arc::new(Self {
            shared: Arc::clone(&shared),
            tx,
            workers: Mutex::new(Vec::new()),
        });

        queue.spawn_workers(rx);
        queue
    }

    fn spawn_workers(self: &Arc<Self>, rx: mpsc::Receiver<Job>) {
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::new();
        for worker_id in 0..self.shared.config.workers.max(1) {
            let rx = Arc::clone(&rx);
            let shared = Arc::clone(&self.shared);
            workers.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    match job {
                        Some(job) => Self::run_job(&shared, job).await,
                        None => break,
                    }
                }
                tracing::debug!(worker_id, "deliberation worker stopped");
            }));
        }
        // Constructor context: no contention on the worker list yet.
        if let Ok(mut slot) = self.workers.try_lock() {
            *slot = workers;
        }
    }

    /// Current queue occupancy.
    pub fn occupancy(&self) -> usize {
        self.shared.occupancy.load(Ordering::Relaxed)
    }

    /// Submit an input for deliberation and await the verdict.
    ///
    /// Duplicate concurrent submissions (same policy, same canonical
    /// input) collapse onto the in-flight evaluation.
    pub async fn submit(
        &self,
        role: &str,
        policy_id: &str,
        input: DecisionInput,
    ) -> Result<DeliberationVerdict, ArbiterError> {
        let key: FlightKey = (policy_id.to_string(), input.fingerprint());

        // Join an in-flight evaluation if one exists.
        if let Some(rx) = self.shared.in_flight.get(&key).map(|r| r.clone()) {
            return Self::await_verdict(rx).await;
        }

        // Backpressure check applies to new work only.
        let occupancy = self.shared.occupancy.load(Ordering::Relaxed);
        let capacity = self.shared.config.capacity;
        if occupancy * 10 > capacity * 9 {
            return Err(ArbiterError::QueueFull {
                occupancy,
                capacity,
            });
        }

        let rx = match self.shared.in_flight.entry(key.clone()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(None);
                vacant.insert(rx.clone());
                self.shared.publishers.insert(key.clone(), tx);
                self.shared.occupancy.fetch_add(1, Ordering::Relaxed);

                let job = Job {
                    role: role.to_string(),
                    policy_id: policy_id.to_string(),
                    input,
                    key: key.clone(),
                };
                if self.tx.send(job).await.is_err() {
                    self.shared.occupancy.fetch_sub(1, Ordering::Relaxed);
                    self.shared.in_flight.remove(&key);
                    self.shared.publishers.remove(&key);
                    return Err(ArbiterError::QueueStopped);
                }
                rx
            }
        };

        Self::await_verdict(rx).await
    }

    async fn await_verdict(
        mut rx: watch::Receiver<Option<DeliberationVerdict>>,
    ) -> Result<DeliberationVerdict, ArbiterError> {
        loop {
            let current = rx.borrow().clone();
            if let Some(verdict) = current {
                return Ok(verdict);
            }
            if rx.changed().await.is_err() {
                return Err(ArbiterError::QueueStopped);
            }
        }
    }

    async fn run_job(shared: &Arc<Shared>, job: Job) {
        let verdict = Self::deliberate(shared, &job).await;

        shared.occupancy.fetch_sub(1, Ordering::Relaxed);
        shared.in_flight.remove(&job.key);
        if let Some((_, tx)) = shared.publishers.remove(&job.key) {
            let _ = tx.send(Some(verdict));
        }
    }

    async fn deliberate(shared: &Arc<Shared>, job: &Job) -> DeliberationVerdict {
        let decision = match shared
            .authz
            .evaluate(&job.role, &job.policy_id, &job.input)
            .await
        {
            Ok(decision) => decision,
            Err(err) => {
                tracing::warn!(policy_id = %job.policy_id, error = %err, "deliberation evaluation failed");
                return DeliberationVerdict::Failed(err.to_string());
            }
        };

        if decision.allowed {
            return DeliberationVerdict::Allowed(decision);
        }
        if !decision.requires_human() {
            return DeliberationVerdict::Denied(decision);
        }

        // Parked: the policy wants human eyes on this denial.
        let deadline = chrono::Utc::now()
            + chrono::Duration::from_std(shared.config.hitl_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let request = ApprovalRequest::new(
            Uuid::new_v4().to_string(),
            serde_json::json!({
                "policy_id": job.policy_id,
                "role": job.role,
                "action": job.input.action,
                "reasons": decision.reasons.clone(),
            }),
            deadline,
        );

        let approval = tokio::time::timeout(
            shared.config.hitl_timeout,
            shared.approvals.request_approval(request),
        )
        .await;

        match approval {
            Ok(ApprovalDecision::Approve) => {
                let mut approved = decision;
                approved.allowed = true;
                approved.reasons.push("approved by human reviewer".to_string());
                DeliberationVerdict::Allowed(approved)
            }
            Ok(ApprovalDecision::Reject) => DeliberationVerdict::Denied(decision),
            Ok(ApprovalDecision::Expired) | Err(_) => {
                shared.events.emit(
                    SecurityEvent::new(
                        event_types::DELIBERATION_TIMEOUT,
                        SecuritySeverity::Warning,
                        format!("human decision for {} timed out", job.policy_id),
                        "deliberation-queue",
                    ),
                );
                DeliberationVerdict::TimedOut
            }
        }
    }

    /// Stop the worker pool and fail any unpublished flights so waiters
    /// observe a terminal verdict instead of hanging.
    pub async fn shutdown(&self) {
        let workers = {
            let mut slot = self.workers.lock().await;
            std::mem::take(&mut *slot)
        };
        for worker in workers {
            worker.abort();
            let _ = worker.await;
        }

        let keys: Vec<FlightKey> = self
            .shared
            .publishers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            if let Some((_, tx)) = self.shared.publishers.remove(&key) {
                let _ = tx.send(Some(DeliberationVerdict::Failed(
                    "deliberation queue stopped".to_string(),
                )));
            }
            self.shared.in_flight.remove(&key);
        }
        self.shared.occupancy.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::{DenyAllApprovals, PendingApprovals};
    use acgs_gate::{PolicyRule, RuleAction, StaticPolicy, StaticPolicyEvaluator};
    use acgs_sentinel::CollectorSink;

    fn evaluator() -> Arc<StaticPolicyEvaluator> {
        let eval = Arc::new(StaticPolicyEvaluator::new());
        eval.load(StaticPolicy {
            id: "bus.command".into(),
            version: "1.0.0".into(),
            tenant_id: None,
            rules: vec![
                PolicyRule {
                    id: "deny-delete".into(),
                    action_match: "delete_resource".into(),
                    required_context: vec!["change_ticket".into()],
                    action: RuleAction::Deny,
                    message: Some("Resource deletion requires a change ticket".into()),
                },
                PolicyRule {
                    id: "review-shutdown".into(),
                    action_match: "shutdown".into(),
                    required_context: vec![],
                    action: RuleAction::Review,
                    message: Some("Shutdown needs a human".into()),
                },
                PolicyRule {
                    id: "allow-rest".into(),
                    action_match: "*".into(),
                    required_context: vec![],
                    action: RuleAction::Allow,
                    message: None,
                },
            ],
        });
        eval
    }

    fn queue_with(
        config: DeliberationConfig,
        approvals: Arc<dyn ApprovalRoute>,
    ) -> (
        Arc<DeliberationQueue>,
        Arc<CollectorSink>,
        Arc<AuthorizationCache>,
    ) {
        let sink = Arc::new(CollectorSink::new());
        let authz = Arc::new(AuthorizationCache::new(evaluator()));
        let queue = DeliberationQueue::new(config, authz.clone(), approvals, sink.clone());
        (queue, sink, authz)
    }

    #[tokio::test]
    async fn allow_flows_through() {
        let (queue, _sink, _authz) = queue_with(
            DeliberationConfig::default(),
            Arc::new(DenyAllApprovals),
        );
        let verdict = queue
            .submit("agent", "bus.command", DecisionInput::new("agent", "status"))
            .await
            .unwrap();
        assert!(matches!(verdict, DeliberationVerdict::Allowed(_)));
    }

    #[tokio::test]
    async fn deny_without_hitl_marker_is_final() {
        let (queue, _sink, _authz) = queue_with(
            DeliberationConfig::default(),
            Arc::new(DenyAllApprovals),
        );
        let verdict = queue
            .submit(
                "agent",
                "bus.command",
                DecisionInput::new("agent", "delete_resource"),
            )
            .await
            .unwrap();
        match verdict {
            DeliberationVerdict::Denied(decision) => {
                assert_eq!(
                    decision.reasons,
                    vec!["Resource deletion requires a change ticket".to_string()]
                );
            }
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hitl_approval_overturns_denial() {
        let desk = PendingApprovals::new();
        let (queue, _sink, _authz) = queue_with(
            DeliberationConfig {
                hitl_timeout: Duration::from_secs(5),
                ..Default::default()
            },
            desk.clone(),
        );

        let submit = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue
                    .submit("operator", "bus.command", DecisionInput::new("operator", "shutdown"))
                    .await
            })
        };

        // Wait for the request to park, then approve it.
        let mut parked = Vec::new();
        for _ in 0..50 {
            parked = desk.pending();
            if !parked.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(parked.len(), 1, "request should be parked for approval");
        desk.resolve(&parked[0].request_id, ApprovalDecision::Approve);

        let verdict = submit.await.unwrap().unwrap();
        match verdict {
            DeliberationVerdict::Allowed(decision) => {
                assert!(decision
                    .reasons
                    .iter()
                    .any(|r| r.contains("approved by human")));
            }
            other => panic!("expected approval, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hitl_timeout_produces_timed_out_verdict() {
        let desk = PendingApprovals::new();
        let (queue, sink, _authz) = queue_with(
            DeliberationConfig {
                hitl_timeout: Duration::from_millis(50),
                ..Default::default()
            },
            desk,
        );

        let verdict = queue
            .submit("operator", "bus.command", DecisionInput::new("operator", "shutdown"))
            .await
            .unwrap();
        assert!(matches!(verdict, DeliberationVerdict::TimedOut));
        assert_eq!(sink.of_type(event_types::DELIBERATION_TIMEOUT).len(), 1);
    }

    #[tokio::test]
    async fn duplicate_submissions_share_one_evaluation() {
        let (queue, _sink, authz) = queue_with(
            DeliberationConfig::default(),
            Arc::new(DenyAllApprovals),
        );

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let queue = Arc::clone(&queue);
            tasks.push(tokio::spawn(async move {
                queue
                    .submit("agent", "bus.command", DecisionInput::new("agent", "status"))
                    .await
            }));
        }
        for task in tasks {
            assert!(matches!(
                task.await.unwrap().unwrap(),
                DeliberationVerdict::Allowed(_)
            ));
        }
        // One downstream evaluation total: either every submit joined the
        // in-flight job, or late submits hit the decision cache.
        assert_eq!(authz.stats().misses, 1);
    }

    #[tokio::test]
    async fn saturated_queue_fails_closed() {
        // Capacity 10 with a permanently-parked policy: fill to the 90%
        // watermark, then expect rejection.
        let desk = PendingApprovals::new();
        let (queue, _sink, _authz) = queue_with(
            DeliberationConfig {
                capacity: 10,
                workers: 1,
                hitl_timeout: Duration::from_secs(60),
            },
            desk,
        );

        // Ten distinct parked inputs (unique actions defeat single-flight).
        let mut submits = Vec::new();
        for i in 0..10 {
            let queue = Arc::clone(&queue);
            submits.push(tokio::spawn(async move {
                queue
                    .submit(
                        "operator",
                        "bus.command",
                        DecisionInput::new("operator", "shutdown")
                            .with_context("instance", serde_json::json!(i)),
                    )
                    .await
            }));
        }

        // Let occupancy build.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let result = queue
            .submit(
                "operator",
                "bus.command",
                DecisionInput::new("operator", "shutdown")
                    .with_context("instance", serde_json::json!(99)),
            )
            .await;
        assert!(matches!(result, Err(ArbiterError::QueueFull { .. })));

        queue.shutdown().await;
        for submit in submits {
            let _ = submit.await;
        }
    }

    #[tokio::test]
    async fn unknown_policy_yields_failed_verdict() {
        let (queue, _sink, _authz) = queue_with(
            DeliberationConfig::default(),
            Arc::new(DenyAllApprovals),
        );
        let verdict = queue
            .submit("agent", "missing.policy", DecisionInput::new("agent", "x"))
            .await
            .unwrap();
        assert!(matches!(verdict, DeliberationVerdict::Failed(_)));
    }
}
