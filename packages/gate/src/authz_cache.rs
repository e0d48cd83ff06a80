//! ACGS-Gate: Authorization Cache
//!
//! Role-keyed cache of policy decisions (TTL 15min). Keys are
//! `(role, policy_id, input-fingerprint)` where the fingerprint is the
//! stable 128-bit hash of the canonicalized input. Concurrent misses for
//! the same key collapse into a single downstream evaluation; waiters
//! receive the shared result. Invalidation: explicit per-role, policy
//! version changes, TTL expiry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, watch};

use crate::error::GateError;
use crate::policy::{DecisionInput, PolicyDecision, PolicyEvaluator};
use crate::version_cache::VersionChange;

/// Default TTL for cached decisions.
pub const DEFAULT_AUTHZ_TTL: Duration = Duration::from_secs(900);

/// Cache key: role + policy + canonical input fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuthzKey {
    pub role: String,
    pub policy_id: String,
    pub input_fingerprint: u128,
}

struct CachedDecision {
    decision: PolicyDecision,
    inserted_at: Instant,
}

/// Result shared with single-flight waiters. Errors travel as strings so
/// the payload stays `Clone`.
type FlightResult = Result<PolicyDecision, String>;

enum Flight {
    Leader(watch::Sender<Option<FlightResult>>),
    Waiter(watch::Receiver<Option<FlightResult>>),
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Default)]
pub struct AuthzCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub collapsed: u64,
    pub evictions: u64,
}

/// Cached, single-flight front for a [`PolicyEvaluator`].
pub struct AuthorizationCache {
    evaluator: Arc<dyn PolicyEvaluator>,
    entries: DashMap<AuthzKey, CachedDecision>,
    in_flight: DashMap<AuthzKey, watch::Receiver<Option<FlightResult>>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    collapsed: AtomicU64,
    evictions: AtomicU64,
}

impl AuthorizationCache {
    pub fn new(evaluator: Arc<dyn PolicyEvaluator>) -> Self {
        Self::with_ttl(evaluator, DEFAULT_AUTHZ_TTL)
    }

    pub fn with_ttl(evaluator: Arc<dyn PolicyEvaluator>, ttl: Duration) -> Self {
        Self {
            evaluator,
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            collapsed: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Evaluate through the cache.
    pub async fn evaluate(
        &self,
        role: &str,
        policy_id: &str,
        input: &DecisionInput,
    ) -> Result<PolicyDecision, GateError> {
        let key = AuthzKey {
            role: role.to_string(),
            policy_id: policy_id.to_string(),
            input_fingerprint: input.fingerprint(),
        };

        loop {
            if let Some(cached) = self.entries.get(&key) {
                if cached.inserted_at.elapsed() < self.ttl {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(cached.decision.clone());
                }
                drop(cached);
                self.entries.remove(&key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }

            // Shard guard must not be held across an await: resolve the
            // entry into either a leader token or a waiter receiver first.
            let flight = match self.in_flight.entry(key.clone()) {
                Entry::Occupied(occupied) => Flight::Waiter(occupied.get().clone()),
                Entry::Vacant(vacant) => {
                    let (tx, rx) = watch::channel(None);
                    vacant.insert(rx);
                    Flight::Leader(tx)
                }
            };

            match flight {
                Flight::Leader(tx) => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    let result = self.evaluator.evaluate(policy_id, input).await;
                    if let Ok(decision) = &result {
                        self.entries.insert(
                            key.clone(),
                            CachedDecision {
                                decision: decision.clone(),
                                inserted_at: Instant::now(),
                            },
                        );
                    }
                    let shared: FlightResult =
                        result.clone().map_err(|e| e.to_string());
                    let _ = tx.send(Some(shared));
                    self.in_flight.remove(&key);
                    return result;
                }
                Flight::Waiter(mut rx) => {
                    self.collapsed.fetch_add(1, Ordering::Relaxed);
                    loop {
                        let current = rx.borrow().clone();
                        if let Some(result) = current {
                            return result.map_err(|reason| GateError::PolicyEvaluation {
                                policy_id: key.policy_id.clone(),
                                reason,
                            });
                        }
                        if rx.changed().await.is_err() {
                            // Leader vanished without publishing; retry from
                            // the top and possibly become the new leader.
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Drop cached decisions: all of them, or only those for one role.
    pub fn invalidate(&self, role: Option<&str>) {
        match role {
            None => {
                let removed = self.entries.len() as u64;
                self.entries.clear();
                self.evictions.fetch_add(removed, Ordering::Relaxed);
            }
            Some(role) => {
                let before = self.entries.len();
                self.entries.retain(|k, _| k.role != role);
                let removed = (before - self.entries.len()) as u64;
                self.evictions.fetch_add(removed, Ordering::Relaxed);
            }
        }
    }

    /// Drop cached decisions for one policy. Called when its active
    /// version changes.
    pub fn purge_policy(&self, policy_id: &str) {
        let before = self.entries.len();
        self.entries.retain(|k, _| k.policy_id != policy_id);
        let removed = (before - self.entries.len()) as u64;
        self.evictions.fetch_add(removed, Ordering::Relaxed);
        if removed > 0 {
            tracing::debug!(policy_id, removed, "authorization cache purged");
        }
    }

    /// Spawn a listener purging entries on policy version changes.
    pub fn spawn_version_listener(
        self: &Arc<Self>,
        mut changes: broadcast::Receiver<VersionChange>,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => cache.purge_policy(&change.policy_id),
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // Missed notifications: the safe move is a full purge.
                        cache.invalidate(None);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn stats(&self) -> AuthzCacheStats {
        AuthzCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            collapsed: self.collapsed.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
