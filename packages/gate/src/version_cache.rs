//! ACGS-Gate: Policy Version Cache
//!
//! Caches the active version per policy (TTL 1h). Activation of a new
//! version goes through [`PolicyVersionCache::invalidate`], which drops the
//! entry and broadcasts a [`VersionChange`] consumed by the authorization
//! cache to purge affected decisions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::error::GateError;
use crate::policy::PolicyEvaluator;

/// Default TTL for cached versions.
pub const DEFAULT_VERSION_TTL: Duration = Duration::from_secs(3600);

/// Notification that a policy's active version changed.
#[derive(Debug, Clone)]
pub struct VersionChange {
    pub policy_id: String,
    /// New version, if known at invalidation time.
    pub version: Option<String>,
}

struct Entry {
    version: String,
    fetched_at: Instant,
}

/// Active-version-per-policy cache.
pub struct PolicyVersionCache {
    evaluator: Arc<dyn PolicyEvaluator>,
    entries: DashMap<String, Entry>,
    ttl: Duration,
    changes: broadcast::Sender<VersionChange>,
}

impl PolicyVersionCache {
    pub fn new(evaluator: Arc<dyn PolicyEvaluator>) -> Self {
        Self::with_ttl(evaluator, DEFAULT_VERSION_TTL)
    }

    pub fn with_ttl(evaluator: Arc<dyn PolicyEvaluator>, ttl: Duration) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            evaluator,
            entries: DashMap::new(),
            ttl,
            changes,
        }
    }

    /// Subscribe to version-changed events.
    pub fn subscribe(&self) -> broadcast::Receiver<VersionChange> {
        self.changes.subscribe()
    }

    /// The active version for a policy, from cache or the evaluator.
    pub async fn active_version(&self, policy_id: &str) -> Result<String, GateError> {
        if let Some(entry) = self.entries.get(policy_id) {
            if entry.fetched_at.elapsed() < self.ttl {
                return Ok(entry.version.clone());
            }
        }

        let version = self.evaluator.active_version(policy_id).await?;
        self.entries.insert(
            policy_id.to_string(),
            Entry {
                version: version.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(version)
    }

    /// Drop the cached version for a policy (called on activation) and
    /// notify listeners.
    pub fn invalidate(&self, policy_id: &str, new_version: Option<String>) {
        self.entries.remove(policy_id);
        let _ = self.changes.send(VersionChange {
            policy_id: policy_id.to_string(),
            version: new_version,
        });
        tracing::debug!(policy_id, "policy version invalidated");
    }

    /// Number of cached entries (including expired ones not yet refetched).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{StaticPolicy, StaticPolicyEvaluator};

    fn evaluator_with(id: &str, version: &str) -> Arc<StaticPolicyEvaluator> {
        let eval = Arc::new(StaticPolicyEvaluator::new());
        eval.load(StaticPolicy {
            id: id.into(),
            version: version.into(),
            tenant_id: None,
            rules: vec![],
        });
        eval
    }

    #[tokio::test]
    async fn caches_until_invalidated() {
        let eval = evaluator_with("p1", "1.0.0");
        let cache = PolicyVersionCache::new(eval.clone());

        assert_eq!(cache.active_version("p1").await.unwrap(), "1.0.0");

        // New version activates behind the cache's back: stale until
        // explicitly invalidated.
        eval.load(StaticPolicy {
            id: "p1".into(),
            version: "2.0.0".into(),
            tenant_id: None,
            rules: vec![],
        });
        assert_eq!(cache.active_version("p1").await.unwrap(), "1.0.0");

        cache.invalidate("p1", Some("2.0.0".into()));
        assert_eq!(cache.active_version("p1").await.unwrap(), "2.0.0");
    }

    #[tokio::test]
    async fn invalidation_broadcasts_change() {
        let cache = PolicyVersionCache::new(evaluator_with("p1", "1.0.0"));
        let mut rx = cache.subscribe();

        cache.invalidate("p1", Some("1.1.0".into()));

        let change = rx.recv().await.unwrap();
        assert_eq!(change.policy_id, "p1");
        assert_eq!(change.version.as_deref(), Some("1.1.0"));
    }

    #[tokio::test]
    async fn ttl_expiry_refetches() {
        let eval = evaluator_with("p1", "1.0.0");
        let cache = PolicyVersionCache::with_ttl(eval.clone(), Duration::from_millis(0));

        assert_eq!(cache.active_version("p1").await.unwrap(), "1.0.0");
        eval.load(StaticPolicy {
            id: "p1".into(),
            version: "3.0.0".into(),
            tenant_id: None,
            rules: vec![],
        });
        // Zero TTL: every read refetches.
        assert_eq!(cache.active_version("p1").await.unwrap(), "3.0.0");
    }
}
