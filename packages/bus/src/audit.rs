//! ACGS-Bus: Audit Emitter
//!
//! Deterministic, content-addressable audit records. Canonicalization is
//! key-sorted JSON; the record hash is SHA-256 over the canonical bytes.
//! Emission never blocks the processor: records land in a bounded ring
//! drained by a batching worker that anchors batches downstream
//! (Merkle-friendly). Ring overflow drops the oldest record and emits a
//! CRITICAL security event.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

use acgs_gate::canonical_json;
use acgs_sentinel::{event_types, EventSink, SecurityEvent, SecuritySeverity};

/// Outcome recorded for an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
    Partial,
    Denied,
    Aborted,
}

/// One audit record. Ordered within a correlation chain and
/// content-addressable via [`AuditRecord::record_hash`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub record_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub actor: String,
    pub outcome: AuditOutcome,
    pub details: serde_json::Value,
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

impl AuditRecord {
    pub fn new(
        action: impl Into<String>,
        actor: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            action: action.into(),
            actor: actor.into(),
            outcome,
            details: serde_json::Value::Null,
            fingerprint: String::new(),
            correlation_id: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = fingerprint.into();
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Canonical serialization: key-sorted JSON of the full record.
    pub fn canonical(&self) -> String {
        canonical_json(&serde_json::to_value(self).unwrap_or(serde_json::Value::Null))
    }

    /// Content address: SHA-256 over the canonical bytes, hex encoded.
    pub fn record_hash(&self) -> String {
        hex::encode(Sha256::digest(self.canonical().as_bytes()))
    }
}

/// Receipt for an anchored batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReceipt {
    pub merkle_root: String,
    pub seq: u64,
}

/// Anchor failure.
#[derive(Debug, Error)]
pub enum AnchorError {
    #[error("anchor unavailable: {0}")]
    Unavailable(String),
}

/// Downstream anchor consuming canonical batches.
#[async_trait]
pub trait AuditAnchor: Send + Sync {
    async fn append(&self, batch: &[AuditRecord]) -> Result<BatchReceipt, AnchorError>;
}

/// Merkle root over record hashes: pairwise SHA-256 fold, odd node
/// promoted.
pub fn merkle_root(hashes: &[String]) -> String {
    if hashes.is_empty() {
        return hex::encode(Sha256::digest(b""));
    }
    let mut layer: Vec<String> = hashes.to_vec();
    while layer.len() > 1 {
        let mut next = Vec::with_capacity(layer.len().div_ceil(2));
        for pair in layer.chunks(2) {
            if pair.len() == 2 {
                let mut hasher = Sha256::new();
                hasher.update(pair[0].as_bytes());
                hasher.update(pair[1].as_bytes());
                next.push(hex::encode(hasher.finalize()));
            } else {
                next.push(pair[0].clone());
            }
        }
        layer = next;
    }
    layer.into_iter().next().unwrap_or_default()
}

/// In-memory anchor for tests and single-node runs.
#[derive(Default)]
pub struct MemoryAnchor {
    batches: Mutex<Vec<Vec<AuditRecord>>>,
    seq: AtomicU64,
}

impl MemoryAnchor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }
}

#[async_trait]
impl AuditAnchor for MemoryAnchor {
    async fn append(&self, batch: &[AuditRecord]) -> Result<BatchReceipt, AnchorError> {
        let hashes: Vec<String> = batch.iter().map(|r| r.record_hash()).collect();
        self.batches.lock().push(batch.to_vec());
        Ok(BatchReceipt {
            merkle_root: merkle_root(&hashes),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
        })
    }
}

/// Emitter tuning.
#[derive(Debug, Clone)]
pub struct AuditEmitterConfig {
    pub ring_capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub anchor_timeout: Duration,
}

impl Default for AuditEmitterConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 100_000,
            batch_size: 256,
            flush_interval: Duration::from_millis(500),
            anchor_timeout: Duration::from_secs(2),
        }
    }
}

/// Emitter counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditStats {
    pub emitted: u64,
    pub dropped: u64,
    pub anchored: u64,
    pub anchor_failures: u64,
}

/// Append-only, never-blocking audit emitter.
pub struct AuditEmitter {
    config: AuditEmitterConfig,
    ring: Mutex<VecDeque<AuditRecord>>,
    notify: Notify,
    anchor: Arc<dyn AuditAnchor>,
    events: Arc<dyn EventSink>,
    emitted: AtomicU64,
    dropped: AtomicU64,
    anchored: AtomicU64,
    anchor_failures: AtomicU64,
    drain_lock: tokio::sync::Mutex<()>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AuditEmitter {
    /// Create the emitter and spawn its anchor worker.
    pub fn spawn(
        config: AuditEmitterConfig,
        anchor: Arc<dyn AuditAnchor>,
        events: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        let emitter = Arc::new(Self {
            config,
            ring: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            anchor,
            events,
            emitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            anchored: AtomicU64::new(0),
            anchor_failures: AtomicU64::new(0),
            drain_lock: tokio::sync::Mutex::new(()),
            worker: Mutex::new(None),
        });

        let worker = {
            let emitter = Arc::clone(&emitter);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = emitter.notify.notified() => {}
                        _ = tokio::time::sleep(emitter.config.flush_interval) => {}
                    }
                    emitter.drain_once().await;
                }
            })
        };
        *emitter.worker.lock() = Some(worker);
        emitter
    }

    /// Append a record. O(1); never blocks. Overflow drops the oldest
    /// record and emits a CRITICAL security event.
    pub fn emit(&self, record: AuditRecord) {
        let overflowed = {
            let mut ring = self.ring.lock();
            let overflowed = ring.len() >= self.config.ring_capacity;
            if overflowed {
                ring.pop_front();
            }
            ring.push_back(record);
            overflowed
        };
        self.emitted.fetch_add(1, Ordering::Relaxed);
        if overflowed {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::error!("audit ring overflow, oldest record dropped");
            self.events.emit(SecurityEvent::new(
                event_types::AUDIT_RING_OVERFLOW,
                SecuritySeverity::Critical,
                "audit ring overflowed; oldest record dropped before anchoring",
                "audit-emitter",
            ));
        }
        self.notify.notify_one();
    }

    /// Anchor one batch. Records are only removed from the ring after a
    /// successful, in-deadline append, so a stalled anchor retains them.
    async fn drain_once(&self) -> bool {
        let _guard = self.drain_lock.lock().await;

        let batch: Vec<AuditRecord> = {
            let ring = self.ring.lock();
            ring.iter().take(self.config.batch_size).cloned().collect()
        };
        if batch.is_empty() {
            return true;
        }

        let appended = tokio::time::timeout(
            self.config.anchor_timeout,
            self.anchor.append(&batch),
        )
        .await;

        match appended {
            Ok(Ok(receipt)) => {
                let mut ring = self.ring.lock();
                for _ in 0..batch.len().min(ring.len()) {
                    ring.pop_front();
                }
                self.anchored
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                tracing::debug!(seq = receipt.seq, merkle_root = %receipt.merkle_root, "audit batch anchored");
                true
            }
            Ok(Err(err)) => {
                self.anchor_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %err, "audit anchor failed, batch retained");
                false
            }
            Err(_) => {
                self.anchor_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("audit anchor timed out, batch retained");
                false
            }
        }
    }

    /// Drain the ring completely or until the deadline. Returns whether
    /// the ring is empty.
    pub async fn flush(&self, deadline: Duration) -> bool {
        let start = tokio::time::Instant::now();
        loop {
            if self.len() == 0 {
                return true;
            }
            if start.elapsed() >= deadline {
                return false;
            }
            if !self.drain_once().await {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> AuditStats {
        AuditStats {
            emitted: self.emitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            anchored: self.anchored.load(Ordering::Relaxed),
            anchor_failures: self.anchor_failures.load(Ordering::Relaxed),
        }
    }

    /// Stop the anchor worker.
    pub async fn shutdown(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acgs_sentinel::CollectorSink;
    use serde_json::json;

    #[test]
    fn canonicalization_is_stable() {
        let record = AuditRecord::new("message.process", "agent-a", AuditOutcome::Success)
            .with_details(json!({"z": 1, "a": {"y": 2, "b": 3}}))
            .with_fingerprint("cdd01ef066bc6cf2");

        let canonical = record.canonical();
        // Key-sorted at every level.
        let a_pos = canonical.find("\"action\"").unwrap();
        let z_pos = canonical.find("\"timestamp\"").unwrap();
        assert!(a_pos < z_pos);
        assert!(canonical.find("\"b\":3").unwrap() < canonical.find("\"y\":2").unwrap());

        // Round-trip preserves canonical bytes.
        let parsed: AuditRecord = serde_json::from_str(&canonical).unwrap();
        assert_eq!(parsed.canonical(), canonical);
        assert_eq!(parsed.record_hash(), record.record_hash());
    }

    #[test]
    fn hash_changes_with_content() {
        let a = AuditRecord::new("x", "actor", AuditOutcome::Success);
        let mut b = a.clone();
        b.outcome = AuditOutcome::Denied;
        assert_ne!(a.record_hash(), b.record_hash());
    }

    #[test]
    fn merkle_root_is_deterministic() {
        let hashes: Vec<String> = (0..5).map(|i| format!("{i:064x}")).collect();
        assert_eq!(merkle_root(&hashes), merkle_root(&hashes));
        assert_ne!(merkle_root(&hashes), merkle_root(&hashes[..4]));
        // Single hash is its own root.
        assert_eq!(merkle_root(&hashes[..1]), hashes[0]);
    }

    #[tokio::test]
    async fn emit_and_flush_anchors_records() {
        let anchor = MemoryAnchor::new();
        let emitter = AuditEmitter::spawn(
            AuditEmitterConfig::default(),
            anchor.clone(),
            Arc::new(CollectorSink::new()),
        );

        for i in 0..10 {
            emitter.emit(
                AuditRecord::new("message.process", format!("agent-{i}"), AuditOutcome::Success),
            );
        }
        assert!(emitter.flush(Duration::from_secs(2)).await);
        assert_eq!(anchor.records().len(), 10);
        assert_eq!(emitter.stats().anchored, 10);
        emitter.shutdown().await;
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_emits_critical() {
        let sink = Arc::new(CollectorSink::new());
        let anchor = MemoryAnchor::new();
        let emitter = AuditEmitter::spawn(
            AuditEmitterConfig {
                ring_capacity: 3,
                // Worker effectively idle during the test.
                flush_interval: Duration::from_secs(3600),
                ..Default::default()
            },
            anchor,
            sink.clone(),
        );

        for i in 0..5 {
            emitter.emit(AuditRecord::new(format!("a{i}"), "x", AuditOutcome::Success));
        }

        assert_eq!(emitter.len(), 3);
        assert_eq!(emitter.stats().dropped, 2);
        let events = sink.of_type(event_types::AUDIT_RING_OVERFLOW);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].severity, SecuritySeverity::Critical);
        emitter.shutdown().await;
    }

    #[tokio::test]
    async fn failed_anchor_retains_batch() {
        struct DownAnchor;

        #[async_trait]
        impl AuditAnchor for DownAnchor {
            async fn append(&self, _batch: &[AuditRecord]) -> Result<BatchReceipt, AnchorError> {
                Err(AnchorError::Unavailable("no quorum".into()))
            }
        }

        let emitter = AuditEmitter::spawn(
            AuditEmitterConfig {
                flush_interval: Duration::from_secs(3600),
                ..Default::default()
            },
            Arc::new(DownAnchor),
            Arc::new(CollectorSink::new()),
        );

        emitter.emit(AuditRecord::new("a", "x", AuditOutcome::Success));
        assert!(!emitter.flush(Duration::from_millis(200)).await);
        assert_eq!(emitter.len(), 1, "record retained for retry");
        assert!(emitter.stats().anchor_failures >= 1);
        emitter.shutdown().await;
    }

    #[tokio::test]
    async fn correlation_chain_timestamps_non_decreasing() {
        let anchor = MemoryAnchor::new();
        let emitter = AuditEmitter::spawn(
            AuditEmitterConfig::default(),
            anchor.clone(),
            Arc::new(CollectorSink::new()),
        );

        let correlation = Uuid::new_v4();
        for _ in 0..5 {
            emitter.emit(
                AuditRecord::new("step", "agent-a", AuditOutcome::Success)
                    .with_correlation(correlation),
            );
        }
        emitter.flush(Duration::from_secs(2)).await;

        let chain: Vec<_> = anchor
            .records()
            .into_iter()
            .filter(|r| r.correlation_id == Some(correlation))
            .collect();
        assert_eq!(chain.len(), 5);
        for pair in chain.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
        emitter.shutdown().await;
    }
}
