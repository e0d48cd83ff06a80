//! ACGS-Arbiter: Recovery Orchestrator
//!
//! Classifies failures into recovery strategies and drives a prioritized
//! retry queue. Security and configuration failures never retry
//! automatically (MANUAL); infrastructure failures back off exponentially;
//! resource failures back off linearly; validation-class failures retry
//! immediately. A task that exhausts its attempts escalates to MANUAL and
//! emits a CRITICAL security event.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use acgs_sentinel::{event_types, EventSink, SecurityEvent, SecuritySeverity};

/// What went wrong, in recovery terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    // Security / constitutional: humans only.
    ConstitutionalViolation,
    SecurityViolation,
    RoleViolation,
    PolicyConfigMissing,
    ReviewDeadlock,
    // Infrastructure: exponential backoff.
    Delivery,
    Routing,
    OpaConnectivity,
    HandlerExecution,
    SignatureCollection,
    // Resource: linear backoff.
    MessageTimeout,
    DeliberationTimeout,
    PolicyResourceExhausted,
    // Validation / lifecycle: immediate.
    Validation,
    AgentNotRegistered,
    BusNotStarted,
    OpaNotInitialized,
}

impl FailureKind {
    /// Strategy table.
    pub fn strategy(&self) -> RecoveryStrategy {
        use FailureKind::*;
        match self {
            ConstitutionalViolation | SecurityViolation | RoleViolation
            | PolicyConfigMissing | ReviewDeadlock => RecoveryStrategy::Manual,
            Delivery | Routing | OpaConnectivity | HandlerExecution | SignatureCollection => {
                RecoveryStrategy::ExponentialBackoff
            }
            MessageTimeout | DeliberationTimeout | PolicyResourceExhausted => {
                RecoveryStrategy::LinearBackoff
            }
            Validation | AgentNotRegistered | BusNotStarted | OpaNotInitialized => {
                RecoveryStrategy::Immediate
            }
        }
    }

    /// Severity used for queue ordering and escalation events.
    pub fn severity(&self) -> SecuritySeverity {
        use FailureKind::*;
        match self {
            ConstitutionalViolation | SecurityViolation => SecuritySeverity::Critical,
            RoleViolation | ReviewDeadlock => SecuritySeverity::High,
            PolicyConfigMissing | OpaConnectivity | DeliberationTimeout => {
                SecuritySeverity::Warning
            }
            _ => SecuritySeverity::Info,
        }
    }
}

/// How a failure is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryStrategy {
    ExponentialBackoff,
    LinearBackoff,
    Immediate,
    Manual,
}

impl RecoveryStrategy {
    /// Delay before attempt `attempt` (1-based). `None` means no
    /// automatic retry.
    pub fn delay(&self, attempt: u32, base: Duration, max: Duration) -> Option<Duration> {
        match self {
            Self::Manual => None,
            Self::Immediate => Some(Duration::ZERO),
            Self::LinearBackoff => Some(base.saturating_mul(attempt).min(max)),
            Self::ExponentialBackoff => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
                Some(base.saturating_mul(factor).min(max))
            }
        }
    }
}

/// Lifecycle of a recovery task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryTaskState {
    Pending,
    InFlight,
    Completed,
    Failed,
    Escalated,
}

/// A unit of retryable work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryTask {
    pub id: Uuid,
    pub failure_kind: FailureKind,
    pub strategy: RecoveryStrategy,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub state: RecoveryTaskState,
    /// Opaque payload the retry handler interprets (typically the message).
    pub payload: serde_json::Value,
}

struct QueuedTask(RecoveryTask);

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}
impl Eq for QueuedTask {}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap: earliest next_attempt_at first, then
        // higher severity.
        other
            .0
            .next_attempt_at
            .cmp(&self.0.next_attempt_at)
            .then_with(|| {
                self.0
                    .failure_kind
                    .severity()
                    .cmp(&other.0.failure_kind.severity())
            })
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Handler the orchestrator drives; returns whether the retry succeeded.
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    async fn retry(&self, task: &RecoveryTask) -> bool;
}

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Add up to 10% random jitter to computed delays.
    pub jitter: bool,
    /// How often the drive loop wakes to look for due tasks.
    pub poll_interval: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
            jitter: true,
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// Orchestrator counters.
#[derive(Debug, Clone, Default)]
pub struct RecoveryStats {
    pub submitted: u64,
    pub retried: u64,
    pub completed: u64,
    pub escalated: u64,
}

/// Prioritized retry queue with strategy selection.
pub struct RecoveryOrchestrator {
    config: RecoveryConfig,
    queue: Mutex<BinaryHeap<QueuedTask>>,
    manual: Mutex<Vec<RecoveryTask>>,
    events: Arc<dyn EventSink>,
    submitted: AtomicU64,
    retried: AtomicU64,
    completed: AtomicU64,
    escalated: AtomicU64,
}

impl RecoveryOrchestrator {
    pub fn new(config: RecoveryConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            queue: Mutex::new(BinaryHeap::new()),
            manual: Mutex::new(Vec::new()),
            events,
            submitted: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            escalated: AtomicU64::new(0),
        }
    }

    /// Classify and enqueue a failure. Returns the task id.
    pub fn submit(&self, kind: FailureKind, payload: serde_json::Value) -> Uuid {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        let strategy = kind.strategy();
        let id = Uuid::new_v4();

        if strategy == RecoveryStrategy::Manual {
            let task = RecoveryTask {
                id,
                failure_kind: kind,
                strategy,
                attempts: 0,
                next_attempt_at: Utc::now(),
                state: RecoveryTaskState::Escalated,
                payload,
            };
            tracing::warn!(task_id = %id, kind = ?kind, "failure requires manual recovery");
            self.manual.lock().push(task);
            return id;
        }

        let delay = strategy
            .delay(1, self.config.base_delay, self.config.max_delay)
            .unwrap_or(Duration::ZERO);
        let task = RecoveryTask {
            id,
            failure_kind: kind,
            strategy,
            attempts: 0,
            next_attempt_at: Utc::now() + self.jittered(delay),
            state: RecoveryTaskState::Pending,
            payload,
        };
        self.queue.lock().push(QueuedTask(task));
        id
    }

    fn jittered(&self, delay: Duration) -> chrono::Duration {
        let delay = if self.config.jitter && !delay.is_zero() {
            let jitter = rand::rng().random_range(0.0..0.1);
            delay.mul_f64(1.0 + jitter)
        } else {
            delay
        };
        chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(1))
    }

    /// Pop every task whose attempt time has arrived, marking it in flight.
    pub fn pop_due(&self, now: DateTime<Utc>) -> Vec<RecoveryTask> {
        let mut queue = self.queue.lock();
        let mut due = Vec::new();
        loop {
            let head_due = matches!(queue.peek(), Some(head) if head.0.next_attempt_at <= now);
            if !head_due {
                break;
            }
            if let Some(queued) = queue.pop() {
                let mut task = queued.0;
                task.state = RecoveryTaskState::InFlight;
                task.attempts += 1;
                due.push(task);
            }
        }
        due
    }

    /// Record the outcome of an attempted retry. Failed tasks are
    /// rescheduled until the attempt cap, then escalated.
    pub fn record_outcome(&self, mut task: RecoveryTask, success: bool) {
        self.retried.fetch_add(1, Ordering::Relaxed);
        if success {
            task.state = RecoveryTaskState::Completed;
            self.completed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(task_id = %task.id, "recovery completed");
            return;
        }

        if task.attempts >= self.config.max_attempts {
            self.escalate(task);
            return;
        }

        let delay = task
            .strategy
            .delay(task.attempts + 1, self.config.base_delay, self.config.max_delay)
            .unwrap_or(Duration::ZERO);
        task.state = RecoveryTaskState::Pending;
        task.next_attempt_at = Utc::now() + self.jittered(delay);
        self.queue.lock().push(QueuedTask(task));
    }

    fn escalate(&self, mut task: RecoveryTask) {
        task.state = RecoveryTaskState::Escalated;
        self.escalated.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            task_id = %task.id,
            kind = ?task.failure_kind,
            attempts = task.attempts,
            "retry cap exceeded, escalating to manual recovery"
        );
        self.events.emit(
            SecurityEvent::new(
                event_types::RECOVERY_ESCALATED,
                SecuritySeverity::Critical,
                format!(
                    "recovery task {} ({:?}) exhausted {} attempts",
                    task.id, task.failure_kind, task.attempts
                ),
                "recovery-orchestrator",
            )
            .with_metadata("task_id", serde_json::json!(task.id)),
        );
        self.manual.lock().push(task);
    }

    /// Tasks awaiting a human.
    pub fn manual_tasks(&self) -> Vec<RecoveryTask> {
        self.manual.lock().clone()
    }

    /// Tasks still scheduled for automatic retry.
    pub fn pending_count(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn stats(&self) -> RecoveryStats {
        RecoveryStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            escalated: self.escalated.load(Ordering::Relaxed),
        }
    }

    /// Background drive loop: pops due tasks and feeds them to `handler`.
    pub fn spawn(
        self: &Arc<Self>,
        handler: Arc<dyn RecoveryHandler>,
    ) -> tokio::task::JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(orchestrator.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for task in orchestrator.pop_due(Utc::now()) {
                    let success = handler.retry(&task).await;
                    orchestrator.record_outcome(task, success);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acgs_sentinel::CollectorSink;
    use serde_json::json;

    fn orchestrator() -> (Arc<RecoveryOrchestrator>, Arc<CollectorSink>) {
        let sink = Arc::new(CollectorSink::new());
        let config = RecoveryConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            max_attempts: 3,
            jitter: false,
            poll_interval: Duration::from_millis(10),
        };
        (
            Arc::new(RecoveryOrchestrator::new(config, sink.clone())),
            sink,
        )
    }

    #[test]
    fn strategy_table_matches_contract() {
        use FailureKind::*;
        assert_eq!(ConstitutionalViolation.strategy(), RecoveryStrategy::Manual);
        assert_eq!(RoleViolation.strategy(), RecoveryStrategy::Manual);
        assert_eq!(PolicyConfigMissing.strategy(), RecoveryStrategy::Manual);
        assert_eq!(ReviewDeadlock.strategy(), RecoveryStrategy::Manual);
        assert_eq!(Delivery.strategy(), RecoveryStrategy::ExponentialBackoff);
        assert_eq!(Routing.strategy(), RecoveryStrategy::ExponentialBackoff);
        assert_eq!(OpaConnectivity.strategy(), RecoveryStrategy::ExponentialBackoff);
        assert_eq!(HandlerExecution.strategy(), RecoveryStrategy::ExponentialBackoff);
        assert_eq!(MessageTimeout.strategy(), RecoveryStrategy::LinearBackoff);
        assert_eq!(DeliberationTimeout.strategy(), RecoveryStrategy::LinearBackoff);
        assert_eq!(PolicyResourceExhausted.strategy(), RecoveryStrategy::LinearBackoff);
        assert_eq!(Validation.strategy(), RecoveryStrategy::Immediate);
        assert_eq!(AgentNotRegistered.strategy(), RecoveryStrategy::Immediate);
        assert_eq!(BusNotStarted.strategy(), RecoveryStrategy::Immediate);
        assert_eq!(OpaNotInitialized.strategy(), RecoveryStrategy::Immediate);
    }

    #[test]
    fn delays_grow_per_strategy() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(60);

        let linear = RecoveryStrategy::LinearBackoff;
        assert_eq!(linear.delay(1, base, max), Some(Duration::from_secs(1)));
        assert_eq!(linear.delay(3, base, max), Some(Duration::from_secs(3)));

        let exp = RecoveryStrategy::ExponentialBackoff;
        assert_eq!(exp.delay(1, base, max), Some(Duration::from_secs(1)));
        assert_eq!(exp.delay(4, base, max), Some(Duration::from_secs(8)));
        assert_eq!(exp.delay(10, base, max), Some(max));

        assert_eq!(
            RecoveryStrategy::Immediate.delay(1, base, max),
            Some(Duration::ZERO)
        );
        assert_eq!(RecoveryStrategy::Manual.delay(1, base, max), None);
    }

    #[test]
    fn manual_failures_bypass_the_queue() {
        let (orch, _sink) = orchestrator();
        orch.submit(FailureKind::SecurityViolation, json!({"m": 1}));

        assert_eq!(orch.pending_count(), 0);
        let manual = orch.manual_tasks();
        assert_eq!(manual.len(), 1);
        assert_eq!(manual[0].state, RecoveryTaskState::Escalated);
    }

    #[test]
    fn due_tasks_pop_in_time_then_severity_order() {
        let (orch, _sink) = orchestrator();
        // Immediate strategy: both due now.
        orch.submit(FailureKind::Validation, json!({"which": "low"}));
        orch.submit(FailureKind::AgentNotRegistered, json!({"which": "low2"}));

        let due = orch.pop_due(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(due.len(), 2);
        for task in &due {
            assert_eq!(task.state, RecoveryTaskState::InFlight);
            assert_eq!(task.attempts, 1);
        }
    }

    #[test]
    fn not_yet_due_tasks_stay_queued() {
        let (orch, _sink) = orchestrator();
        orch.submit(FailureKind::MessageTimeout, json!({}));

        // Linear backoff schedules it 10ms out; nothing due at (now - 1s).
        let due = orch.pop_due(Utc::now() - chrono::Duration::seconds(1));
        assert!(due.is_empty());
        assert_eq!(orch.pending_count(), 1);
    }

    #[test]
    fn cap_exceeded_escalates_with_critical_event() {
        let (orch, sink) = orchestrator();
        orch.submit(FailureKind::Delivery, json!({"msg": "x"}));

        // Fail every attempt until the cap.
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(90));
            let due = orch.pop_due(Utc::now() + chrono::Duration::seconds(10));
            assert_eq!(due.len(), 1, "task should be due");
            orch.record_outcome(due.into_iter().next().unwrap(), false);
        }

        assert_eq!(orch.pending_count(), 0);
        assert_eq!(orch.manual_tasks().len(), 1);
        let events = sink.of_type(event_types::RECOVERY_ESCALATED);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, SecuritySeverity::Critical);
        assert_eq!(orch.stats().escalated, 1);
    }

    #[test]
    fn success_completes_task() {
        let (orch, _sink) = orchestrator();
        orch.submit(FailureKind::Validation, json!({}));

        let due = orch.pop_due(Utc::now() + chrono::Duration::seconds(1));
        orch.record_outcome(due.into_iter().next().unwrap(), true);

        assert_eq!(orch.pending_count(), 0);
        assert!(orch.manual_tasks().is_empty());
        assert_eq!(orch.stats().completed, 1);
    }

    #[tokio::test]
    async fn spawned_loop_drives_retries() {
        struct AlwaysSucceeds(AtomicU64);

        #[async_trait]
        impl RecoveryHandler for AlwaysSucceeds {
            async fn retry(&self, _task: &RecoveryTask) -> bool {
                self.0.fetch_add(1, Ordering::SeqCst);
                true
            }
        }

        let (orch, _sink) = orchestrator();
        let handler = Arc::new(AlwaysSucceeds(AtomicU64::new(0)));
        let handle = orch.spawn(handler.clone());

        orch.submit(FailureKind::Validation, json!({}));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(handler.0.load(Ordering::SeqCst), 1);
        assert_eq!(orch.stats().completed, 1);
        handle.abort();
    }
}
