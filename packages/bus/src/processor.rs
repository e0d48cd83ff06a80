//! ACGS-Bus: Message Processor
//!
//! The per-message pipeline: fingerprint guard, payload pre-screen,
//! registry resolution under a circuit breaker, batched impact scoring,
//! adaptive routing, fast or deliberation lane, and exactly one audit
//! record per terminal state. Messages sharing a `(source_agent,
//! correlation_id)` pair process FIFO; duplicate submissions of one
//! message id collapse onto a single terminal result.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;
use uuid::Uuid;

use acgs_arbiter::{
    BreakerRegistry, DeliberationQueue, DeliberationVerdict, RecoveryOrchestrator,
};
use acgs_gate::{DecisionInput, HashGuard};
use acgs_sentinel::{event_types, EventSink, SecurityEvent, SecuritySeverity};

use crate::audit::{AuditEmitter, AuditOutcome, AuditRecord};
use crate::config::BusConfig;
use crate::error::{BusError, ErrorRecord};
use crate::handlers::HandlerRegistry;
use crate::message::{Message, TerminalState};
use crate::registry::AgentRegistry;
use crate::routing::{AdaptiveRouter, DeliberationFeedback, RouteLane};
use crate::scoring::{message_text, ScoreBatcher};
use crate::security::scan_payload;

/// Breaker shielding registry lookups.
const REGISTRY_BREAKER: &str = "registry";

/// Upper bound on remembered message ids for idempotency collapse.
const SEEN_CAPACITY: usize = 100_000;

/// Where validated messages go. The bus facade implements this over its
/// subscription table.
pub trait DeliverySink: Send + Sync {
    /// Deliver to the target (or broadcast); returns the receiver count.
    fn deliver(&self, message: &Message) -> Result<usize, BusError>;
}

/// Sink for tests: accepts everything.
#[derive(Debug, Default)]
pub struct NullDelivery;

impl DeliverySink for NullDelivery {
    fn deliver(&self, _message: &Message) -> Result<usize, BusError> {
        Ok(0)
    }
}

/// Unpublished terminal-result slot; `claimed` marks that a processing
/// task owns it.
struct PublisherSlot {
    tx: watch::Sender<Option<ProcessOutcome>>,
    claimed: AtomicBool,
}

/// Terminal result of processing one message.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub message_id: Uuid,
    pub state: TerminalState,
    pub lane: Option<RouteLane>,
    pub impact_score: Option<f64>,
    pub error: Option<ErrorRecord>,
}

/// Everything the processor orchestrates.
pub struct ProcessorParts {
    pub config: BusConfig,
    pub guard: HashGuard,
    pub registry: Arc<AgentRegistry>,
    pub batcher: Arc<ScoreBatcher>,
    pub router: Arc<AdaptiveRouter>,
    pub handlers: Arc<HandlerRegistry>,
    pub deliberation: Arc<DeliberationQueue>,
    pub breakers: Arc<BreakerRegistry>,
    pub recovery: Arc<RecoveryOrchestrator>,
    pub audit: Arc<AuditEmitter>,
    pub events: Arc<dyn EventSink>,
    pub delivery: Arc<dyn DeliverySink>,
}

/// The pipeline orchestrator.
pub struct MessageProcessor {
    config: BusConfig,
    guard: HashGuard,
    registry: Arc<AgentRegistry>,
    batcher: Arc<ScoreBatcher>,
    router: Arc<AdaptiveRouter>,
    handlers: Arc<HandlerRegistry>,
    deliberation: Arc<DeliberationQueue>,
    breakers: Arc<BreakerRegistry>,
    recovery: Arc<RecoveryOrchestrator>,
    audit: Arc<AuditEmitter>,
    events: Arc<dyn EventSink>,
    delivery: Arc<dyn DeliverySink>,
    outcomes: DashMap<Uuid, watch::Receiver<Option<ProcessOutcome>>>,
    publishers: DashMap<Uuid, PublisherSlot>,
    seen_order: Mutex<VecDeque<Uuid>>,
    fifo: DashMap<(String, Uuid), Arc<tokio::sync::Mutex<()>>>,
    processed_total: AtomicU64,
}

impl MessageProcessor {
    pub fn new(parts: ProcessorParts) -> Arc<Self> {
        Arc::new(Self {
            config: parts.config,
            guard: parts.guard,
            registry: parts.registry,
            batcher: parts.batcher,
            router: parts.router,
            handlers: parts.handlers,
            deliberation: parts.deliberation,
            breakers: parts.breakers,
            recovery: parts.recovery,
            audit: parts.audit,
            events: parts.events,
            delivery: parts.delivery,
            outcomes: DashMap::new(),
            publishers: DashMap::new(),
            seen_order: Mutex::new(VecDeque::new()),
            fifo: DashMap::new(),
            processed_total: AtomicU64::new(0),
        })
    }

    pub fn processed_total(&self) -> u64 {
        self.processed_total.load(Ordering::Relaxed)
    }

    /// Process a message to its terminal state. Idempotent over
    /// `message.id`: a duplicate submission returns the original result
    /// (awaiting it if still in flight) and produces no second audit
    /// record.
    pub async fn process(&self, message: Message) -> ProcessOutcome {
        let id = message.id;

        // Duplicate collapse: claim the publisher slot; an unclaimed slot
        // makes this task the leader, anything else awaits the leader's
        // result.
        let mut leader = false;
        for _ in 0..2 {
            self.admit(id);
            leader = self
                .publishers
                .get(&id)
                .map(|slot| !slot.claimed.swap(true, Ordering::SeqCst))
                .unwrap_or(false);
            if leader {
                break;
            }
            if let Some(rx) = self.outcomes.get(&id).map(|r| r.clone()) {
                return Self::await_outcome(rx, id).await;
            }
            // Slot evicted between admit and claim; re-admit once.
        }
        if !leader {
            // Pathological eviction race; process without collapse.
            tracing::warn!(message_id = %id, "idempotency slot unavailable");
        }

        // FIFO per (source, correlation).
        let fifo_key = message
            .correlation_id
            .map(|c| (message.source_agent.clone(), c));
        let _fifo_guard = match &fifo_key {
            Some(key) => {
                let slot = self
                    .fifo
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                    .clone();
                Some(slot.lock_owned().await)
            }
            None => None,
        };

        let deadline = self.config.message_deadline();
        let outcome = if deadline.is_zero() {
            // Zero budget: immediate timeout, nothing runs.
            self.terminal(
                &message,
                TerminalState::Errored,
                AuditOutcome::Failure,
                None,
                None,
                Some(BusError::MessageTimeout { budget_ms: 0 }),
            )
        } else {
            match tokio::time::timeout(deadline, self.pipeline(&message)).await {
                Ok(outcome) => outcome,
                Err(_) => self.terminal(
                    &message,
                    TerminalState::Errored,
                    AuditOutcome::Failure,
                    None,
                    None,
                    Some(BusError::MessageTimeout {
                        budget_ms: self.config.message_deadline_ms,
                    }),
                ),
            }
        };

        drop(_fifo_guard);
        if let Some(key) = fifo_key {
            // Drop the lane lock once nobody else holds it.
            self.fifo
                .remove_if(&key, |_, slot| Arc::strong_count(slot) == 1);
        }

        if let Some((_, slot)) = self.publishers.remove(&id) {
            let _ = slot.tx.send(Some(outcome.clone()));
        }
        self.processed_total.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    /// Pre-register the idempotency slot for a message about to be
    /// processed, so [`MessageProcessor::outcome`] observes it before the
    /// processing task is scheduled.
    pub fn admit(&self, id: Uuid) {
        if self.outcomes.contains_key(&id) {
            return;
        }
        if let Entry::Vacant(vacant) = self.outcomes.entry(id) {
            let (tx, rx) = watch::channel(None);
            vacant.insert(rx);
            self.publishers.insert(
                id,
                PublisherSlot {
                    tx,
                    claimed: AtomicBool::new(false),
                },
            );
            self.remember(id);
        }
    }

    /// Re-run a message that previously errored (recovery path). Clears
    /// the idempotency memory for its id first.
    pub async fn reprocess(&self, message: Message) -> ProcessOutcome {
        self.forget(message.id);
        self.process(message).await
    }

    /// The terminal result for a message id, awaiting in-flight work.
    pub async fn outcome(&self, message_id: Uuid) -> Option<ProcessOutcome> {
        let rx = self.outcomes.get(&message_id).map(|r| r.clone())?;
        Some(Self::await_outcome(rx, message_id).await)
    }

    fn remember(&self, id: Uuid) {
        let mut order = self.seen_order.lock();
        order.push_back(id);
        while order.len() > SEEN_CAPACITY {
            if let Some(old) = order.pop_front() {
                self.outcomes.remove(&old);
                self.publishers.remove(&old);
            }
        }
    }

    fn forget(&self, id: Uuid) {
        self.outcomes.remove(&id);
        self.publishers.remove(&id);
        self.seen_order.lock().retain(|x| *x != id);
    }

    async fn await_outcome(
        mut rx: watch::Receiver<Option<ProcessOutcome>>,
        id: Uuid,
    ) -> ProcessOutcome {
        loop {
            let current = rx.borrow().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if rx.changed().await.is_err() {
                // Publisher vanished without a result (shutdown).
                return ProcessOutcome {
                    message_id: id,
                    state: TerminalState::Errored,
                    lane: None,
                    impact_score: None,
                    error: Some(BusError::BusNotStarted.to_record(None)),
                };
            }
        }
    }

    async fn pipeline(&self, message: &Message) -> ProcessOutcome {
        // 1. Constitutional gate. Mismatch is terminal and critical.
        if let Err(gate_err) = self.guard.require(&message.fingerprint) {
            let mut event = SecurityEvent::new(
                event_types::CONSTITUTIONAL_HASH_MISMATCH,
                SecuritySeverity::Critical,
                format!(
                    "message {} carried fingerprint {:?}",
                    message.id, message.fingerprint
                ),
                "message-processor",
            )
            .with_agent(message.source_agent.clone())
            .with_fingerprint(self.guard.expected().to_string());
            if let Some(tenant) = &message.tenant_id {
                event = event.with_tenant(tenant.clone());
            }
            self.events.emit(event);

            return self.terminal(
                message,
                TerminalState::Errored,
                AuditOutcome::Failure,
                None,
                None,
                Some(gate_err.into()),
            );
        }

        // 2. Payload pre-screen.
        if let Some(pattern) = scan_payload(&message.payload) {
            let mut event = SecurityEvent::new(
                event_types::SUSPICIOUS_PATTERN,
                SecuritySeverity::High,
                format!("payload matched injection pattern {pattern:?}"),
                "message-processor",
            )
            .with_agent(message.source_agent.clone());
            if let Some(tenant) = &message.tenant_id {
                event = event.with_tenant(tenant.clone());
            }
            self.events.emit(event);

            return self.terminal(
                message,
                TerminalState::Denied,
                AuditOutcome::Denied,
                None,
                None,
                Some(BusError::SuspiciousPayload(pattern.to_string())),
            );
        }

        // 3. Resolve source and target through the registry breaker.
        let breaker = self.breakers.get_or_create(REGISTRY_BREAKER);
        let resolution = match breaker.try_acquire() {
            Ok(guard) => {
                let tenant = message.tenant_id.as_deref();
                let source_known = self.registry.get(tenant, &message.source_agent).is_some();
                let target_known = match &message.target_agent {
                    Some(target) => self.registry.get(tenant, target).is_some(),
                    None => true,
                };
                guard.success();
                Ok((source_known, target_known))
            }
            Err(err) => Err(err),
        };

        match resolution {
            Err(err) => {
                return self.terminal(
                    message,
                    TerminalState::Errored,
                    AuditOutcome::Failure,
                    None,
                    None,
                    Some(err.into()),
                );
            }
            Ok((false, _)) => {
                return self.terminal(
                    message,
                    TerminalState::Errored,
                    AuditOutcome::Failure,
                    None,
                    None,
                    Some(BusError::AgentNotRegistered(message.source_agent.clone())),
                );
            }
            Ok((true, false)) => {
                return self.terminal(
                    message,
                    TerminalState::Denied,
                    AuditOutcome::Denied,
                    None,
                    None,
                    Some(BusError::UnknownTarget(
                        message.target_agent.clone().unwrap_or_default(),
                    )),
                );
            }
            Ok((true, true)) => {}
        }

        // 4. Impact scoring (batch-merged).
        let score = self.batcher.score(message_text(message)).await;

        // 5. Route.
        match self.router.route(score) {
            RouteLane::Fast => self.fast_lane(message, score).await,
            RouteLane::Deliberate => self.deliberate_lane(message, score).await,
        }
    }

    async fn fast_lane(&self, message: &Message, score: f64) -> ProcessOutcome {
        self.execute_and_deliver(message, score, RouteLane::Fast).await
    }

    async fn deliberate_lane(&self, message: &Message, score: f64) -> ProcessOutcome {
        let mut input = DecisionInput::new(message.source_agent.clone(), message.action());
        for (key, value) in &message.payload {
            input.context.insert(key.clone(), value.clone());
        }
        if let Some(tenant) = &message.tenant_id {
            input = input.with_tenant(tenant.clone());
        }

        let verdict = self
            .deliberation
            .submit(
                &message.source_agent,
                &self.config.deliberation_policy_id,
                input,
            )
            .await;

        match verdict {
            Err(err) => self.terminal(
                message,
                TerminalState::Errored,
                AuditOutcome::Failure,
                Some(RouteLane::Deliberate),
                Some(score),
                Some(err.into()),
            ),
            Ok(DeliberationVerdict::Allowed(decision)) => {
                // A human overturning the denial is a confirmed false
                // positive: feed the router.
                if decision.reasons.iter().any(|r| r.contains("human")) {
                    self.router.record_feedback(DeliberationFeedback {
                        score,
                        confirmed_harmful: false,
                    });
                }
                self.execute_and_deliver(message, score, RouteLane::Deliberate)
                    .await
            }
            Ok(DeliberationVerdict::Denied(decision)) => {
                if decision.requires_human() {
                    self.router.record_feedback(DeliberationFeedback {
                        score,
                        confirmed_harmful: true,
                    });
                }
                self.terminal(
                    message,
                    TerminalState::Denied,
                    AuditOutcome::Denied,
                    Some(RouteLane::Deliberate),
                    Some(score),
                    Some(BusError::PolicyDenied {
                        reasons: decision.reasons,
                    }),
                )
            }
            Ok(DeliberationVerdict::TimedOut) => self.terminal(
                message,
                TerminalState::Errored,
                AuditOutcome::Failure,
                Some(RouteLane::Deliberate),
                Some(score),
                Some(BusError::DeliberationTimeout),
            ),
            Ok(DeliberationVerdict::Failed(reason)) => {
                if self.config.fail_closed {
                    self.terminal(
                        message,
                        TerminalState::Denied,
                        AuditOutcome::Denied,
                        Some(RouteLane::Deliberate),
                        Some(score),
                        Some(BusError::PolicyUnavailable(reason)),
                    )
                } else {
                    tracing::warn!(
                        message_id = %message.id,
                        reason,
                        "policy evaluation failed, fail-open proceeds"
                    );
                    self.execute_and_deliver(message, score, RouteLane::Deliberate)
                        .await
                }
            }
        }
    }

    async fn execute_and_deliver(
        &self,
        message: &Message,
        score: f64,
        lane: RouteLane,
    ) -> ProcessOutcome {
        let outcome = self.handlers.execute(&self.config, message).await;

        if outcome.failed() && self.config.fail_closed {
            return self.terminal(
                message,
                TerminalState::Errored,
                AuditOutcome::Failure,
                Some(lane),
                Some(score),
                Some(BusError::HandlerFailed(
                    outcome.handler_failures.join("; "),
                )),
            );
        }
        if !outcome.result.valid {
            return self.terminal(
                message,
                TerminalState::Denied,
                AuditOutcome::Denied,
                Some(lane),
                Some(score),
                Some(BusError::Validation(outcome.result.errors.join("; "))),
            );
        }

        let audit_outcome = if outcome.failed() {
            // fail-open with recorded handler errors.
            AuditOutcome::Partial
        } else {
            AuditOutcome::Success
        };

        match self.delivery.deliver(message) {
            Ok(_receivers) => self.terminal(
                message,
                TerminalState::Delivered,
                audit_outcome,
                Some(lane),
                Some(score),
                None,
            ),
            Err(err) => self.terminal(
                message,
                TerminalState::Errored,
                AuditOutcome::Failure,
                Some(lane),
                Some(score),
                Some(err),
            ),
        }
    }

    /// Build the terminal outcome: classify for recovery, emit exactly
    /// one audit record, produce the caller-visible result.
    fn terminal(
        &self,
        message: &Message,
        state: TerminalState,
        audit_outcome: AuditOutcome,
        lane: Option<RouteLane>,
        score: Option<f64>,
        error: Option<BusError>,
    ) -> ProcessOutcome {
        if state == TerminalState::Errored {
            if let Some(err) = &error {
                if let Some(kind) = err.failure_kind() {
                    self.recovery.submit(
                        kind,
                        serde_json::to_value(message).unwrap_or(serde_json::Value::Null),
                    );
                }
            }
        }

        let error_record = error.map(|e| e.to_record(message.correlation_id));
        let details = json!({
            "message_id": message.id,
            "message_type": message.message_type,
            "target_agent": message.target_agent,
            "lane": lane,
            "impact_score": score,
            "error": error_record.as_ref().map(|r| r.reason.clone()),
        });

        let mut record = AuditRecord::new("message.process", message.source_agent.clone(), audit_outcome)
            .with_fingerprint(self.guard.expected().to_string())
            .with_details(details);
        if let Some(correlation) = message.correlation_id {
            record = record.with_correlation(correlation);
        }
        self.audit.emit(record);

        ProcessOutcome {
            message_id: message.id,
            state,
            lane,
            impact_score: score,
            error: error_record,
        }
    }
}
