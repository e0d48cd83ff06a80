//! ACGS-Bus: Bus Facade
//!
//! The public surface: lifecycle (`start`/`stop`), agent registration,
//! `send_message`, `broadcast_event`, `subscribe`/`acknowledge`. The
//! facade owns every component explicitly; nothing lives in ambient
//! process state, and all workers are tied to `start`/`stop`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use acgs_arbiter::{
    ApprovalRoute, BreakerConfig, BreakerRegistry, BreakerSnapshot, DeliberationConfig,
    DeliberationQueue, DenyAllApprovals, FailureKind, RecoveryConfig, RecoveryHandler,
    RecoveryOrchestrator, RecoveryTask,
};
use acgs_gate::{
    AuthorizationCache, Fingerprint, HashGuard, PolicyEvaluator, PolicyVersionCache,
    StaticPolicyEvaluator,
};
use acgs_sentinel::{
    AlertManager, Correlator, EventSink, LogTransport, SecurityPipeline, ShipTransport,
    SiemConfig, SiemMetricsSnapshot, SiemShipper,
};

use crate::audit::{
    AuditAnchor, AuditEmitter, AuditEmitterConfig, AuditOutcome, AuditRecord, AuditStats,
    MemoryAnchor,
};
use crate::clock::Clock;
use crate::config::BusConfig;
use crate::error::BusError;
use crate::handlers::{HandlerRegistry, MessageHandler};
use crate::message::{Message, MessageType, SendRequest, TerminalState};
use crate::processor::{DeliverySink, MessageProcessor, ProcessOutcome, ProcessorParts};
use crate::registry::{AgentFilter, AgentInfo, AgentRegistration, AgentRegistry};
use crate::routing::{AdaptiveRouter, RouterConfig};
use crate::scoring::{ImpactScorer, ScoreBatcher, ScoringService};

/// Internal identity used as the source of bus-originated broadcasts.
const BUS_AGENT_ID: &str = "system.bus";

/// Per-subscriber channel depth.
const SUBSCRIPTION_DEPTH: usize = 256;

fn subscription_key(tenant: Option<&str>, agent_id: &str) -> String {
    format!("{}/{}", tenant.unwrap_or(""), agent_id)
}

/// Server-push stream of messages for one agent.
pub struct Subscription {
    pub agent_id: String,
    rx: mpsc::Receiver<Message>,
}

impl Subscription {
    /// Next delivered message. At-least-once: duplicates are possible
    /// after reconnects; consumers dedupe on `message.id`.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

/// Subscription channels plus the unacknowledged-message store backing
/// at-least-once delivery.
struct SubscriptionTable {
    channels: DashMap<String, mpsc::Sender<Message>>,
    unacked: DashMap<Uuid, (String, Message)>,
}

impl SubscriptionTable {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            channels: DashMap::new(),
            unacked: DashMap::new(),
        })
    }

    fn subscribe(&self, tenant: Option<&str>, agent_id: &str) -> Subscription {
        let key = subscription_key(tenant, agent_id);
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_DEPTH);

        // Redeliver everything still unacknowledged for this agent.
        for entry in self.unacked.iter() {
            let (owner, message) = entry.value();
            if owner == &key {
                let _ = tx.try_send(message.clone());
            }
        }

        self.channels.insert(key, tx);
        Subscription {
            agent_id: agent_id.to_string(),
            rx,
        }
    }

    fn acknowledge(&self, message_id: Uuid) -> bool {
        self.unacked.remove(&message_id).is_some()
    }
}

impl DeliverySink for SubscriptionTable {
    fn deliver(&self, message: &Message) -> Result<usize, BusError> {
        let tenant = message.tenant_id.as_deref();
        match &message.target_agent {
            Some(target) => {
                let key = subscription_key(tenant, target);
                self.unacked
                    .insert(message.id, (key.clone(), message.clone()));
                match self.channels.get(&key) {
                    Some(tx) => match tx.try_send(message.clone()) {
                        Ok(()) => Ok(1),
                        Err(mpsc::error::TrySendError::Full(_)) => Err(BusError::DeliveryFailed(
                            format!("subscriber queue for {target} is full"),
                        )),
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            drop(tx);
                            self.channels.remove(&key);
                            // Parked as unacknowledged until resubscribe.
                            Ok(0)
                        }
                    },
                    // No live subscriber: message waits in the unacked
                    // store and is pushed on the next subscribe.
                    None => Ok(0),
                }
            }
            None => {
                // Tenant broadcast; no single owner, so no unacked entry.
                let prefix = format!("{}/", tenant.unwrap_or(""));
                let mut receivers = 0;
                for entry in self.channels.iter() {
                    if entry.key().starts_with(&prefix)
                        && !entry.key().ends_with(&format!("/{BUS_AGENT_ID}"))
                    {
                        if entry.value().try_send(message.clone()).is_ok() {
                            receivers += 1;
                        }
                    }
                }
                Ok(receivers)
            }
        }
    }
}

/// Everything that exists only while the bus is started.
struct BusRuntime {
    registry: Arc<AgentRegistry>,
    processor: Arc<MessageProcessor>,
    subscriptions: Arc<SubscriptionTable>,
    pipeline: Arc<SecurityPipeline>,
    audit: Arc<AuditEmitter>,
    deliberation: Arc<DeliberationQueue>,
    batcher: Arc<ScoreBatcher>,
    router: Arc<AdaptiveRouter>,
    breakers: Arc<BreakerRegistry>,
    recovery: Arc<RecoveryOrchestrator>,
    /// Kept alive for its version-change broadcast into the authz cache.
    _version_cache: Arc<PolicyVersionCache>,
    background: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    send_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// Builder wiring external collaborators into the bus.
pub struct AgentBusBuilder {
    config: BusConfig,
    evaluator: Arc<dyn PolicyEvaluator>,
    approvals: Arc<dyn ApprovalRoute>,
    anchor: Arc<dyn AuditAnchor>,
    scorer_backend: Option<Arc<dyn ImpactScorer>>,
    siem_transport: Arc<dyn ShipTransport>,
}

impl AgentBusBuilder {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            // Deny-by-default: an empty evaluator knows no policies, so
            // deliberation fails closed until a real one is wired in.
            evaluator: Arc::new(StaticPolicyEvaluator::new()),
            approvals: Arc::new(DenyAllApprovals),
            anchor: MemoryAnchor::new(),
            scorer_backend: None,
            siem_transport: Arc::new(LogTransport),
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn PolicyEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_approvals(mut self, approvals: Arc<dyn ApprovalRoute>) -> Self {
        self.approvals = approvals;
        self
    }

    pub fn with_anchor(mut self, anchor: Arc<dyn AuditAnchor>) -> Self {
        self.anchor = anchor;
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn ImpactScorer>) -> Self {
        self.scorer_backend = Some(scorer);
        self
    }

    pub fn with_siem_transport(mut self, transport: Arc<dyn ShipTransport>) -> Self {
        self.siem_transport = transport;
        self
    }

    pub fn build(self) -> Result<Arc<AgentBus>, BusError> {
        self.config.validate()?;
        Ok(Arc::new(AgentBus {
            config: self.config,
            clock: Clock::new(),
            evaluator: self.evaluator,
            approvals: self.approvals,
            anchor: self.anchor,
            scorer_backend: self.scorer_backend,
            siem_transport: self.siem_transport,
            handlers: Arc::new(HandlerRegistry::new()),
            started: AtomicBool::new(false),
            runtime: tokio::sync::RwLock::new(None),
            inflight: Arc::new(AtomicUsize::new(0)),
            inflight_messages: Arc::new(DashMap::new()),
            idle: Arc::new(Notify::new()),
        }))
    }
}

/// Drives failed messages back through the processor.
struct BusRecoveryHandler {
    processor: Arc<MessageProcessor>,
}

#[async_trait]
impl RecoveryHandler for BusRecoveryHandler {
    async fn retry(&self, task: &RecoveryTask) -> bool {
        // Only message-shaped payloads can be re-driven.
        let Ok(message) = serde_json::from_value::<Message>(task.payload.clone()) else {
            return false;
        };
        if !matches!(
            task.failure_kind,
            FailureKind::Delivery
                | FailureKind::Routing
                | FailureKind::HandlerExecution
                | FailureKind::OpaConnectivity
                | FailureKind::MessageTimeout
                | FailureKind::DeliberationTimeout
                | FailureKind::AgentNotRegistered
        ) {
            return false;
        }
        let outcome = self.processor.reprocess(message).await;
        // A clean terminal state (delivered or a definitive denial)
        // settles the task; another error keeps retrying.
        matches!(
            outcome.state,
            TerminalState::Delivered | TerminalState::Denied
        )
    }
}

/// The constitutionally-governed agent message bus.
pub struct AgentBus {
    config: BusConfig,
    clock: Clock,
    evaluator: Arc<dyn PolicyEvaluator>,
    approvals: Arc<dyn ApprovalRoute>,
    anchor: Arc<dyn AuditAnchor>,
    scorer_backend: Option<Arc<dyn ImpactScorer>>,
    siem_transport: Arc<dyn ShipTransport>,
    handlers: Arc<HandlerRegistry>,
    started: AtomicBool,
    runtime: tokio::sync::RwLock<Option<Arc<BusRuntime>>>,
    inflight: Arc<AtomicUsize>,
    inflight_messages: Arc<DashMap<Uuid, Message>>,
    idle: Arc<Notify>,
}

impl AgentBus {
    pub fn builder(config: BusConfig) -> AgentBusBuilder {
        AgentBusBuilder::new(config)
    }

    /// Start the bus: build components, spawn workers, accept traffic.
    /// Idempotent; a second call returns without side effects.
    pub async fn start(&self) -> Result<(), BusError> {
        let mut slot = self.runtime.write().await;
        if slot.is_some() {
            return Ok(());
        }

        let config = &self.config;
        let expected = Fingerprint::parse(&config.fingerprint_expected)
            .map_err(|e| BusError::Configuration(e.to_string()))?;

        // Security pipeline: correlate -> alert -> ship.
        let shipper = SiemShipper::spawn(
            SiemConfig {
                queue_capacity: config.siem_queue_capacity,
                drop_on_overflow: config.siem_drop_on_overflow,
                format: config.siem_format,
                batch_size: config.siem_batch_size,
                flush_interval: Duration::from_millis(config.siem_flush_ms),
                meta: Default::default(),
            },
            Arc::clone(&self.siem_transport),
        );
        let pipeline = Arc::new(
            SecurityPipeline::new(
                Correlator::default(),
                AlertManager::new(config.alert_thresholds.clone()),
                shipper,
            )
            .with_fingerprint(config.fingerprint_expected.clone()),
        );
        let events: Arc<dyn EventSink> = pipeline.clone();

        // Registry with background eviction.
        let registry = Arc::new(AgentRegistry::new(events.clone()));
        registry.register(
            AgentRegistration::new(BUS_AGENT_ID, "Agent Bus")
                .with_type("system")
                .with_capability("broadcast"),
        )?;

        // Policy caches over the injected evaluator.
        let version_cache = Arc::new(PolicyVersionCache::with_ttl(
            Arc::clone(&self.evaluator),
            Duration::from_secs(config.cache_policy_version_ttl_s),
        ));
        let authz = Arc::new(AuthorizationCache::with_ttl(
            Arc::clone(&self.evaluator),
            Duration::from_secs(config.cache_authz_ttl_s),
        ));
        let version_listener = authz.spawn_version_listener(version_cache.subscribe());

        // Deliberation lane.
        let deliberation = DeliberationQueue::new(
            DeliberationConfig {
                capacity: config.deliberation_queue_capacity,
                workers: config.deliberation_workers,
                hitl_timeout: Duration::from_millis(config.hitl_timeout_ms),
            },
            Arc::clone(&authz),
            Arc::clone(&self.approvals),
            events.clone(),
        );

        // Audit emitter.
        let audit = AuditEmitter::spawn(
            AuditEmitterConfig {
                ring_capacity: config.audit_ring_capacity,
                ..Default::default()
            },
            Arc::clone(&self.anchor),
            events.clone(),
        );

        // Scoring with batch merge.
        let service = match &self.scorer_backend {
            Some(backend) => Arc::new(ScoringService::with_backend(
                Arc::clone(backend),
                Duration::from_millis(config.scorer_budget_ms),
            )),
            None => Arc::new(ScoringService::keyword_only(Duration::from_millis(
                config.scorer_budget_ms,
            ))),
        };
        let batcher = ScoreBatcher::spawn(service, 64, Duration::from_millis(10));

        let router = Arc::new(AdaptiveRouter::new(RouterConfig {
            initial_threshold: config.impact_threshold_initial,
            bounds: config.impact_threshold_bounds,
            ..Default::default()
        }));

        let breakers = Arc::new(BreakerRegistry::new(
            BreakerConfig {
                failure_threshold: config.breaker_failure_threshold,
                cooldown: Duration::from_millis(config.breaker_cooldown_ms),
                probe_count: config.breaker_probe_count,
                ..Default::default()
            },
            events.clone(),
        ));

        let recovery = Arc::new(RecoveryOrchestrator::new(
            RecoveryConfig::default(),
            events.clone(),
        ));

        let subscriptions = SubscriptionTable::new();

        let processor = MessageProcessor::new(ProcessorParts {
            config: config.clone(),
            guard: HashGuard::new(expected),
            registry: Arc::clone(&registry),
            batcher: Arc::clone(&batcher),
            router: Arc::clone(&router),
            handlers: Arc::clone(&self.handlers),
            deliberation: Arc::clone(&deliberation),
            breakers: Arc::clone(&breakers),
            recovery: Arc::clone(&recovery),
            audit: Arc::clone(&audit),
            events: events.clone(),
            delivery: subscriptions.clone(),
        });

        let eviction = registry.spawn_eviction(
            Duration::from_millis(config.agent_eviction_after_ms),
            Duration::from_secs(5),
        );
        let recovery_loop = recovery.spawn(Arc::new(BusRecoveryHandler {
            processor: Arc::clone(&processor),
        }));

        let runtime = Arc::new(BusRuntime {
            registry,
            processor,
            subscriptions,
            pipeline,
            audit,
            deliberation,
            batcher,
            router,
            breakers,
            recovery,
            _version_cache: version_cache,
            background: Mutex::new(vec![version_listener, eviction, recovery_loop]),
            send_tasks: Mutex::new(Vec::new()),
        });

        *slot = Some(runtime);
        self.started.store(true, Ordering::SeqCst);
        tracing::info!(fingerprint = %config.fingerprint_expected, "agent bus started");
        Ok(())
    }

    async fn runtime(&self) -> Result<Arc<BusRuntime>, BusError> {
        self.runtime
            .read()
            .await
            .as_ref()
            .cloned()
            .ok_or(BusError::BusNotStarted)
    }

    /// Register an agent. Idempotent per `(tenant, id)`.
    pub async fn register(&self, registration: AgentRegistration) -> Result<AgentInfo, BusError> {
        self.runtime().await?.registry.register(registration)
    }

    pub async fn unregister(&self, tenant: Option<&str>, id: &str) -> Result<AgentInfo, BusError> {
        self.runtime().await?.registry.unregister(tenant, id)
    }

    pub async fn heartbeat(&self, tenant: Option<&str>, id: &str) -> Result<(), BusError> {
        self.runtime().await?.registry.heartbeat(tenant, id)
    }

    /// Merge metadata into an agent's registration. Only the owning
    /// agent calls this.
    pub async fn update_metadata(
        &self,
        tenant: Option<&str>,
        id: &str,
        updates: HashMap<String, String>,
    ) -> Result<AgentInfo, BusError> {
        self.runtime()
            .await?
            .registry
            .update_metadata(tenant, id, updates)
    }

    pub async fn list_agents(&self, filter: &AgentFilter) -> Result<Vec<AgentInfo>, BusError> {
        Ok(self.runtime().await?.registry.list(filter))
    }

    /// Register a message handler. Allowed before or after `start`.
    pub fn register_handler(&self, message_type: MessageType, handler: Arc<dyn MessageHandler>) {
        self.handlers.register(message_type, handler);
    }

    /// Accept a message into the pipeline. Returns the constructed
    /// message immediately; processing continues asynchronously (see
    /// [`AgentBus::outcome`]).
    pub async fn send_message(&self, request: SendRequest) -> Result<Message, BusError> {
        let runtime = self.runtime().await?;

        let fingerprint = request
            .fingerprint
            .unwrap_or_else(|| self.config.fingerprint_expected.clone());
        let mut builder = Message::builder(request.source_agent, request.message_type)
            .priority(request.priority)
            .payload(request.payload)
            .fingerprint(fingerprint);
        if let Some(target) = request.target_agent {
            builder = builder.target(target);
        }
        if let Some(correlation) = request.correlation_id {
            builder = builder.correlation(correlation);
        }
        if let Some(tenant) = request.tenant_id {
            builder = builder.tenant(tenant);
        }
        let message = builder.build()?;

        self.spawn_processing(&runtime, message.clone());
        Ok(message)
    }

    /// Broadcast an event to every subscriber in the (default) tenant.
    pub async fn broadcast_event(
        &self,
        event_type: &str,
        data: Map<String, Value>,
    ) -> Result<Message, BusError> {
        let mut request = SendRequest::new(BUS_AGENT_ID, MessageType::Event);
        request.payload = data;
        request.payload.insert(
            "event".to_string(),
            Value::String(event_type.to_string()),
        );
        request.correlation_id = Some(self.clock.correlation_id());
        self.send_message(request).await
    }

    fn spawn_processing(&self, runtime: &Arc<BusRuntime>, message: Message) {
        let processor = Arc::clone(&runtime.processor);
        let inflight = Arc::clone(&self.inflight);
        let inflight_messages = Arc::clone(&self.inflight_messages);
        let idle = Arc::clone(&self.idle);

        inflight.fetch_add(1, Ordering::SeqCst);
        inflight_messages.insert(message.id, message.clone());
        // Make the outcome slot visible before the task is scheduled.
        processor.admit(message.id);

        let handle = tokio::spawn(async move {
            let id = message.id;
            let _ = processor.process(message).await;
            inflight_messages.remove(&id);
            if inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
                idle.notify_waiters();
            }
        });

        let mut tasks = runtime.send_tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Await the terminal outcome of a previously-sent message.
    pub async fn outcome(&self, message_id: Uuid) -> Result<Option<ProcessOutcome>, BusError> {
        let runtime = self.runtime().await?;
        Ok(runtime.processor.outcome(message_id).await)
    }

    /// Subscribe to an agent's message stream.
    pub async fn subscribe(
        &self,
        tenant: Option<&str>,
        agent_id: &str,
    ) -> Result<Subscription, BusError> {
        let runtime = self.runtime().await?;
        if runtime.registry.get(tenant, agent_id).is_none() {
            return Err(BusError::AgentNotRegistered(agent_id.to_string()));
        }
        Ok(runtime.subscriptions.subscribe(tenant, agent_id))
    }

    /// Acknowledge receipt of a delivered message.
    pub async fn acknowledge(&self, message_id: Uuid) -> Result<(), BusError> {
        let runtime = self.runtime().await?;
        runtime.subscriptions.acknowledge(message_id);
        Ok(())
    }

    /// Messages currently being processed.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Graceful drain: stop intake, finish in-flight work within the
    /// shutdown deadline, flush audit and SIEM queues, abort the rest
    /// (recording each as aborted and queuing it for recovery).
    pub async fn stop(&self) {
        let runtime = {
            let mut slot = self.runtime.write().await;
            self.started.store(false, Ordering::SeqCst);
            slot.take()
        };
        let Some(runtime) = runtime else {
            return;
        };

        let deadline = tokio::time::Instant::now() + self.config.shutdown_deadline();

        // Let in-flight work complete. Short waits guard against a
        // notification landing between the load and the wait.
        while self.inflight.load(Ordering::SeqCst) > 0 {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let wait = remaining.min(Duration::from_millis(100));
            let _ = tokio::time::timeout(wait, self.idle.notified()).await;
        }

        // Abort what did not finish; record and queue for recovery.
        {
            let mut tasks = runtime.send_tasks.lock();
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        for entry in self.inflight_messages.iter() {
            let message = entry.value();
            let mut record = AuditRecord::new(
                "message.process",
                message.source_agent.clone(),
                AuditOutcome::Aborted,
            )
            .with_fingerprint(self.config.fingerprint_expected.clone())
            .with_details(serde_json::json!({
                "message_id": message.id,
                "reason": "shutdown drain deadline",
            }));
            if let Some(correlation) = message.correlation_id {
                record = record.with_correlation(correlation);
            }
            runtime.audit.emit(record);
            runtime.recovery.submit(
                FailureKind::MessageTimeout,
                serde_json::to_value(message).unwrap_or(Value::Null),
            );
        }
        self.inflight_messages.clear();
        self.inflight.store(0, Ordering::SeqCst);

        // Stop intake-side workers before flushing the exhausts.
        runtime.deliberation.shutdown().await;
        runtime.batcher.shutdown().await;
        {
            let mut background = runtime.background.lock();
            for task in background.drain(..) {
                task.abort();
            }
        }

        // Flush exhausts.
        let flush_budget = deadline
            .saturating_duration_since(tokio::time::Instant::now())
            .max(Duration::from_millis(500));
        runtime.audit.flush(flush_budget).await;
        runtime.audit.shutdown().await;
        runtime.pipeline.shutdown().await;

        tracing::info!("agent bus stopped");
    }

    // ----- observability accessors -----

    pub async fn siem_metrics(&self) -> Result<SiemMetricsSnapshot, BusError> {
        Ok(self.runtime().await?.pipeline.metrics().snapshot())
    }

    pub async fn audit_stats(&self) -> Result<AuditStats, BusError> {
        Ok(self.runtime().await?.audit.stats())
    }

    pub async fn breaker_snapshots(&self) -> Result<Vec<BreakerSnapshot>, BusError> {
        Ok(self.runtime().await?.breakers.snapshots())
    }

    pub async fn routing_threshold(&self) -> Result<f64, BusError> {
        Ok(self.runtime().await?.router.threshold())
    }

    pub async fn manual_recovery_tasks(&self) -> Result<Vec<RecoveryTask>, BusError> {
        Ok(self.runtime().await?.recovery.manual_tasks())
    }

    pub async fn deliberation_occupancy(&self) -> Result<usize, BusError> {
        Ok(self.runtime().await?.deliberation.occupancy())
    }
}
