//! End-to-end pipeline scenarios against the full bus facade.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use acgs_arbiter::{BreakerConfig, BreakerState, CircuitBreaker};
use acgs_bus::{
    AgentBus, AgentRegistration, AuditOutcome, BusConfig, ImpactScorer, MemoryAnchor, Message,
    MessageHandler, MessageType, RouteLane, ScoreError, SendRequest, TerminalState,
    ValidationResult,
};
use acgs_gate::{PolicyRule, RuleAction, StaticPolicy, StaticPolicyEvaluator};
use acgs_sentinel::{
    event_types, AlertManager, AlertThreshold, CollectorSink, Correlator, EventSink,
    SecurityEvent, SecurityPipeline, SecuritySeverity, SentinelError, ShipTransport, SiemConfig,
    SiemShipper,
};

const HASH: &str = "cdd01ef066bc6cf2";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}

/// Scorer pinned to one value, standing in for the ML backend.
struct FixedScorer(f64);

#[async_trait]
impl ImpactScorer for FixedScorer {
    fn name(&self) -> &str {
        "fixed"
    }
    async fn score_batch(&self, texts: &[String]) -> Result<Vec<f64>, ScoreError> {
        Ok(vec![self.0; texts.len()])
    }
}

/// Transport capturing every shipped line.
struct CapturingTransport {
    lines: Mutex<Vec<String>>,
}

impl CapturingTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            lines: Mutex::new(Vec::new()),
        })
    }
    fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

#[async_trait]
impl ShipTransport for CapturingTransport {
    async fn ship(&self, batch: &[String]) -> Result<(), SentinelError> {
        self.lines.lock().extend(batch.iter().cloned());
        Ok(())
    }
}

fn deliberation_policy() -> Arc<StaticPolicyEvaluator> {
    let evaluator = Arc::new(StaticPolicyEvaluator::new());
    evaluator.load(StaticPolicy {
        id: "agentbus.deliberation".into(),
        version: "2.1.0".into(),
        tenant_id: None,
        rules: vec![
            PolicyRule {
                id: "deny-unticketed-delete".into(),
                action_match: "delete_resource".into(),
                required_context: vec!["change_ticket".into()],
                action: RuleAction::Deny,
                message: Some("Resource deletion requires a change ticket".into()),
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
    evaluator
}

async fn register_pair(bus: &AgentBus) {
    bus.register(AgentRegistration::new("agent-a", "Agent A").with_capability("q:read"))
        .await
        .unwrap();
    bus.register(AgentRegistration::new("agent-b", "Agent B"))
        .await
        .unwrap();
}

// Scenario 1: benign query takes the fast lane and is delivered with a
// success audit record and no security events.
#[tokio::test]
async fn fast_lane_allow() {
    init_tracing();
    let anchor = MemoryAnchor::new();
    let transport = CapturingTransport::new();
    let bus = AgentBus::builder(BusConfig::new(HASH))
        .with_evaluator(deliberation_policy())
        .with_scorer(Arc::new(FixedScorer(0.12)))
        .with_anchor(anchor.clone())
        .with_siem_transport(transport.clone())
        .build()
        .unwrap();
    bus.start().await.unwrap();
    register_pair(&bus).await;

    let message = bus
        .send_message(
            SendRequest::new("agent-a", MessageType::Query)
                .with_target("agent-b")
                .with_payload_entry("q", json!("status")),
        )
        .await
        .unwrap();

    let outcome = bus.outcome(message.id).await.unwrap().unwrap();
    assert_eq!(outcome.state, TerminalState::Delivered);
    assert_eq!(outcome.lane, Some(RouteLane::Fast));
    assert!(outcome.error.is_none());

    let metrics = bus.siem_metrics().await.unwrap();
    assert_eq!(metrics.events_logged, 0, "no security events on success");

    bus.stop().await;
    let records = anchor.records();
    let processed: Vec<_> = records.iter().filter(|r| r.action == "message.process").collect();
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].outcome, AuditOutcome::Success);
    assert_eq!(processed[0].fingerprint, HASH);
}

// Scenario 2: a wrong fingerprint is terminal, audited as failure, and
// ships a CRITICAL constitutional_hash_mismatch event.
#[tokio::test]
async fn fingerprint_mismatch() {
    init_tracing();
    let anchor = MemoryAnchor::new();
    let transport = CapturingTransport::new();
    let bus = AgentBus::builder(BusConfig::new(HASH))
        .with_evaluator(deliberation_policy())
        .with_anchor(anchor.clone())
        .with_siem_transport(transport.clone())
        .build()
        .unwrap();
    bus.start().await.unwrap();
    register_pair(&bus).await;

    let message = bus
        .send_message(
            SendRequest::new("agent-a", MessageType::Query)
                .with_target("agent-b")
                .with_payload_entry("q", json!("status"))
                .with_fingerprint("0000000000000000"),
        )
        .await
        .unwrap();

    let outcome = bus.outcome(message.id).await.unwrap().unwrap();
    assert_eq!(outcome.state, TerminalState::Errored);
    assert!(outcome.error.unwrap().reason.contains("hash mismatch"));

    let metrics = bus.siem_metrics().await.unwrap();
    assert_eq!(metrics.events_logged, 1);

    bus.stop().await;
    let records = anchor.records();
    assert!(records
        .iter()
        .any(|r| r.outcome == AuditOutcome::Failure));
    assert!(transport
        .lines()
        .iter()
        .any(|line| line.contains(event_types::CONSTITUTIONAL_HASH_MISMATCH)));
}

// Scenario 3: a high-impact command deliberates, the policy denies it,
// and no handler runs.
#[tokio::test]
async fn deliberation_deny() {
    init_tracing();
    struct Recording(Arc<AtomicBool>);

    #[async_trait]
    impl MessageHandler for Recording {
        async fn handle(&self, _m: &Message) -> Result<ValidationResult, acgs_bus::BusError> {
            self.0.store(true, Ordering::SeqCst);
            Ok(ValidationResult::default())
        }
    }

    let anchor = MemoryAnchor::new();
    let ran = Arc::new(AtomicBool::new(false));
    let bus = AgentBus::builder(BusConfig::new(HASH))
        .with_evaluator(deliberation_policy())
        .with_scorer(Arc::new(FixedScorer(0.91)))
        .with_anchor(anchor.clone())
        .build()
        .unwrap();
    bus.register_handler(MessageType::Command, Arc::new(Recording(ran.clone())));
    bus.start().await.unwrap();
    register_pair(&bus).await;

    let message = bus
        .send_message(
            SendRequest::new("agent-a", MessageType::Command)
                .with_target("agent-b")
                .with_payload_entry("action", json!("delete_resource"))
                .with_payload_entry("resource", json!("replica-7")),
        )
        .await
        .unwrap();

    let outcome = bus.outcome(message.id).await.unwrap().unwrap();
    assert_eq!(outcome.lane, Some(RouteLane::Deliberate));
    assert_eq!(outcome.state, TerminalState::Denied);
    let reason = outcome.error.unwrap().reason;
    assert!(
        reason.contains("Resource deletion requires a change ticket"),
        "{reason}"
    );
    assert!(!ran.load(Ordering::SeqCst), "handler must not run on denial");

    bus.stop().await;
    assert!(anchor
        .records()
        .iter()
        .any(|r| r.outcome == AuditOutcome::Denied));
}

// Scenario 4: five consecutive failures trip the breaker; after the
// cooldown three successful probes close it. Open-state calls reject in
// O(1) without touching the downstream.
#[tokio::test]
async fn circuit_breaker_trip_and_recovery() {
    init_tracing();
    let sink = Arc::new(CollectorSink::new());
    let breaker = Arc::new(CircuitBreaker::new(
        "opa",
        BreakerConfig {
            failure_window: Duration::from_secs(60),
            failure_threshold: 5,
            cooldown: Duration::from_millis(100),
            probe_count: 3,
            max_cooldown: Duration::from_secs(1),
        },
        sink.clone(),
    ));

    for _ in 0..5 {
        let result: Result<Result<(), String>, _> = breaker
            .call(async { Err::<(), String>("connection refused".into()) })
            .await;
        assert!(result.is_ok(), "breaker still closed, call went through");
    }
    assert_eq!(breaker.state(), BreakerState::Open);
    assert_eq!(sink.of_type(event_types::CIRCUIT_BREAKER_OPEN).len(), 1);
    assert_eq!(
        sink.of_type(event_types::CIRCUIT_BREAKER_OPEN)[0].severity,
        SecuritySeverity::Warning
    );

    // Open circuit short-circuits.
    assert!(breaker.try_acquire().is_err());
    assert_eq!(breaker.short_circuited_total(), 1);

    // After cooldown, three successful probes close the circuit.
    tokio::time::sleep(Duration::from_millis(120)).await;
    for _ in 0..3 {
        breaker.try_acquire().unwrap().success();
    }
    assert_eq!(breaker.state(), BreakerState::Closed);
    let closed = sink.of_type(event_types::CIRCUIT_BREAKER_CLOSED);
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].severity, SecuritySeverity::Info);
}

// Scenario 5: three HIGH authentication failures from one tenant inside
// the window share a tenant-attack correlation id, and the alert fires
// exactly once within its cooldown.
#[tokio::test]
async fn correlation_detection() {
    init_tracing();
    let transport = CapturingTransport::new();
    let shipper = SiemShipper::spawn(SiemConfig::default(), transport.clone());
    let pipeline = SecurityPipeline::new(
        Correlator::default(),
        AlertManager::new(vec![AlertThreshold::new(
            event_types::AUTHENTICATION_FAILURE,
            3,
            Duration::from_secs(300),
        )
        .with_cooldown(Duration::from_secs(60))]),
        shipper,
    )
    .with_fingerprint(HASH);

    for i in 0..4 {
        pipeline.emit(
            SecurityEvent::new(
                event_types::AUTHENTICATION_FAILURE,
                SecuritySeverity::High,
                format!("failed login {i}"),
                "gateway",
            )
            .with_tenant("t1")
            .with_agent(format!("agent-{i}")),
        );
    }
    pipeline.flush().await;

    let metrics = pipeline.metrics().snapshot();
    assert_eq!(metrics.correlations_detected, 1);
    assert_eq!(
        metrics.alerts_triggered, 1,
        "cooldown limits the alert to one fire"
    );

    let lines = transport.lines();
    let correlated: Vec<&String> = lines
        .iter()
        .filter(|l| l.contains("tenant_attack:t1:"))
        .collect();
    assert_eq!(correlated.len(), 2, "third and fourth events correlate");

    // All correlated events share the same id ("tenant_attack:t1:" plus
    // a 36-char uuid).
    let extract = |line: &str| {
        let start = line.find("tenant_attack:t1:").unwrap();
        line[start..start + 53].to_string()
    };
    assert_eq!(extract(correlated[0]), extract(correlated[1]));
    pipeline.shutdown().await;
}

// Scenario 6: stop() drains fast work, aborts what cannot finish, audits
// the aborted messages, and flushes audit + SIEM queues.
#[tokio::test]
async fn graceful_shutdown_with_inflight_work() {
    init_tracing();
    struct SlowHandler;

    #[async_trait]
    impl MessageHandler for SlowHandler {
        fn name(&self) -> &str {
            "slow"
        }
        async fn handle(&self, _m: &Message) -> Result<ValidationResult, acgs_bus::BusError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(ValidationResult::default())
        }
    }

    let anchor = MemoryAnchor::new();
    let mut config = BusConfig::new(HASH).with_shutdown_deadline(Duration::from_millis(300));
    // Keep the per-message budget above the handler sleep so the abort
    // comes from shutdown, not the message deadline.
    config.message_deadline_ms = 60_000;
    config.handler_deadline_ms = 60_000;

    let bus = AgentBus::builder(config)
        .with_evaluator(deliberation_policy())
        .with_scorer(Arc::new(FixedScorer(0.1)))
        .with_anchor(anchor.clone())
        .build()
        .unwrap();
    bus.register_handler(MessageType::Command, Arc::new(SlowHandler));
    bus.start().await.unwrap();
    register_pair(&bus).await;

    // Three fast queries complete before shutdown.
    for _ in 0..3 {
        let m = bus
            .send_message(
                SendRequest::new("agent-a", MessageType::Query).with_target("agent-b"),
            )
            .await
            .unwrap();
        let outcome = bus.outcome(m.id).await.unwrap().unwrap();
        assert_eq!(outcome.state, TerminalState::Delivered);
    }

    // Five slow commands are still in flight when stop() lands.
    for _ in 0..5 {
        bus.send_message(
            SendRequest::new("agent-a", MessageType::Command).with_target("agent-b"),
        )
        .await
        .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bus.inflight(), 5);

    bus.stop().await;

    let records = anchor.records();
    let delivered = records
        .iter()
        .filter(|r| r.outcome == AuditOutcome::Success)
        .count();
    let aborted = records
        .iter()
        .filter(|r| r.outcome == AuditOutcome::Aborted)
        .count();
    assert_eq!(delivered, 3, "fast work completed");
    assert_eq!(aborted, 5, "in-flight work recorded as aborted");
}

// Idempotence: sending the same message id twice yields one terminal
// state and one audit record.
#[tokio::test]
async fn duplicate_send_collapses() {
    init_tracing();
    let anchor = MemoryAnchor::new();
    let bus = AgentBus::builder(BusConfig::new(HASH))
        .with_evaluator(deliberation_policy())
        .with_anchor(anchor.clone())
        .build()
        .unwrap();
    bus.start().await.unwrap();
    register_pair(&bus).await;

    let message = bus
        .send_message(
            SendRequest::new("agent-a", MessageType::Query).with_target("agent-b"),
        )
        .await
        .unwrap();
    let first = bus.outcome(message.id).await.unwrap().unwrap();

    // Asking for the same id again must observe the original terminal
    // state, not trigger a second pipeline run.
    let second = bus.outcome(message.id).await.unwrap().unwrap();
    assert_eq!(first.state, second.state);

    bus.stop().await;
    let processed = anchor
        .records()
        .iter()
        .filter(|r| r.action == "message.process")
        .count();
    assert_eq!(processed, 1);
}

// Idempotence: register twice leaves the registry unchanged.
#[tokio::test]
async fn double_register_is_idempotent() {
    init_tracing();
    let bus = AgentBus::builder(BusConfig::new(HASH))
        .with_evaluator(deliberation_policy())
        .build()
        .unwrap();
    bus.start().await.unwrap();

    let reg = AgentRegistration::new("agent-a", "Agent A").with_capability("q:read");
    let first = bus.register(reg.clone()).await.unwrap();
    let second = bus.register(reg).await.unwrap();
    assert_eq!(first.registered_at, second.registered_at);

    let agents = bus.list_agents(&Default::default()).await.unwrap();
    // agent-a plus the internal bus agent.
    assert_eq!(agents.len(), 2);
    bus.stop().await;
}
