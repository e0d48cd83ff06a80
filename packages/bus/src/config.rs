//! ACGS-Bus: Configuration
//!
//! Every recognized option with its default, builder setters in the usual
//! `with_*` style, and environment overrides under the `ACGS_` prefix.

use std::time::Duration;

use acgs_sentinel::{event_types, AlertLevel, AlertThreshold, SiemFormat};

use crate::error::BusError;

/// Full bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Expected constitutional fingerprint (required, 16 lowercase hex).
    pub fingerprint_expected: String,
    /// Handler and policy failures deny when true.
    pub fail_closed: bool,
    /// Initial impact-routing threshold.
    pub impact_threshold_initial: f64,
    /// Clamp bounds for threshold adaptation.
    pub impact_threshold_bounds: (f64, f64),
    pub deliberation_queue_capacity: usize,
    pub deliberation_workers: usize,
    /// Policy consulted by the deliberation lane.
    pub deliberation_policy_id: String,
    pub handler_deadline_ms: u64,
    pub message_deadline_ms: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_ms: u64,
    pub breaker_probe_count: u32,
    pub siem_queue_capacity: usize,
    pub siem_drop_on_overflow: bool,
    pub siem_format: SiemFormat,
    pub siem_batch_size: usize,
    pub siem_flush_ms: u64,
    pub cache_authz_ttl_s: u64,
    pub cache_policy_version_ttl_s: u64,
    pub alert_thresholds: Vec<AlertThreshold>,
    pub agent_eviction_after_ms: u64,
    pub hitl_timeout_ms: u64,
    pub shutdown_deadline_ms: u64,
    /// Latency budget for the scoring backend before keyword fallback.
    pub scorer_budget_ms: u64,
    pub audit_ring_capacity: usize,
}

impl BusConfig {
    /// Configuration with the documented defaults. The fingerprint has no
    /// default; it must come from deployment config.
    pub fn new(fingerprint_expected: impl Into<String>) -> Self {
        Self {
            fingerprint_expected: fingerprint_expected.into(),
            fail_closed: true,
            impact_threshold_initial: 0.8,
            impact_threshold_bounds: (0.5, 0.95),
            deliberation_queue_capacity: 10_000,
            deliberation_workers: 4,
            deliberation_policy_id: "agentbus.deliberation".to_string(),
            handler_deadline_ms: 1_000,
            message_deadline_ms: 5_000,
            breaker_failure_threshold: 5,
            breaker_cooldown_ms: 30_000,
            breaker_probe_count: 3,
            siem_queue_capacity: 10_000,
            siem_drop_on_overflow: true,
            siem_format: SiemFormat::Json,
            siem_batch_size: 100,
            siem_flush_ms: 1_000,
            cache_authz_ttl_s: 900,
            cache_policy_version_ttl_s: 3_600,
            alert_thresholds: Self::default_alert_thresholds(),
            agent_eviction_after_ms: 90_000,
            hitl_timeout_ms: 30_000,
            shutdown_deadline_ms: 10_000,
            scorer_budget_ms: 10,
            audit_ring_capacity: 100_000,
        }
    }

    fn default_alert_thresholds() -> Vec<AlertThreshold> {
        vec![
            AlertThreshold::new(
                event_types::AUTHENTICATION_FAILURE,
                3,
                Duration::from_secs(300),
            )
            .with_level(AlertLevel::Escalate)
            .with_cooldown(Duration::from_secs(60)),
            AlertThreshold::new(
                event_types::CONSTITUTIONAL_HASH_MISMATCH,
                1,
                Duration::from_secs(300),
            )
            .with_level(AlertLevel::Page)
            .with_cooldown(Duration::from_secs(300)),
            AlertThreshold::new(
                event_types::SUSPICIOUS_PATTERN,
                5,
                Duration::from_secs(300),
            )
            .with_level(AlertLevel::Warn)
            .with_cooldown(Duration::from_secs(120)),
        ]
    }

    pub fn with_fail_closed(mut self, fail_closed: bool) -> Self {
        self.fail_closed = fail_closed;
        self
    }

    pub fn with_impact_threshold(mut self, threshold: f64) -> Self {
        self.impact_threshold_initial = threshold;
        self
    }

    pub fn with_message_deadline(mut self, deadline: Duration) -> Self {
        self.message_deadline_ms = deadline.as_millis() as u64;
        self
    }

    pub fn with_handler_deadline(mut self, deadline: Duration) -> Self {
        self.handler_deadline_ms = deadline.as_millis() as u64;
        self
    }

    pub fn with_deliberation_capacity(mut self, capacity: usize) -> Self {
        self.deliberation_queue_capacity = capacity;
        self
    }

    pub fn with_siem_format(mut self, format: SiemFormat) -> Self {
        self.siem_format = format;
        self
    }

    pub fn with_shutdown_deadline(mut self, deadline: Duration) -> Self {
        self.shutdown_deadline_ms = deadline.as_millis() as u64;
        self
    }

    /// Apply `ACGS_*` environment overrides on top of the current values.
    pub fn from_env(mut self) -> Self {
        fn read<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok().and_then(|v| v.parse().ok())
        }

        if let Some(v) = read::<bool>("ACGS_FAIL_CLOSED") {
            self.fail_closed = v;
        }
        if let Some(v) = read::<f64>("ACGS_IMPACT_THRESHOLD") {
            self.impact_threshold_initial = v;
        }
        if let Some(v) = read::<u64>("ACGS_MESSAGE_DEADLINE_MS") {
            self.message_deadline_ms = v;
        }
        if let Some(v) = read::<u64>("ACGS_HANDLER_DEADLINE_MS") {
            self.handler_deadline_ms = v;
        }
        if let Some(v) = read::<usize>("ACGS_DELIBERATION_CAPACITY") {
            self.deliberation_queue_capacity = v;
        }
        if let Ok(v) = std::env::var("ACGS_SIEM_FORMAT") {
            self.siem_format = match v.to_ascii_uppercase().as_str() {
                "CEF" => SiemFormat::Cef,
                "LEEF" => SiemFormat::Leef,
                "SYSLOG" => SiemFormat::Syslog,
                _ => SiemFormat::Json,
            };
        }
        self
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> Result<(), BusError> {
        acgs_gate::Fingerprint::parse(&self.fingerprint_expected)
            .map_err(|e| BusError::Configuration(format!("fingerprint_expected: {e}")))?;

        let (lo, hi) = self.impact_threshold_bounds;
        if !(0.0..=1.0).contains(&lo) || !(0.0..=1.0).contains(&hi) || lo >= hi {
            return Err(BusError::Configuration(format!(
                "impact_threshold_bounds {lo}..{hi} must satisfy 0 <= lo < hi <= 1"
            )));
        }
        if !self.impact_threshold_initial.is_finite() {
            return Err(BusError::Configuration(
                "impact_threshold_initial must be finite".into(),
            ));
        }
        if self.deliberation_queue_capacity == 0 {
            return Err(BusError::Configuration(
                "deliberation_queue_capacity must be positive".into(),
            ));
        }
        if self.deliberation_workers == 0 {
            return Err(BusError::Configuration(
                "deliberation_workers must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn message_deadline(&self) -> Duration {
        Duration::from_millis(self.message_deadline_ms)
    }

    pub fn handler_deadline(&self) -> Duration {
        Duration::from_millis(self.handler_deadline_ms)
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_millis(self.shutdown_deadline_ms)
    }
}
