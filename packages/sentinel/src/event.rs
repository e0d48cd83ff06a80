//! ACGS-Sentinel: Security Events
//!
//! The event record every governed component emits, and the sink contract
//! through which events reach the SIEM pipeline. Emission is always
//! fire-and-forget; no component blocks on the sink.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Severity of a security event.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SecuritySeverity {
    Debug,
    Info,
    Warning,
    High,
    Critical,
}

impl SecuritySeverity {
    /// CEF/LEEF numeric severity (0-10).
    pub fn numeric(&self) -> u8 {
        match self {
            Self::Debug => 2,
            Self::Info => 4,
            Self::Warning => 6,
            Self::High => 8,
            Self::Critical => 10,
        }
    }

    /// RFC-5424 syslog severity code.
    pub fn syslog(&self) -> u8 {
        match self {
            Self::Debug => 7,    // debug
            Self::Info => 6,     // informational
            Self::Warning => 4,  // warning
            Self::High => 3,     // error
            Self::Critical => 2, // critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Well-known event types.
pub mod event_types {
    pub const CONSTITUTIONAL_HASH_MISMATCH: &str = "constitutional_hash_mismatch";
    pub const AUTHENTICATION_FAILURE: &str = "authentication_failure";
    pub const SUSPICIOUS_PATTERN: &str = "suspicious_pattern";
    pub const POLICY_DENIED: &str = "policy_denied";
    pub const CIRCUIT_BREAKER_OPEN: &str = "circuit_breaker_open";
    pub const CIRCUIT_BREAKER_CLOSED: &str = "circuit_breaker_closed";
    pub const AGENT_EVICTED: &str = "agent_evicted";
    pub const AUDIT_RING_OVERFLOW: &str = "audit_ring_overflow";
    pub const RECOVERY_ESCALATED: &str = "recovery_escalated";
    pub const DELIBERATION_TIMEOUT: &str = "deliberation_timeout";
}

/// A security-relevant event flowing to the SIEM pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    /// Unique event ID.
    pub id: Uuid,
    /// Event type, one of [`event_types`] or a caller-defined type.
    pub event_type: String,
    /// Severity.
    pub severity: SecuritySeverity,
    /// Human-readable message.
    pub message: String,
    /// Component or agent that observed the event.
    pub source: String,
    /// Tenant scope, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Agent involved, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Constitutional fingerprint of the emitting process.
    pub fingerprint: String,
    /// Correlation ID assigned by the correlator, if the event matched a
    /// pattern.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
}

impl SecurityEvent {
    pub fn new(
        event_type: impl Into<String>,
        severity: SecuritySeverity,
        message: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            severity,
            message: message.into(),
            source: source.into(),
            tenant_id: None,
            agent_id: None,
            metadata: HashMap::new(),
            fingerprint: String::new(),
            correlation_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = fingerprint.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Sink every governed component emits through. Implementations must
/// return in O(1); shipping happens on a background worker.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SecurityEvent);
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: SecurityEvent) {}
}

/// In-memory sink for tests and diagnostics.
#[derive(Debug, Default)]
pub struct CollectorSink {
    events: parking_lot::Mutex<Vec<SecurityEvent>>,
}

impl CollectorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far.
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events.lock().clone()
    }

    /// Events of one type.
    pub fn of_type(&self, event_type: &str) -> Vec<SecurityEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventSink for CollectorSink {
    fn emit(&self, event: SecurityEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(SecuritySeverity::Critical > SecuritySeverity::High);
        assert!(SecuritySeverity::High > SecuritySeverity::Warning);
        assert!(SecuritySeverity::Warning > SecuritySeverity::Info);
        assert!(SecuritySeverity::Info > SecuritySeverity::Debug);
    }

    #[test]
    fn severity_codes() {
        assert_eq!(SecuritySeverity::Critical.numeric(), 10);
        assert_eq!(SecuritySeverity::Debug.numeric(), 2);
        assert_eq!(SecuritySeverity::Critical.syslog(), 2);
        assert_eq!(SecuritySeverity::Info.syslog(), 6);
    }

    #[test]
    fn builder_sets_fields() {
        let event = SecurityEvent::new(
            event_types::AUTHENTICATION_FAILURE,
            SecuritySeverity::High,
            "bad token",
            "gateway",
        )
        .with_tenant("t1")
        .with_agent("agent-7")
        .with_fingerprint("cdd01ef066bc6cf2")
        .with_metadata("attempts", serde_json::json!(3));

        assert_eq!(event.tenant_id.as_deref(), Some("t1"));
        assert_eq!(event.agent_id.as_deref(), Some("agent-7"));
        assert_eq!(event.fingerprint, "cdd01ef066bc6cf2");
        assert_eq!(event.metadata["attempts"], serde_json::json!(3));
    }

    #[test]
    fn collector_sink_records() {
        let sink = CollectorSink::new();
        sink.emit(SecurityEvent::new(
            event_types::POLICY_DENIED,
            SecuritySeverity::Warning,
            "denied",
            "bus",
        ));
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.of_type(event_types::POLICY_DENIED).len(), 1);
        assert!(sink.of_type(event_types::AGENT_EVICTED).is_empty());
    }
}
