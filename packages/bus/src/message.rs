//! ACGS-Bus: Message Model
//!
//! The immutable governed message, its terminal states, and the mergeable
//! validation result every pipeline step contributes to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::BusError;

/// Message kinds the bus routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Command,
    Query,
    Event,
    Response,
    Error,
}

/// Delivery priority. Ordering: `Critical` sorts first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessagePriority {
    Critical,
    High,
    Normal,
    Low,
}

impl Default for MessagePriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Pipeline progress states (observability only; the terminal subset is
/// [`TerminalState`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageState {
    Received,
    Validated,
    RoutedFast,
    RoutedDeliberate,
    HandlersRun,
    Denied,
    Errored,
    Audited,
}

/// The exactly-one terminal state every processed message reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalState {
    Delivered,
    Denied,
    Errored,
}

/// An immutable governed message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub message_type: MessageType,
    pub priority: MessagePriority,
    /// Sending agent; never empty.
    pub source_agent: String,
    /// Receiving agent; `None` broadcasts within the tenant.
    pub target_agent: Option<String>,
    /// Opaque payload.
    pub payload: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    /// Threads causally-related messages.
    pub correlation_id: Option<Uuid>,
    /// Constitutional fingerprint the sender claims.
    pub fingerprint: String,
    /// Tenant scope for registry lookups and policy evaluation.
    pub tenant_id: Option<String>,
}

impl Message {
    pub fn builder(
        source_agent: impl Into<String>,
        message_type: MessageType,
    ) -> MessageBuilder {
        MessageBuilder {
            message_type,
            priority: MessagePriority::Normal,
            source_agent: source_agent.into(),
            target_agent: None,
            payload: Map::new(),
            correlation_id: None,
            fingerprint: String::new(),
            tenant_id: None,
        }
    }

    /// The payload's `action` field, falling back to the message type.
    /// Policy evaluation keys off this.
    pub fn action(&self) -> String {
        self.payload
            .get("action")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| format!("{:?}", self.message_type).to_lowercase())
    }
}

/// Builder for [`Message`].
pub struct MessageBuilder {
    message_type: MessageType,
    priority: MessagePriority,
    source_agent: String,
    target_agent: Option<String>,
    payload: Map<String, Value>,
    correlation_id: Option<Uuid>,
    fingerprint: String,
    tenant_id: Option<String>,
}

impl MessageBuilder {
    pub fn priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn target(mut self, target_agent: impl Into<String>) -> Self {
        self.target_agent = Some(target_agent.into());
        self
    }

    pub fn payload_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = fingerprint.into();
        self
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn build(self) -> Result<Message, BusError> {
        if self.source_agent.is_empty() {
            return Err(BusError::Validation("source_agent must not be empty".into()));
        }
        if let Some(target) = &self.target_agent {
            if target.is_empty() {
                return Err(BusError::Validation("target_agent must not be empty".into()));
            }
        }
        Ok(Message {
            id: Uuid::new_v4(),
            message_type: self.message_type,
            priority: self.priority,
            source_agent: self.source_agent,
            target_agent: self.target_agent,
            payload: self.payload,
            timestamp: Utc::now(),
            correlation_id: self.correlation_id,
            fingerprint: self.fingerprint,
            tenant_id: self.tenant_id,
        })
    }
}

/// Wire-stable send request accepted by the bus facade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    pub message_type: MessageType,
    #[serde(default)]
    pub priority: MessagePriority,
    pub source_agent: String,
    #[serde(default)]
    pub target_agent: Option<String>,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Fingerprint claimed by the sender; the bus's expected fingerprint
    /// is stamped when absent.
    #[serde(default)]
    pub fingerprint: Option<String>,
}

impl SendRequest {
    pub fn new(source_agent: impl Into<String>, message_type: MessageType) -> Self {
        Self {
            message_type,
            priority: MessagePriority::Normal,
            source_agent: source_agent.into(),
            target_agent: None,
            payload: Map::new(),
            correlation_id: None,
            tenant_id: None,
            fingerprint: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target_agent = Some(target.into());
        self
    }

    pub fn with_payload_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }
}

/// Mergeable validation verdict accumulated across pipeline steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    /// Ordered failure reasons.
    pub errors: Vec<String>,
    /// Highest impact observed so far, in [0,1]. NaN is sticky: once any
    /// contributor reports NaN the merged score stays NaN so routing can
    /// fail safe.
    pub impact_score: f64,
    pub requires_deliberation: bool,
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            impact_score: 0.0,
            requires_deliberation: false,
        }
    }
}

impl ValidationResult {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            errors: vec![reason.into()],
            impact_score: 0.0,
            requires_deliberation: false,
        }
    }

    pub fn add_error(&mut self, reason: impl Into<String>) {
        self.errors.push(reason.into());
        self.valid = false;
    }

    /// Merge algebra: valid AND, errors concatenated in order, impact max
    /// (NaN-propagating), deliberation OR.
    pub fn merge(&mut self, other: ValidationResult) {
        self.valid = self.valid && other.valid;
        self.errors.extend(other.errors);
        self.impact_score = if self.impact_score.is_nan() || other.impact_score.is_nan() {
            f64::NAN
        } else {
            self.impact_score.max(other.impact_score)
        };
        self.requires_deliberation = self.requires_deliberation || other.requires_deliberation;
    }
}
