//! ACGS-Sentinel: Security Observability
//!
//! Features implemented:
//! - **Security events**: the governed event record and the O(1) sink
//!   contract every component emits through
//! - **Alert Manager**: thresholded alerting with cooldown and escalation
//! - **Correlator**: tenant / distributed / escalating attack detection
//!   with correlation-id propagation
//! - **SIEM Shipper**: bounded fire-and-forget queue, batch shipping,
//!   JSON / CEF / LEEF / RFC-5424 wire formats

pub mod alerts;
pub mod correlation;
pub mod event;
pub mod format;
pub mod siem;

// Re-exports
pub use alerts::{Alert, AlertLevel, AlertManager, AlertThreshold};
pub use correlation::{Correlator, DEFAULT_CORRELATION_WINDOW};
pub use event::{
    event_types, CollectorSink, EventSink, NullSink, SecurityEvent, SecuritySeverity,
};
pub use format::{format_event, SiemFormat, SiemMeta};
pub use siem::{
    HttpTransport, LogTransport, SecurityPipeline, SentinelError, ShipTransport, SiemConfig,
    SiemMetrics, SiemMetricsSnapshot, SiemShipper,
};
