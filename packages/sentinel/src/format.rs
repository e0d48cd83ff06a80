//! ACGS-Sentinel: SIEM Wire Formats
//!
//! Renders a [`SecurityEvent`] into the formats downstream collectors
//! ingest: JSON (default), ArcSight CEF, QRadar LEEF 2.0 and RFC-5424
//! syslog. Field layouts here are wire-stable; do not reorder.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::event::SecurityEvent;

/// Syslog facility used for PRI computation (daemon).
const SYSLOG_FACILITY: u8 = 3;

/// Structured-data id registered for this product.
const SYSLOG_SD_ID: &str = "acgs2@12345";

/// Supported output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SiemFormat {
    Json,
    Cef,
    Leef,
    Syslog,
}

impl Default for SiemFormat {
    fn default() -> Self {
        Self::Json
    }
}

/// Identity stamped onto every shipped event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiemMeta {
    pub vendor: String,
    pub product: String,
    pub version: String,
    pub hostname: String,
}

impl Default for SiemMeta {
    fn default() -> Self {
        Self {
            vendor: "ACGS-2".to_string(),
            product: "EnhancedAgentBus".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
        }
    }
}

/// Render an event in the requested format.
pub fn format_event(event: &SecurityEvent, meta: &SiemMeta, format: SiemFormat) -> String {
    match format {
        SiemFormat::Json => to_json(event, meta),
        SiemFormat::Cef => to_cef(event, meta),
        SiemFormat::Leef => to_leef(event, meta),
        SiemFormat::Syslog => to_syslog(event, meta),
    }
}

/// RFC-3339 UTC with microsecond precision.
fn rfc3339_micros(event: &SecurityEvent) -> String {
    event.timestamp.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

fn to_json(event: &SecurityEvent, meta: &SiemMeta) -> String {
    let body = json!({
        "id": event.id,
        "event_type": event.event_type,
        "severity": event.severity.as_str(),
        "message": event.message,
        "source": event.source,
        "tenant_id": event.tenant_id,
        "agent_id": event.agent_id,
        "metadata": event.metadata,
        "fingerprint": event.fingerprint,
        "correlation_id": event.correlation_id,
        "timestamp": rfc3339_micros(event),
        "_siem": {
            "vendor": meta.vendor,
            "product": meta.product,
            "version": meta.version,
            "hostname": meta.hostname,
        },
    });
    body.to_string()
}

/// Escape the CEF header fields (pipe and backslash).
fn cef_header_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('|', "\\|")
}

/// Escape CEF extension values (backslash, equals, newlines).
fn cef_ext_escape(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('=', "\\=")
        .replace('\n', "\\n")
        .replace('\r', "")
}

fn to_cef(event: &SecurityEvent, meta: &SiemMeta) -> String {
    let event_type = cef_header_escape(&event.event_type);
    let mut out = format!(
        "CEF:0|{}|{}|{}|{}|Security Event: {}|{}|",
        cef_header_escape(&meta.vendor),
        cef_header_escape(&meta.product),
        cef_header_escape(&meta.version),
        event_type,
        event_type,
        event.severity.numeric(),
    );
    out.push_str(&format!(
        "msg={} src={} rt={} cat={}",
        cef_ext_escape(&event.message),
        cef_ext_escape(&event.source),
        event.timestamp.timestamp_millis(),
        cef_ext_escape(&event.event_type),
    ));
    out.push_str(&format!(
        " cs1={} cs1Label=TenantID",
        cef_ext_escape(event.tenant_id.as_deref().unwrap_or("")),
    ));
    out.push_str(&format!(
        " cs2={} cs2Label=AgentID",
        cef_ext_escape(event.agent_id.as_deref().unwrap_or("")),
    ));
    out.push_str(&format!(
        " cs4={} cs4Label=ConstitutionalHash",
        cef_ext_escape(&event.fingerprint),
    ));
    out
}

fn to_leef(event: &SecurityEvent, meta: &SiemMeta) -> String {
    let fields = [
        format!("devTime={}", rfc3339_micros(event)),
        format!("cat={}", event.event_type),
        format!("sev={}", event.severity.numeric()),
        format!("msg={}", event.message.replace('\t', " ")),
        format!("src={}", event.source),
        format!("tenantId={}", event.tenant_id.as_deref().unwrap_or("")),
        format!("agentId={}", event.agent_id.as_deref().unwrap_or("")),
        format!("constitutionalHash={}", event.fingerprint),
    ];
    format!(
        "LEEF:2.0|{}|{}|{}|{}|{}",
        meta.vendor,
        meta.product,
        meta.version,
        event.event_type,
        fields.join("\t"),
    )
}

fn to_syslog(event: &SecurityEvent, meta: &SiemMeta) -> String {
    let pri = SYSLOG_FACILITY * 8 + event.severity.syslog();
    let sd_escape = |s: &str| {
        s.replace('\\', "\\\\")
            .replace('"', "\\\"")
            .replace(']', "\\]")
    };
    format!(
        "<{pri}>1 {timestamp} {hostname} {app} - {msgid} [{sd_id} severity=\"{severity}\" constitutionalHash=\"{hash}\" tenantId=\"{tenant}\"] {msg}",
        timestamp = rfc3339_micros(event),
        hostname = meta.hostname,
        app = meta.product,
        msgid = event.event_type,
        sd_id = SYSLOG_SD_ID,
        severity = event.severity.as_str(),
        hash = sd_escape(&event.fingerprint),
        tenant = sd_escape(event.tenant_id.as_deref().unwrap_or("-")),
        msg = event.message,
    )
}
