//! ACGS-Sentinel: Event Correlator
//!
//! Detects three attack shapes over the security event stream and threads a
//! correlation id through every event that matches an active pattern:
//!
//! - **Tenant attack**: >= 3 HIGH/CRITICAL events from one tenant in the window
//! - **Distributed attack**: >= 3 events of one type from >= 3 distinct agents
//! - **Escalating attack**: 3 strictly-increasing severities among the last
//!   10 events from one source
//!
//! State is bounded and TTL-evicted; correlations are stored by id, never by
//! reference.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::event::{SecurityEvent, SecuritySeverity};

/// Default detection window.
pub const DEFAULT_CORRELATION_WINDOW: Duration = Duration::from_secs(300);

/// Events kept per source for escalation detection.
const ESCALATION_HISTORY: usize = 10;

/// Bound on tracked keys per pattern map.
const MAX_TRACKED_KEYS: usize = 4096;

#[derive(Default)]
struct CorrelatorState {
    /// HIGH/CRITICAL event times per tenant.
    tenant_events: HashMap<String, VecDeque<DateTime<Utc>>>,
    /// (time, agent) per event type.
    type_events: HashMap<String, VecDeque<(DateTime<Utc>, String)>>,
    /// (time, severity) per source, last `ESCALATION_HISTORY` entries.
    source_severities: HashMap<String, VecDeque<(DateTime<Utc>, SecuritySeverity)>>,
    /// Active correlation per pattern key, with expiry.
    active: HashMap<String, (String, DateTime<Utc>)>,
}

/// Sliding-window attack correlator.
pub struct Correlator {
    window: chrono::Duration,
    state: Mutex<CorrelatorState>,
    detected: AtomicU64,
}

impl Correlator {
    pub fn new(window: Duration) -> Self {
        Self {
            window: chrono::Duration::from_std(window)
                .unwrap_or_else(|_| chrono::Duration::seconds(300)),
            state: Mutex::new(CorrelatorState::default()),
            detected: AtomicU64::new(0),
        }
    }

    /// Number of distinct correlations created so far.
    pub fn detected_total(&self) -> u64 {
        self.detected.load(Ordering::Relaxed)
    }

    /// Feed an event; returns the correlation id if any pattern matched.
    /// The same id is returned for subsequent matching events until the
    /// window expires.
    pub fn observe(&self, event: &SecurityEvent) -> Option<String> {
        let now = event.timestamp;
        let mut state = self.state.lock();

        self.evict(&mut state, now);
        self.record(&mut state, event, now);

        if let Some(id) = self.check_tenant_attack(&mut state, event, now) {
            return Some(id);
        }
        if let Some(id) = self.check_distributed_attack(&mut state, event, now) {
            return Some(id);
        }
        self.check_escalating_attack(&mut state, event, now)
    }

    fn record(&self, state: &mut CorrelatorState, event: &SecurityEvent, now: DateTime<Utc>) {
        if event.severity >= SecuritySeverity::High {
            if let Some(tenant) = &event.tenant_id {
                if state.tenant_events.len() < MAX_TRACKED_KEYS
                    || state.tenant_events.contains_key(tenant)
                {
                    let deque = state.tenant_events.entry(tenant.clone()).or_default();
                    deque.push_back(now);
                    Self::prune_times(deque, now, self.window);
                }
            }
        }

        if let Some(agent) = &event.agent_id {
            if state.type_events.len() < MAX_TRACKED_KEYS
                || state.type_events.contains_key(&event.event_type)
            {
                let deque = state.type_events.entry(event.event_type.clone()).or_default();
                deque.push_back((now, agent.clone()));
                while let Some((t, _)) = deque.front() {
                    if now - *t > self.window {
                        deque.pop_front();
                    } else {
                        break;
                    }
                }
            }
        }

        if state.source_severities.len() < MAX_TRACKED_KEYS
            || state.source_severities.contains_key(&event.source)
        {
            let deque = state.source_severities.entry(event.source.clone()).or_default();
            deque.push_back((now, event.severity));
            while deque.len() > ESCALATION_HISTORY {
                deque.pop_front();
            }
        }
    }

    fn prune_times(deque: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>, window: chrono::Duration) {
        while let Some(front) = deque.front() {
            if now - *front > window {
                deque.pop_front();
            } else {
                break;
            }
        }
    }

    fn evict(&self, state: &mut CorrelatorState, now: DateTime<Utc>) {
        state.active.retain(|_, (_, expires)| *expires > now);
        state.tenant_events.retain(|_, d| !d.is_empty());
        state.type_events.retain(|_, d| !d.is_empty());
    }

    /// Reuse the active correlation for a pattern key or mint a new one.
    fn correlation_for(
        &self,
        state: &mut CorrelatorState,
        pattern_key: String,
        id_prefix: &str,
        now: DateTime<Utc>,
    ) -> String {
        let expires = now + self.window;
        if let Some((id, expiry)) = state.active.get_mut(&pattern_key) {
            *expiry = expires;
            return id.clone();
        }
        let id = format!("{id_prefix}{}", Uuid::new_v4());
        state.active.insert(pattern_key, (id.clone(), expires));
        self.detected.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(correlation_id = %id, "attack pattern correlated");
        id
    }

    fn check_tenant_attack(
        &self,
        state: &mut CorrelatorState,
        event: &SecurityEvent,
        now: DateTime<Utc>,
    ) -> Option<String> {
        if event.severity < SecuritySeverity::High {
            return None;
        }
        let tenant = event.tenant_id.clone()?;
        let count = state.tenant_events.get(&tenant).map_or(0, |d| d.len());
        if count < 3 {
            return None;
        }
        let prefix = format!("tenant_attack:{tenant}:");
        Some(self.correlation_for(state, format!("tenant:{tenant}"), &prefix, now))
    }

    fn check_distributed_attack(
        &self,
        state: &mut CorrelatorState,
        event: &SecurityEvent,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let deque = state.type_events.get(&event.event_type)?;
        if deque.len() < 3 {
            return None;
        }
        let distinct: HashSet<&str> = deque.iter().map(|(_, agent)| agent.as_str()).collect();
        if distinct.len() < 3 {
            return None;
        }
        let prefix = format!("distributed_attack:{}:", event.event_type);
        let key = format!("distributed:{}", event.event_type);
        Some(self.correlation_for(state, key, &prefix, now))
    }

    fn check_escalating_attack(
        &self,
        state: &mut CorrelatorState,
        event: &SecurityEvent,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let severities: Vec<SecuritySeverity> = state
            .source_severities
            .get(&event.source)?
            .iter()
            .map(|(_, s)| *s)
            .collect();
        if !has_strictly_increasing_triple(&severities) {
            return None;
        }
        let prefix = format!("escalating_attack:{}:", event.source);
        let key = format!("escalating:{}", event.source);
        Some(self.correlation_for(state, key, &prefix, now))
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(DEFAULT_CORRELATION_WINDOW)
    }
}

/// Any ordered triple `i < j < k` with strictly increasing severities.
fn has_strictly_increasing_triple(severities: &[SecuritySeverity]) -> bool {
    for j in 1..severities.len() {
        let mid = severities[j];
        if severities[..j].iter().any(|s| *s < mid)
            && severities[j + 1..].iter().any(|s| *s > mid)
        {
            return true;
        }
    }
    false
}
