//! ACGS-Sentinel: Alert Manager
//!
//! Thresholded alerting over the security event stream. Each threshold
//! names an event type, a count over a sliding window, an alert level and
//! a cooldown. Re-firing inside `cooldown * escalation_multiplier` bumps
//! the alert one level.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::SecurityEvent;

/// Alert escalation levels, lowest first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Notify,
    Warn,
    Escalate,
    Page,
}

impl AlertLevel {
    fn bump(self) -> Self {
        match self {
            Self::Notify => Self::Warn,
            Self::Warn => Self::Escalate,
            Self::Escalate => Self::Page,
            Self::Page => Self::Page,
        }
    }
}

/// One alerting rule.
#[derive(Debug, Clone)]
pub struct AlertThreshold {
    /// Event type this rule watches.
    pub event_type: String,
    /// Occurrences within `window` required to fire.
    pub count: usize,
    /// Sliding window.
    pub window: Duration,
    /// Base level of the alert.
    pub level: AlertLevel,
    /// Minimum gap between consecutive fires.
    pub cooldown: Duration,
    /// Re-firing within `cooldown * escalation_multiplier` escalates the
    /// level one step.
    pub escalation_multiplier: f64,
}

impl AlertThreshold {
    pub fn new(event_type: impl Into<String>, count: usize, window: Duration) -> Self {
        Self {
            event_type: event_type.into(),
            count,
            window,
            level: AlertLevel::Warn,
            cooldown: Duration::from_secs(60),
            escalation_multiplier: 2.0,
        }
    }

    pub fn with_level(mut self, level: AlertLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_escalation_multiplier(mut self, multiplier: f64) -> Self {
        self.escalation_multiplier = multiplier;
        self
    }
}

/// A fired alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub event_type: String,
    pub level: AlertLevel,
    /// Occurrences observed within the window at fire time.
    pub observed: usize,
    pub triggered_at: DateTime<Utc>,
    /// Correlation id of the triggering event, if any.
    pub correlation_id: Option<String>,
}

#[derive(Default)]
struct TypeState {
    occurrences: VecDeque<DateTime<Utc>>,
    last_fired: Option<DateTime<Utc>>,
    last_level: Option<AlertLevel>,
}

/// Threshold-based alert manager.
pub struct AlertManager {
    thresholds: HashMap<String, AlertThreshold>,
    state: Mutex<HashMap<String, TypeState>>,
}

impl AlertManager {
    pub fn new(thresholds: Vec<AlertThreshold>) -> Self {
        Self {
            thresholds: thresholds
                .into_iter()
                .map(|t| (t.event_type.clone(), t))
                .collect(),
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Feed an event; returns the alert if a threshold fired.
    pub fn observe(&self, event: &SecurityEvent) -> Option<Alert> {
        let threshold = self.thresholds.get(&event.event_type)?;
        let now = event.timestamp;
        let window = chrono::Duration::from_std(threshold.window).ok()?;
        let cooldown = chrono::Duration::from_std(threshold.cooldown).ok()?;

        let mut state = self.state.lock();
        let entry = state.entry(event.event_type.clone()).or_default();

        entry.occurrences.push_back(now);
        while let Some(front) = entry.occurrences.front() {
            if now - *front > window {
                entry.occurrences.pop_front();
            } else {
                break;
            }
        }

        if entry.occurrences.len() < threshold.count {
            return None;
        }

        if let Some(last) = entry.last_fired {
            // Inside the cooldown: suppressed.
            if now - last < cooldown {
                return None;
            }
            // Re-fired shortly after the cooldown ended: escalate.
            let escalation_window = chrono::Duration::milliseconds(
                (threshold.cooldown.as_millis() as f64 * threshold.escalation_multiplier)
                    as i64,
            );
            let level = if now - last < escalation_window {
                entry.last_level.unwrap_or(threshold.level).bump()
            } else {
                threshold.level
            };
            entry.last_fired = Some(now);
            entry.last_level = Some(level);
            return Some(Alert {
                id: Uuid::new_v4(),
                event_type: event.event_type.clone(),
                level,
                observed: entry.occurrences.len(),
                triggered_at: now,
                correlation_id: event.correlation_id.clone(),
            });
        }

        entry.last_fired = Some(now);
        entry.last_level = Some(threshold.level);
        Some(Alert {
            id: Uuid::new_v4(),
            event_type: event.event_type.clone(),
            level: threshold.level,
            observed: entry.occurrences.len(),
            triggered_at: now,
            correlation_id: event.correlation_id.clone(),
        })
    }
}
