//! ACGS-Arbiter: Circuit Breaker
//!
//! Per-dependency three-state breaker. CLOSED counts failures over a
//! sliding window and opens at the threshold; OPEN rejects in O(1) without
//! touching the downstream; after the cooldown, HALF_OPEN admits a bounded
//! number of concurrent probes. All probes succeeding closes the circuit;
//! any probe failing reopens it with an exponentially grown cooldown,
//! capped. State transitions emit security events (WARNING on open, INFO
//! on close).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use acgs_sentinel::{event_types, EventSink, SecurityEvent, SecuritySeverity};

use crate::error::ArbiterError;

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Sliding window over which failures are counted.
    pub failure_window: Duration,
    /// Failures within the window that trip the breaker.
    pub failure_threshold: u32,
    /// Base cooldown before the first probe is allowed.
    pub cooldown: Duration,
    /// Concurrent probes admitted while half-open.
    pub probe_count: u32,
    /// Upper bound on the exponentially grown cooldown.
    pub max_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_window: Duration::from_secs(60),
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            probe_count: 3,
            max_cooldown: Duration::from_secs(300),
        }
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Observable breaker state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub next_probe_at: Option<DateTime<Utc>>,
}

struct Inner {
    state: BreakerState,
    /// Failure instants inside the sliding window (CLOSED only).
    failures: VecDeque<Instant>,
    /// Successful probes while HALF_OPEN.
    probe_successes: u32,
    /// Probes currently in flight while HALF_OPEN.
    probes_in_flight: u32,
    /// Consecutive reopenings; drives cooldown growth.
    reopen_count: u32,
    opened_at_mono: Option<Instant>,
    opened_at: Option<DateTime<Utc>>,
    next_probe_at_mono: Option<Instant>,
    next_probe_at: Option<DateTime<Utc>>,
}

/// Per-dependency circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    short_circuited_total: AtomicU64,
    events: Arc<dyn EventSink>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                probe_successes: 0,
                probes_in_flight: 0,
                reopen_count: 0,
                opened_at_mono: None,
                opened_at: None,
                next_probe_at_mono: None,
                next_probe_at: None,
            }),
            short_circuited_total: AtomicU64::new(0),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Calls rejected without reaching the downstream.
    pub fn short_circuited_total(&self) -> u64 {
        self.short_circuited_total.load(Ordering::Relaxed)
    }

    /// Admission check. An `Ok` guard must be completed with
    /// [`CallGuard::success`] or [`CallGuard::failure`]; dropping it
    /// un-reported releases the probe slot without counting an outcome
    /// (cancelled call).
    pub fn try_acquire(self: &Arc<Self>) -> Result<CallGuard, ArbiterError> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(CallGuard::new(Arc::clone(self), false)),
            BreakerState::Open => {
                let due = inner
                    .next_probe_at_mono
                    .map(|t| Instant::now() >= t)
                    .unwrap_or(true);
                if due {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_successes = 0;
                    inner.probes_in_flight = 1;
                    tracing::info!(breaker = %self.name, "half-open, probing");
                    Ok(CallGuard::new(Arc::clone(self), true))
                } else {
                    drop(inner);
                    self.short_circuited_total.fetch_add(1, Ordering::Relaxed);
                    Err(ArbiterError::DependencyOpen(self.name.clone()))
                }
            }
            BreakerState::HalfOpen => {
                if inner.probes_in_flight < self.config.probe_count {
                    inner.probes_in_flight += 1;
                    Ok(CallGuard::new(Arc::clone(self), true))
                } else {
                    drop(inner);
                    self.short_circuited_total.fetch_add(1, Ordering::Relaxed);
                    Err(ArbiterError::DependencyOpen(self.name.clone()))
                }
            }
        }
    }

    /// Convenience wrapper: admission, await, outcome recording. The
    /// downstream error is returned untouched.
    pub async fn call<T, E, F>(self: &Arc<Self>, fut: F) -> Result<Result<T, E>, ArbiterError>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        let guard = self.try_acquire()?;
        let result = fut.await;
        match &result {
            Ok(_) => guard.success(),
            Err(_) => guard.failure(),
        }
        Ok(result)
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failures.len() as u32,
            success_count: inner.probe_successes,
            opened_at: inner.opened_at,
            next_probe_at: inner.next_probe_at,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    fn record_success(&self, probe: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                Self::prune(&mut inner.failures, self.config.failure_window);
            }
            BreakerState::HalfOpen => {
                if probe {
                    inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                }
                inner.probe_successes += 1;
                if inner.probe_successes >= self.config.probe_count {
                    inner.state = BreakerState::Closed;
                    inner.failures.clear();
                    inner.reopen_count = 0;
                    inner.opened_at = None;
                    inner.opened_at_mono = None;
                    inner.next_probe_at = None;
                    inner.next_probe_at_mono = None;
                    drop(inner);
                    tracing::info!(breaker = %self.name, "circuit closed");
                    self.events.emit(
                        SecurityEvent::new(
                            event_types::CIRCUIT_BREAKER_CLOSED,
                            SecuritySeverity::Info,
                            format!("circuit breaker {} closed after successful probes", self.name),
                            self.name.clone(),
                        ),
                    );
                }
            }
            BreakerState::Open => {}
        }
    }

    fn record_failure(&self, probe: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.failures.push_back(Instant::now());
                Self::prune(&mut inner.failures, self.config.failure_window);
                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    self.open(&mut inner);
                }
            }
            BreakerState::HalfOpen => {
                if probe {
                    inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                }
                inner.reopen_count += 1;
                self.open(&mut inner);
            }
            BreakerState::Open => {}
        }
    }

    fn release_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
    }

    /// Transition to OPEN with an exponentially grown cooldown. The sink
    /// is O(1) so emitting under the lock is safe.
    fn open(&self, inner: &mut parking_lot::MutexGuard<'_, Inner>) {
        let factor = 2u32.saturating_pow(inner.reopen_count.min(16));
        let cooldown = self
            .config
            .cooldown
            .saturating_mul(factor)
            .min(self.config.max_cooldown);

        let now_mono = Instant::now();
        let now = Utc::now();
        inner.state = BreakerState::Open;
        inner.failures.clear();
        inner.probe_successes = 0;
        inner.probes_in_flight = 0;
        inner.opened_at_mono = Some(now_mono);
        inner.opened_at = Some(now);
        inner.next_probe_at_mono = Some(now_mono + cooldown);
        inner.next_probe_at =
            Some(now + chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::seconds(30)));

        tracing::warn!(breaker = %self.name, cooldown_ms = cooldown.as_millis() as u64, "circuit opened");
        self.events.emit(
            SecurityEvent::new(
                event_types::CIRCUIT_BREAKER_OPEN,
                SecuritySeverity::Warning,
                format!("circuit breaker {} opened", self.name),
                self.name.clone(),
            )
            .with_metadata("cooldown_ms", serde_json::json!(cooldown.as_millis() as u64)),
        );
    }

    fn prune(failures: &mut VecDeque<Instant>, window: Duration) {
        let cutoff = Instant::now().checked_sub(window);
        if let Some(cutoff) = cutoff {
            while let Some(front) = failures.front() {
                if *front < cutoff {
                    failures.pop_front();
                } else {
                    break;
                }
            }
        }
    }
}

/// Outcome reporter for one admitted call.
pub struct CallGuard {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    completed: bool,
}

impl std::fmt::Debug for CallGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallGuard")
            .field("probe", &self.probe)
            .field("completed", &self.completed)
            .finish()
    }
}

impl CallGuard {
    fn new(breaker: Arc<CircuitBreaker>, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            completed: false,
        }
    }

    /// The downstream call succeeded.
    pub fn success(mut self) {
        self.completed = true;
        self.breaker.record_success(self.probe);
    }

    /// The downstream call failed.
    pub fn failure(mut self) {
        self.completed = true;
        self.breaker.record_failure(self.probe);
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if !self.completed && self.probe {
            self.breaker.release_probe();
        }
    }
}

/// Named breakers, one per dependency.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: BreakerConfig,
    events: Arc<dyn EventSink>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
            events,
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(name) {
            return Arc::clone(&breaker);
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    name,
                    self.config.clone(),
                    Arc::clone(&self.events),
                ))
            })
            .clone()
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.iter().map(|b| b.snapshot()).collect()
    }
}
