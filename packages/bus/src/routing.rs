//! ACGS-Bus: Adaptive Router
//!
//! Maps an impact score to the fast or deliberation lane. The threshold
//! is a single atomic cell written by the feedback path and read with
//! relaxed ordering on the hot path. Ties and NaN scores route to the
//! deliberation lane (fail safe).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// The two lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RouteLane {
    Fast,
    Deliberate,
}

/// Router tuning.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub initial_threshold: f64,
    pub bounds: (f64, f64),
    /// Exponential smoothing factor for feedback adaptation.
    pub alpha: f64,
    /// Feedback window size.
    pub window: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            initial_threshold: 0.8,
            bounds: (0.5, 0.95),
            alpha: 0.1,
            window: 100,
        }
    }
}

/// Human-confirmed outcome of a deliberated decision.
#[derive(Debug, Clone, Copy)]
pub struct DeliberationFeedback {
    /// The impact score the message was routed with.
    pub score: f64,
    /// Whether deliberation confirmed the message as genuinely harmful
    /// (denied) rather than a false positive.
    pub confirmed_harmful: bool,
}

/// Score-threshold router with feedback-driven threshold adaptation.
pub struct AdaptiveRouter {
    threshold_bits: AtomicU64,
    config: RouterConfig,
    window: Mutex<VecDeque<DeliberationFeedback>>,
}

impl AdaptiveRouter {
    pub fn new(config: RouterConfig) -> Self {
        let initial = config
            .initial_threshold
            .clamp(config.bounds.0, config.bounds.1);
        Self {
            threshold_bits: AtomicU64::new(initial.to_bits()),
            config,
            window: Mutex::new(VecDeque::new()),
        }
    }

    /// Current threshold.
    pub fn threshold(&self) -> f64 {
        f64::from_bits(self.threshold_bits.load(Ordering::Relaxed))
    }

    /// Route by score. `score >= threshold` (including equality) and NaN
    /// deliberate.
    pub fn route(&self, score: f64) -> RouteLane {
        if score < self.threshold() {
            RouteLane::Fast
        } else {
            RouteLane::Deliberate
        }
    }

    /// Feed one confirmed deliberation outcome. A confirmed-harmful
    /// message pulls the threshold down toward its score (catch more like
    /// it); a benign deliberation pushes the threshold up past its score
    /// (stop over-deliberating). Movement is smoothed with `alpha` and
    /// clamped to the configured bounds. Single writer by contract.
    pub fn record_feedback(&self, feedback: DeliberationFeedback) {
        if feedback.score.is_nan() {
            return;
        }

        {
            let mut window = self.window.lock();
            window.push_back(feedback);
            while window.len() > self.config.window {
                window.pop_front();
            }
        }

        const MARGIN: f64 = 0.05;
        let (lo, hi) = self.config.bounds;
        let target = if feedback.confirmed_harmful {
            feedback.score - MARGIN
        } else {
            feedback.score + MARGIN
        }
        .clamp(lo, hi);

        let current = self.threshold();
        let next = ((1.0 - self.config.alpha) * current + self.config.alpha * target)
            .clamp(lo, hi);
        self.threshold_bits.store(next.to_bits(), Ordering::Relaxed);
        tracing::debug!(threshold = next, "routing threshold adapted");
    }

    /// Number of feedback samples currently windowed.
    pub fn feedback_len(&self) -> usize {
        self.window.lock().len()
    }
}

impl Default for AdaptiveRouter {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}
