//! ACGS-Arbiter: Error Types

use thiserror::Error;

/// Errors produced by the fault-isolation layer.
#[derive(Debug, Error, Clone)]
pub enum ArbiterError {
    /// The named dependency's circuit breaker is open; the call never
    /// reached the downstream.
    #[error("dependency {0} is open")]
    DependencyOpen(String),

    /// The deliberation queue refused the submission (occupancy > 90%).
    #[error("deliberation queue full ({occupancy}/{capacity})")]
    QueueFull { occupancy: usize, capacity: usize },

    /// A parked deliberation exceeded its human-decision deadline.
    #[error("deliberation timed out after {waited_ms}ms")]
    DeliberationTimeout { waited_ms: u64 },

    /// The deliberation worker pool has shut down.
    #[error("deliberation queue is stopped")]
    QueueStopped,
}
