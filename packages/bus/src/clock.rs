//! ACGS-Bus: Correlation ID Provider
//!
//! Mints the correlation ids that thread related messages together.
//! Wall and monotonic time are read at the point of use (`Utc::now`,
//! `Instant::now`), the way the rest of the tree does.

use uuid::Uuid;

/// Correlation-id source held by the bus facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct Clock;

impl Clock {
    pub fn new() -> Self {
        Self
    }

    /// Mint a correlation id.
    pub fn correlation_id(&self) -> Uuid {
        Uuid::new_v4()
    }
}
