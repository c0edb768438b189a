//! Logical clock for per-row change timestamps.
//!
//! Every write recorded by a tracking store takes a fresh value from the
//! replica's clock, so a row's timestamp strictly increases with each write
//! at its origin. Watermarks are values of this clock, never wall-clock time.

use crate::Timestamp;
use serde::{Deserialize, Serialize};

/// A monotonically increasing counter owned by one replica.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalClock {
    /// Last value handed out; 0 means nothing was written yet
    counter: Timestamp,
}

impl LogicalClock {
    /// Create a new clock starting at 0.
    pub fn new() -> Self {
        Self { counter: 0 }
    }

    /// Create a clock with a specific counter value.
    pub fn with_counter(counter: Timestamp) -> Self {
        Self { counter }
    }

    /// Advance the clock and return the new value.
    pub fn tick(&mut self) -> Timestamp {
        self.counter += 1;
        self.counter
    }

    /// The last value handed out.
    ///
    /// Captured before changes are read, this becomes the next watermark.
    pub fn current(&self) -> Timestamp {
        self.counter
    }

    /// Move the clock forward to at least `other`.
    pub fn observe(&mut self, other: Timestamp) {
        self.counter = self.counter.max(other);
    }
}
