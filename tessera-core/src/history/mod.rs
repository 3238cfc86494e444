//! Execution history and performance statistics
//!
//! Records every completed dispatch per capability in a bounded FIFO window
//! and keeps a [`PerformanceStats`] summary current.

mod record;
mod stats;
mod tracker;

#[cfg(test)]
mod tests;

pub use record::ExecutionRecord;
pub use stats::PerformanceStats;
pub use tracker::ExecutionHistoryTracker;

use serde::{Deserialize, Serialize};

/// Records retained per capability unless configured otherwise
pub const DEFAULT_WINDOW_CAPACITY: usize = 100;

/// History configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Records retained per capability
    pub capacity: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_WINDOW_CAPACITY,
        }
    }
}
