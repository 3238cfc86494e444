use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::trace;

use super::record::ExecutionRecord;
use super::stats::PerformanceStats;

struct CapabilityHistory {
    window: VecDeque<ExecutionRecord>,
    total_duration_nanos: u128,
    stats: PerformanceStats,
}

impl CapabilityHistory {
    fn new(capability: &str, capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            total_duration_nanos: 0,
            stats: PerformanceStats::empty(capability),
        }
    }

    fn push(&mut self, record: ExecutionRecord, capacity: usize) {
        let stats = &mut self.stats;
        stats.total_executions += 1;
        if record.success {
            stats.total_successes += 1;
        } else {
            stats.total_failures += 1;
        }
        self.total_duration_nanos += record.duration.as_nanos();
        let average = self.total_duration_nanos / u128::from(stats.total_executions);
        stats.average_duration = Duration::from_nanos(u64::try_from(average).unwrap_or(u64::MAX));

        self.window.push_back(record);
        while self.window.len() > capacity {
            self.window.pop_front();
        }

        self.stats.refresh_window(&self.window);
    }
}

/// Bounded per-capability execution history
///
/// Each capability keeps the most recent `capacity` records and a stats
/// summary recomputed on every append. Appends for different capabilities
/// never contend on the same lock.
pub struct ExecutionHistoryTracker {
    capacity: usize,
    histories: RwLock<HashMap<String, Arc<Mutex<CapabilityHistory>>>>,
}

impl Default for ExecutionHistoryTracker {
    fn default() -> Self {
        Self::new(super::DEFAULT_WINDOW_CAPACITY)
    }
}

impl std::fmt::Debug for ExecutionHistoryTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHistoryTracker")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl ExecutionHistoryTracker {
    /// Create a tracker retaining `capacity` records per capability
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            histories: RwLock::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn history(&self, capability: &str) -> Option<Arc<Mutex<CapabilityHistory>>> {
        self.histories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(capability)
            .cloned()
    }

    fn history_or_insert(&self, capability: &str) -> Arc<Mutex<CapabilityHistory>> {
        if let Some(history) = self.history(capability) {
            return history;
        }
        let mut histories = self.histories.write().unwrap_or_else(PoisonError::into_inner);
        histories
            .entry(capability.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CapabilityHistory::new(capability, self.capacity))))
            .clone()
    }

    /// Append a completed execution
    pub fn record(&self, capability: &str, record: ExecutionRecord) {
        let history = self.history_or_insert(capability);
        let mut history = history.lock().unwrap_or_else(PoisonError::into_inner);
        history.push(record, self.capacity);
        trace!(
            capability,
            window = history.window.len(),
            total = history.stats.total_executions,
            "Recorded execution"
        );
    }

    /// Current stats; zeroed for capabilities never recorded
    pub fn snapshot(&self, capability: &str) -> PerformanceStats {
        match self.history(capability) {
            Some(history) => history
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .stats
                .clone(),
            None => PerformanceStats::empty(capability),
        }
    }

    /// Stats for every capability with at least one record
    pub fn snapshot_all(&self) -> BTreeMap<String, PerformanceStats> {
        let histories: Vec<(String, Arc<Mutex<CapabilityHistory>>)> = self
            .histories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, history)| (name.clone(), history.clone()))
            .collect();

        histories
            .into_iter()
            .filter_map(|(name, history)| {
                let stats = history
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .stats
                    .clone();
                (stats.total_executions > 0).then_some((name, stats))
            })
            .collect()
    }

    /// Retained records, oldest first
    pub fn records(&self, capability: &str) -> Vec<ExecutionRecord> {
        self.history(capability)
            .map(|history| {
                history
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .window
                    .iter()
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Forget a capability's history; returns whether any existed
    ///
    /// The window is cleared under the capability's own lock, so a
    /// concurrent `record` lands either before the reset or after it.
    pub fn reset(&self, capability: &str) -> bool {
        let Some(history) = self.history(capability) else {
            return false;
        };
        let mut history = history.lock().unwrap_or_else(PoisonError::into_inner);
        let had_records = history.stats.total_executions > 0;
        *history = CapabilityHistory::new(capability, self.capacity);
        had_records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_record_racing_reset_is_kept() {
        let tracker = ExecutionHistoryTracker::new(10);
        tracker.record("lint", ExecutionRecord::new(Utc::now(), Duration::from_millis(5), true));

        // A record that resolved its history before the reset ran
        let in_flight = tracker.history_or_insert("lint");
        assert!(tracker.reset("lint"));
        in_flight
            .lock()
            .unwrap()
            .push(ExecutionRecord::new(Utc::now(), Duration::from_millis(7), true), 10);

        let stats = tracker.snapshot("lint");
        assert_eq!(stats.total_executions, 1);
        assert_eq!(stats.average_duration, Duration::from_millis(7));
        assert_eq!(tracker.records("lint").len(), 1);
    }
}
