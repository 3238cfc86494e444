use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

use super::record::ExecutionRecord;

/// Performance summary for one capability
///
/// Totals and the average duration cover every execution ever recorded.
/// Percentiles, rates and throughput cover the retained window only and are
/// zero until the window holds at least two records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub capability: String,
    pub total_executions: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    #[serde(with = "humantime_serde")]
    pub average_duration: Duration,

    /// Records currently retained
    pub window_size: usize,
    #[serde(with = "humantime_serde")]
    pub min_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub max_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub p50_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub p95_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub p99_duration: Duration,
    pub success_rate: f64,
    pub throughput_per_minute: f64,
    pub cache_hit_rate: f64,
    pub average_attempts: f64,

    pub last_execution_at: Option<DateTime<Utc>>,
}

impl PerformanceStats {
    /// Stats for a capability with no recorded executions
    pub fn empty(capability: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            total_executions: 0,
            total_successes: 0,
            total_failures: 0,
            average_duration: Duration::ZERO,
            window_size: 0,
            min_duration: Duration::ZERO,
            max_duration: Duration::ZERO,
            p50_duration: Duration::ZERO,
            p95_duration: Duration::ZERO,
            p99_duration: Duration::ZERO,
            success_rate: 0.0,
            throughput_per_minute: 0.0,
            cache_hit_rate: 0.0,
            average_attempts: 0.0,
            last_execution_at: None,
        }
    }

    /// Fill the window-derived fields from `window`
    pub(crate) fn refresh_window(&mut self, window: &VecDeque<ExecutionRecord>) {
        let count = window.len();
        self.window_size = count;
        self.last_execution_at = window.back().map(|r| r.ended_at);

        if count < 2 {
            self.min_duration = Duration::ZERO;
            self.max_duration = Duration::ZERO;
            self.p50_duration = Duration::ZERO;
            self.p95_duration = Duration::ZERO;
            self.p99_duration = Duration::ZERO;
            self.success_rate = 0.0;
            self.throughput_per_minute = 0.0;
            self.cache_hit_rate = 0.0;
            self.average_attempts = 0.0;
            return;
        }

        let mut durations: Vec<Duration> = window.iter().map(|r| r.duration).collect();
        durations.sort();

        self.min_duration = durations[0];
        self.max_duration = durations[count - 1];
        self.p50_duration = percentile(&durations, 0.50);
        self.p95_duration = percentile(&durations, 0.95);
        self.p99_duration = percentile(&durations, 0.99);

        let successes = window.iter().filter(|r| r.success).count();
        let cache_hits = window.iter().filter(|r| r.cache_hit).count();
        let attempts: u64 = window.iter().map(|r| u64::from(r.attempts)).sum();

        self.success_rate = successes as f64 / count as f64;
        self.cache_hit_rate = cache_hits as f64 / count as f64;
        self.average_attempts = attempts as f64 / count as f64;
        self.throughput_per_minute = throughput_per_minute(window);
    }
}

/// Element at index `floor(p * len)` of a sorted slice, clamped to the last
fn percentile(sorted: &[Duration], p: f64) -> Duration {
    let idx = ((sorted.len() as f64) * p).floor() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Executions per minute across the window's wall-clock span
fn throughput_per_minute(window: &VecDeque<ExecutionRecord>) -> f64 {
    let (Some(first), Some(last)) = (window.front(), window.back()) else {
        return 0.0;
    };

    let span_ms = (last.ended_at - first.started_at).num_milliseconds();
    if span_ms <= 0 {
        return 0.0;
    }
    window.len() as f64 / (span_ms as f64 / 60_000.0)
}
