use super::*;
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;

fn at(seconds: i64) -> chrono::DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
}

fn ok(seconds: i64, millis: u64) -> ExecutionRecord {
    ExecutionRecord::new(at(seconds), Duration::from_millis(millis), true)
}

fn failed(seconds: i64, millis: u64) -> ExecutionRecord {
    ExecutionRecord::new(at(seconds), Duration::from_millis(millis), false)
}

#[test]
fn test_unknown_capability_is_zeroed() {
    let tracker = ExecutionHistoryTracker::default();
    let stats = tracker.snapshot("never_called");

    assert_eq!(stats.capability, "never_called");
    assert_eq!(stats.total_executions, 0);
    assert_eq!(stats.window_size, 0);
    assert!(stats.last_execution_at.is_none());
    assert!(tracker.records("never_called").is_empty());
}

#[test]
fn test_single_record_has_no_window_stats() {
    let tracker = ExecutionHistoryTracker::default();
    tracker.record("lint", ok(0, 40));

    let stats = tracker.snapshot("lint");
    assert_eq!(stats.total_executions, 1);
    assert_eq!(stats.total_successes, 1);
    assert_eq!(stats.average_duration, Duration::from_millis(40));
    assert_eq!(stats.window_size, 1);
    assert_eq!(stats.p50_duration, Duration::ZERO);
    assert_eq!(stats.max_duration, Duration::ZERO);
    assert_eq!(stats.success_rate, 0.0);
    assert_eq!(stats.throughput_per_minute, 0.0);
    assert!(stats.last_execution_at.is_some());
}

#[test]
fn test_percentiles_use_floor_index() {
    let tracker = ExecutionHistoryTracker::default();
    // Recorded out of order on purpose
    for millis in [70, 10, 100, 40, 20, 90, 30, 60, 50, 80] {
        tracker.record("format", ok(0, millis));
    }

    let stats = tracker.snapshot("format");
    assert_eq!(stats.window_size, 10);
    assert_eq!(stats.min_duration, Duration::from_millis(10));
    assert_eq!(stats.max_duration, Duration::from_millis(100));
    assert_eq!(stats.p50_duration, Duration::from_millis(60));
    assert_eq!(stats.p95_duration, Duration::from_millis(100));
    assert_eq!(stats.p99_duration, Duration::from_millis(100));
    assert_eq!(stats.average_duration, Duration::from_millis(55));
}

#[test]
fn test_window_evicts_oldest() {
    let tracker = ExecutionHistoryTracker::new(100);
    for i in 0..101 {
        tracker.record("scan", ok(i, (i as u64 + 1) * 10));
    }

    let records = tracker.records("scan");
    assert_eq!(records.len(), 100);
    assert_eq!(records[0].duration, Duration::from_millis(20));
    assert_eq!(records[99].duration, Duration::from_millis(1010));

    let stats = tracker.snapshot("scan");
    assert_eq!(stats.total_executions, 101);
    assert_eq!(stats.window_size, 100);
    assert_eq!(stats.min_duration, Duration::from_millis(20));
}

#[test]
fn test_success_rate_and_totals() {
    let tracker = ExecutionHistoryTracker::default();
    tracker.record("deploy", ok(0, 10));
    tracker.record("deploy", failed(1, 10));
    tracker.record("deploy", ok(2, 10));
    tracker.record("deploy", failed(3, 10));

    let stats = tracker.snapshot("deploy");
    assert_eq!(stats.total_successes, 2);
    assert_eq!(stats.total_failures, 2);
    assert_eq!(stats.success_rate, 0.5);
}

#[test]
fn test_throughput_over_window_span() {
    let tracker = ExecutionHistoryTracker::default();
    tracker.record("ping", ok(0, 0));
    tracker.record("ping", ok(30, 0));
    tracker.record("ping", ok(60, 0));

    let stats = tracker.snapshot("ping");
    assert!((stats.throughput_per_minute - 3.0).abs() < 1e-9);
}

#[test]
fn test_cache_hits_and_attempts() {
    let tracker = ExecutionHistoryTracker::default();
    tracker.record("fetch", ok(0, 5).with_attempts(3));
    tracker.record("fetch", ok(1, 0).with_attempts(0).with_cache_hit(true));

    let stats = tracker.snapshot("fetch");
    assert_eq!(stats.cache_hit_rate, 0.5);
    assert_eq!(stats.average_attempts, 1.5);
}

#[test]
fn test_capabilities_are_isolated_and_resettable() {
    let tracker = ExecutionHistoryTracker::default();
    tracker.record("a", ok(0, 1));
    tracker.record("a", ok(1, 1));
    tracker.record("b", failed(0, 1));

    let all = tracker.snapshot_all();
    assert_eq!(all.len(), 2);
    assert_eq!(all["a"].total_executions, 2);
    assert_eq!(all["b"].total_failures, 1);

    assert!(tracker.reset("a"));
    assert!(!tracker.reset("a"));
    assert_eq!(tracker.snapshot("a").total_executions, 0);
    assert_eq!(tracker.snapshot("b").total_executions, 1);
    assert_eq!(tracker.snapshot_all().len(), 1);

    tracker.record("a", ok(2, 1));
    assert_eq!(tracker.snapshot("a").total_executions, 1);
    assert_eq!(tracker.records("a").len(), 1);
}

#[test]
fn test_concurrent_recording() {
    let tracker = Arc::new(ExecutionHistoryTracker::new(10));

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let tracker = tracker.clone();
            std::thread::spawn(move || {
                for i in 0..50 {
                    let name = if t % 2 == 0 { "even" } else { "odd" };
                    tracker.record(name, ok(i, 1));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(tracker.snapshot("even").total_executions, 200);
    assert_eq!(tracker.snapshot("odd").total_executions, 200);
    assert_eq!(tracker.records("even").len(), 10);
}

#[test]
fn test_zero_capacity_is_clamped() {
    let tracker = ExecutionHistoryTracker::new(0);
    assert_eq!(tracker.capacity(), 1);
    tracker.record("x", ok(0, 1));
    tracker.record("x", ok(1, 2));
    assert_eq!(tracker.records("x").len(), 1);
}
