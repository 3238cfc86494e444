//! Observability sinks
//!
//! The pipeline reports one [`MetricsEvent`] per completed dispatch and,
//! when an audit sink is attached, one [`AuditEntry`]. Neither sink may
//! block or fail a dispatch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::pipeline::FailureKind;

/// Summary of one completed dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsEvent {
    pub capability: String,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub success: bool,
    pub cache_hit: bool,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

/// Receiver of dispatch metrics
///
/// `emit` is called inline on the dispatch path and must not block.
pub trait MetricsSink: Send + Sync {
    fn emit(&self, event: MetricsEvent);
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn emit(&self, _event: MetricsEvent) {}
}

/// Logs every event at debug level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn emit(&self, event: MetricsEvent) {
        debug!(
            capability = %event.capability,
            duration_ms = event.duration.as_millis() as u64,
            success = event.success,
            cache_hit = event.cache_hit,
            attempts = event.attempts,
            "Dispatch completed"
        );
    }
}

/// Forwards events over a bounded channel, dropping them when it is full
#[derive(Debug)]
pub struct ChannelMetricsSink {
    sender: mpsc::Sender<MetricsEvent>,
    dropped: AtomicU64,
}

impl ChannelMetricsSink {
    /// Create a sink and the receiving half of its channel
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<MetricsEvent>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (
            Self {
                sender,
                dropped: AtomicU64::new(0),
            },
            receiver,
        )
    }

    /// Events lost to a full or closed channel
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl MetricsSink for ChannelMetricsSink {
    fn emit(&self, event: MetricsEvent) {
        if let Err(e) = self.sender.try_send(event) {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            // Only the first drop is worth a warning
            if total == 1 {
                warn!(error = %e, "Dropping metrics event");
            }
        }
    }
}

/// Audit trail entry for one completed dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub request_id: Uuid,
    pub capability: String,
    pub trace_id: Option<String>,
    pub agent_id: Option<String>,
    /// Fingerprint of the capability name and input
    pub fingerprint: String,
    pub success: bool,
    pub failure: Option<FailureKind>,
    pub attempts: u32,
    pub cache_hit: bool,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
}

/// Receiver of audit entries
///
/// Entries are delivered from a spawned task; a slow sink delays nothing.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry);
}

/// Keeps every entry in memory
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries received so far, in arrival order
    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, entry: AuditEntry) {
        self.entries.lock().await.push(entry);
    }
}
