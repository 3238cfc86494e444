//! # Tessera - Capability Execution Core
//!
//! Tessera runs pluggable capabilities ("tools") on behalf of agents with:
//! - Lazily constructed singleton instances per registered capability
//! - Per-category, non-blocking rate limiting
//! - Result caching keyed by a fingerprint of the capability input
//! - Retries with exponential backoff, bounded by a per-call deadline
//! - Rolling execution history with latency percentiles and throughput
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tessera_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let registry = Arc::new(CapabilityRegistry::new());
//!     for (name, factory) in builtin::all() {
//!         registry.register(name, factory).await?;
//!     }
//!
//!     let pipeline = ExecutionPipeline::new(PipelineConfig::default(), registry)?;
//!     let request = InvocationRequest::from_json("echo", serde_json::json!({"msg": "hi"}))?;
//!     let result = pipeline.dispatch(request).await?;
//!
//!     println!("{:?}", result.output);
//!     println!("{:?}", pipeline.stats("echo"));
//!     Ok(())
//! }
//! ```

pub mod capability;
pub mod config;
pub mod error;
pub mod history;
pub mod pipeline;
pub mod sink;

pub use error::{Result, TesseraError};

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::capability::{
        builtin, factory_fn, BoxedCapability, Capability, CapabilityFactory, CapabilityInput,
        CapabilityMetadata, CapabilityRegistry, ErrorKind, HealthStatus, InvocationContext,
        InvocationError, RegistryError,
    };
    pub use crate::config::{PipelineConfig, TesseraConfig};
    pub use crate::error::{Result, TesseraError};
    pub use crate::history::{ExecutionHistoryTracker, ExecutionRecord, PerformanceStats};
    pub use crate::pipeline::{
        Budget, CacheConfig, DispatchError, ExecutionFailure, ExecutionPipeline, ExecutionResult,
        FailureKind, InvocationRequest, RateLimitConfig, RetryPolicy,
    };
    pub use crate::sink::{AuditEntry, AuditSink, MetricsEvent, MetricsSink};
}
