//! Execution pipeline
//!
//! [`ExecutionPipeline::dispatch`] is the single entry point for running a
//! capability. Around each call it applies:
//! - Per-category rate limiting ([`RateLimiter`])
//! - Result caching keyed by input fingerprint ([`ResultCache`])
//! - Retries with exponential backoff ([`RetryPolicy`])
//! - A deadline covering the whole call, backoff waits included
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tessera_core::capability::{builtin, CapabilityRegistry};
//! use tessera_core::config::PipelineConfig;
//! use tessera_core::pipeline::{ExecutionPipeline, InvocationRequest};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(CapabilityRegistry::new());
//! registry.register("echo", builtin::echo_factory()).await?;
//!
//! let pipeline = ExecutionPipeline::new(PipelineConfig::default(), registry)?;
//! let request = InvocationRequest::from_json("echo", serde_json::json!({"msg": "hi"}))?;
//! let result = pipeline.dispatch(request).await?;
//! assert!(result.success);
//! # Ok(())
//! # }
//! ```

mod cache;
mod dispatch;
mod error;
mod rate_limit;
mod request;
mod result;
mod retry;

pub use cache::{CacheConfig, CachedResult, Fingerprint, InMemoryResultCache, ResultCache};
pub use dispatch::{ExecutionPipeline, PipelineBuilder};
pub use error::DispatchError;
pub use rate_limit::{Budget, PrefixRule, RateLimitConfig, RateLimiter, GENERAL_CATEGORY};
pub use request::InvocationRequest;
pub use result::{ExecutionFailure, ExecutionResult, FailureKind};
pub use retry::RetryPolicy;

use std::time::Duration;
use tokio::time::Instant;

/// Spans past this are treated as "never" (about 30 years)
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + span`, clamped so very large spans cannot overflow
pub(crate) fn instant_after(start: Instant, span: Duration) -> Instant {
    start.checked_add(span.min(FAR_FUTURE)).unwrap_or(start)
}
