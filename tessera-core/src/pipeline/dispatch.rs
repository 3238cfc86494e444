//! The dispatch pipeline: admission, caching, the attempt loop and bookkeeping
//!
//! Every call ends in history and the metrics sink, whether it succeeded,
//! failed, hit the cache or ran out of time.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::cache::{Fingerprint, InMemoryResultCache, ResultCache};
use super::error::DispatchError;
use super::rate_limit::RateLimiter;
use super::request::InvocationRequest;
use super::result::{ExecutionFailure, ExecutionResult};
use super::retry::RetryPolicy;
use super::instant_after;
use crate::capability::{
    panic_message, BoxedCapability, CapabilityDescription, CapabilityFactory, CapabilityRegistry,
    HealthStatus, InvocationContext, InvocationError, RegistryError,
};
use crate::config::PipelineConfig;
use crate::history::{ExecutionHistoryTracker, ExecutionRecord, PerformanceStats};
use crate::sink::{AuditEntry, AuditSink, MetricsEvent, MetricsSink, TracingMetricsSink};

/// What the attempt loop produced
struct Outcome {
    result: Result<Value, ExecutionFailure>,
    attempts: u32,
}

impl Outcome {
    fn failed(failure: ExecutionFailure, attempts: u32) -> Self {
        Self {
            result: Err(failure),
            attempts,
        }
    }
}

/// Bookkeeping carried from admission to completion
struct DispatchMeta {
    request_id: Uuid,
    fingerprint: Fingerprint,
    started_at: DateTime<Utc>,
    start: Instant,
    cache_hit: bool,
    store_result: bool,
}

/// Builder for [`ExecutionPipeline`]
pub struct PipelineBuilder {
    config: PipelineConfig,
    registry: Option<Arc<CapabilityRegistry>>,
    cache: Option<Arc<dyn ResultCache>>,
    history: Option<Arc<ExecutionHistoryTracker>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl PipelineBuilder {
    /// Start from `config` with default collaborators
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            registry: None,
            cache: None,
            history: None,
            metrics: None,
            audit: None,
        }
    }

    /// Use an existing registry; a fresh one is created otherwise
    pub fn registry(mut self, registry: Arc<CapabilityRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replace the in-memory result cache
    pub fn cache(mut self, cache: Arc<dyn ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Share a history tracker
    pub fn history(mut self, history: Arc<ExecutionHistoryTracker>) -> Self {
        self.history = Some(history);
        self
    }

    /// Replace the default tracing metrics sink
    pub fn metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    /// Attach an audit sink
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Validate the configuration and build the pipeline
    pub fn build(self) -> crate::Result<ExecutionPipeline> {
        self.config.validate()?;

        let config = self.config;
        Ok(ExecutionPipeline {
            registry: self.registry.unwrap_or_default(),
            rate_limiter: RateLimiter::new(&config.rate_limits),
            cache: self
                .cache
                .unwrap_or_else(|| Arc::new(InMemoryResultCache::new(config.cache.max_entries))),
            history: self
                .history
                .unwrap_or_else(|| Arc::new(ExecutionHistoryTracker::new(config.history.capacity))),
            metrics: self.metrics.unwrap_or_else(|| Arc::new(TracingMetricsSink)),
            audit: self.audit,
            concurrency: config.max_concurrent.map(|n| Arc::new(Semaphore::new(n))),
            shutting_down: AtomicBool::new(false),
            config,
        })
    }
}

/// Runs capability calls with rate limiting, caching, retries and deadlines
///
/// Each dispatch goes through, in order: rate-limit admission, cache lookup,
/// the attempt loop (bounded by the deadline, with exponential backoff for
/// retryable errors), history recording, cache write and metrics emission.
pub struct ExecutionPipeline {
    config: PipelineConfig,
    registry: Arc<CapabilityRegistry>,
    rate_limiter: RateLimiter,
    cache: Arc<dyn ResultCache>,
    history: Arc<ExecutionHistoryTracker>,
    metrics: Arc<dyn MetricsSink>,
    audit: Option<Arc<dyn AuditSink>>,
    concurrency: Option<Arc<Semaphore>>,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for ExecutionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPipeline")
            .field("config", &self.config)
            .field("shutting_down", &self.shutting_down.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ExecutionPipeline {
    /// Builder for swapping in a custom cache, tracker or sinks
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// Pipeline over `registry` with the default cache and sinks
    pub fn new(config: PipelineConfig, registry: Arc<CapabilityRegistry>) -> crate::Result<Self> {
        Self::builder(config).registry(registry).build()
    }

    /// Effective pipeline configuration
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Registry the pipeline resolves capabilities from
    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Rate limiter shared by all dispatches
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Execution history backing [`ExecutionPipeline::stats`]
    pub fn history(&self) -> &Arc<ExecutionHistoryTracker> {
        &self.history
    }

    /// Register a capability factory with the underlying registry
    pub async fn register(
        &self,
        name: impl Into<String>,
        factory: Arc<dyn CapabilityFactory>,
    ) -> Result<(), RegistryError> {
        self.registry.register(name, factory).await
    }

    /// Execute one capability call
    ///
    /// Returns `Err` only when the call was refused before execution (bad
    /// arguments, rate limiting, unknown or unconstructible capability,
    /// shutdown). Everything else, including deadline expiry, comes back as
    /// an [`ExecutionResult`] and is recorded in history.
    pub async fn dispatch(&self, request: InvocationRequest) -> Result<ExecutionResult, DispatchError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(DispatchError::ShuttingDown);
        }
        request.validate()?;

        let request_id = Uuid::new_v4();
        let span = info_span!(
            "dispatch",
            capability = %request.capability,
            request_id = %request_id,
            trace_id = request.trace_id.as_deref().unwrap_or("")
        );
        self.dispatch_inner(request, request_id).instrument(span).await
    }

    async fn dispatch_inner(
        &self,
        request: InvocationRequest,
        request_id: Uuid,
    ) -> Result<ExecutionResult, DispatchError> {
        let name = request.capability.as_str();

        let category = self.rate_limiter.category_for(name);
        if !self.rate_limiter.admit(category, request.cost) {
            let retry_after = self.rate_limiter.retry_after(category);
            warn!(
                category,
                retry_after_ms = retry_after.as_millis() as u64,
                "Dispatch rejected by rate limiter"
            );
            return Err(DispatchError::RateLimited {
                capability: name.to_string(),
                category: category.to_string(),
                retry_after,
            });
        }

        let started_at = Utc::now();
        let start = Instant::now();
        let fingerprint = Fingerprint::compute(name, &request.input);
        let use_cache = self.config.cache.enabled
            && request.cache.unwrap_or(self.config.cache.default_for_requests);

        if use_cache {
            if let Some(hit) = self.cache.get(&fingerprint).await {
                debug!(fingerprint = %fingerprint, "Cache hit");
                let meta = DispatchMeta {
                    request_id,
                    fingerprint,
                    started_at,
                    start,
                    cache_hit: true,
                    store_result: false,
                };
                let outcome = Outcome {
                    result: Ok(hit.output),
                    attempts: 0,
                };
                return Ok(self.complete(&request, meta, outcome).await);
            }
        }

        let policy = request
            .retry_policy
            .clone()
            .unwrap_or_else(|| self.config.default_retry.clone());
        let deadline = instant_after(start, request.timeout.unwrap_or(self.config.default_timeout));
        let cancellation = request
            .cancellation
            .clone()
            .unwrap_or_else(CancellationToken::new);

        let outcome = self
            .execute(&request, request_id, &policy, deadline, &cancellation)
            .await?;

        let meta = DispatchMeta {
            request_id,
            fingerprint,
            started_at,
            start,
            cache_hit: false,
            store_result: use_cache,
        };
        Ok(self.complete(&request, meta, outcome).await)
    }

    /// Construct the capability and run the attempt loop
    async fn execute(
        &self,
        request: &InvocationRequest,
        request_id: Uuid,
        policy: &RetryPolicy,
        deadline: Instant,
        cancellation: &CancellationToken,
    ) -> Result<Outcome, DispatchError> {
        let name = request.capability.as_str();
        let config = self
            .config
            .capabilities
            .get(name)
            .cloned()
            .unwrap_or(Value::Null);

        let capability: BoxedCapability = tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                return Ok(Outcome::failed(ExecutionFailure::cancelled(), 0));
            }
            created = timeout_at(deadline, self.registry.get_or_create(name, &config)) => match created {
                Ok(created) => created?,
                Err(_) => {
                    return Ok(Outcome::failed(
                        ExecutionFailure::deadline_exceeded("deadline expired while constructing the capability"),
                        0,
                    ));
                }
            },
        };

        let mut attempts = 0u32;
        let mut last_error: Option<InvocationError> = None;

        loop {
            if Instant::now() >= deadline {
                return Ok(Outcome::failed(
                    deadline_failure(attempts, last_error.as_ref()),
                    attempts,
                ));
            }

            let permit = match &self.concurrency {
                None => None,
                Some(semaphore) => tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => {
                        return Ok(Outcome::failed(ExecutionFailure::cancelled(), attempts));
                    }
                    acquired = timeout_at(deadline, Arc::clone(semaphore).acquire_owned()) => match acquired {
                        Ok(Ok(permit)) => Some(permit),
                        Ok(Err(_)) => return Err(DispatchError::ShuttingDown),
                        Err(_) => {
                            return Ok(Outcome::failed(
                                deadline_failure(attempts, last_error.as_ref()),
                                attempts,
                            ));
                        }
                    },
                },
            };

            attempts += 1;
            let ctx = InvocationContext {
                deadline,
                attempt: attempts,
                request_id,
                trace_id: request.trace_id.clone(),
                agent_id: request.agent_id.clone(),
                cancellation: cancellation.clone(),
            };
            debug!(attempt = attempts, "Invoking capability");

            let invocation = AssertUnwindSafe(capability.invoke(&request.input, &ctx)).catch_unwind();
            let finished = tokio::select! {
                biased;
                _ = cancellation.cancelled() => {
                    return Ok(Outcome::failed(ExecutionFailure::cancelled(), attempts));
                }
                finished = timeout_at(deadline, invocation) => finished,
            };
            drop(permit);

            let error = match finished {
                Ok(Ok(Ok(value))) => {
                    return Ok(Outcome {
                        result: Ok(value),
                        attempts,
                    });
                }
                Ok(Ok(Err(error))) => error,
                Ok(Err(payload)) => {
                    let message = panic_message(&*payload);
                    error!(attempt = attempts, panic = %message, "Capability panicked");
                    return Ok(Outcome::failed(ExecutionFailure::panicked(message), attempts));
                }
                Err(_) => {
                    return Ok(Outcome::failed(
                        deadline_failure(attempts, last_error.as_ref()),
                        attempts,
                    ));
                }
            };

            if !error.is_retryable() {
                debug!(attempt = attempts, error = %error, "Capability failed with a terminal error");
                return Ok(Outcome::failed(error.into(), attempts));
            }
            if Instant::now() >= deadline {
                return Ok(Outcome::failed(
                    deadline_failure(attempts, Some(&error)),
                    attempts,
                ));
            }
            if !policy.allows_another(attempts) {
                warn!(attempts, error = %error, "Retry attempts exhausted");
                return Ok(Outcome::failed(error.into(), attempts));
            }

            let delay = policy.delay_after_attempt(attempts);
            warn!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retryable capability error, backing off"
            );
            last_error = Some(error);

            // The deadline cuts the wait short; the check at the top of the
            // loop then reports it
            let now = Instant::now();
            let wake = now + deadline.saturating_duration_since(now).min(delay);
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => {
                    return Ok(Outcome::failed(ExecutionFailure::cancelled(), attempts));
                }
                _ = sleep_until(wake) => {}
            }
        }
    }

    /// Record, cache, emit and assemble the result
    async fn complete(
        &self,
        request: &InvocationRequest,
        meta: DispatchMeta,
        outcome: Outcome,
    ) -> ExecutionResult {
        let name = request.capability.as_str();
        let duration = meta.start.elapsed();
        let success = outcome.result.is_ok();

        self.history.record(
            name,
            ExecutionRecord::new(meta.started_at, duration, success)
                .with_attempts(outcome.attempts)
                .with_cache_hit(meta.cache_hit),
        );

        let (output, failure) = match outcome.result {
            Ok(value) => {
                if meta.store_result {
                    self.cache
                        .put(meta.fingerprint.clone(), value.clone(), self.config.cache.ttl)
                        .await;
                }
                (Some(value), None)
            }
            Err(failure) => (None, Some(failure)),
        };

        self.metrics.emit(MetricsEvent {
            capability: name.to_string(),
            duration,
            success,
            cache_hit: meta.cache_hit,
            attempts: outcome.attempts,
            timestamp: Utc::now(),
        });

        if let Some(audit) = &self.audit {
            let entry = AuditEntry {
                request_id: meta.request_id,
                capability: name.to_string(),
                trace_id: request.trace_id.clone(),
                agent_id: request.agent_id.clone(),
                fingerprint: meta.fingerprint.to_string(),
                success,
                failure: failure.as_ref().map(|f| f.kind),
                attempts: outcome.attempts,
                cache_hit: meta.cache_hit,
                duration,
                started_at: meta.started_at,
            };
            let audit = Arc::clone(audit);
            tokio::spawn(async move {
                audit.record(entry).await;
            });
        }

        match &failure {
            None => debug!(
                duration_ms = duration.as_millis() as u64,
                attempts = outcome.attempts,
                cache_hit = meta.cache_hit,
                "Dispatch succeeded"
            ),
            Some(failure) => warn!(
                duration_ms = duration.as_millis() as u64,
                attempts = outcome.attempts,
                error = %failure,
                "Dispatch failed"
            ),
        }

        ExecutionResult {
            request_id: meta.request_id,
            capability: name.to_string(),
            success,
            output,
            error: failure,
            duration,
            attempts: outcome.attempts,
            cache_hit: meta.cache_hit,
            started_at: meta.started_at,
            trace_id: request.trace_id.clone(),
        }
    }

    /// Describe every registered capability
    pub async fn list_capabilities(&self) -> Vec<CapabilityDescription> {
        self.registry.list().await
    }

    /// Performance stats for one capability
    pub fn stats(&self, capability: &str) -> PerformanceStats {
        self.history.snapshot(capability)
    }

    /// Performance stats for every capability that has run
    pub fn stats_all(&self) -> BTreeMap<String, PerformanceStats> {
        self.history.snapshot_all()
    }

    /// Health of every registered capability
    pub async fn health(&self) -> BTreeMap<String, HealthStatus> {
        self.registry.health_check_all().await
    }

    /// Whether [`ExecutionPipeline::shutdown`] has been called
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Refuse new dispatches and shut down every live capability
    pub async fn shutdown(&self) -> Result<(), RegistryError> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Shutting down execution pipeline");
        self.registry.shutdown().await
    }
}

fn deadline_failure(attempts: u32, last_error: Option<&InvocationError>) -> ExecutionFailure {
    let message = match last_error {
        Some(error) => format!(
            "deadline exceeded after {} attempt(s); last error: {}",
            attempts, error
        ),
        None => format!("deadline exceeded after {} attempt(s)", attempts),
    };
    ExecutionFailure::deadline_exceeded(message)
}
