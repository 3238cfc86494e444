//! Builtin capabilities
//!
//! Small capabilities that ship with the core: `echo` for wiring checks and
//! `delay` for exercising deadlines and concurrency limits.

use super::capability::{
    BoxedCapability, Capability, CapabilityFactory, CapabilityInput, CapabilityMetadata,
    InvocationContext,
};
use super::error::InvocationError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Returns its input unchanged
pub struct EchoCapability {
    metadata: CapabilityMetadata,
}

impl EchoCapability {
    pub fn new() -> Self {
        Self {
            metadata: echo_metadata(),
        }
    }
}

impl Default for EchoCapability {
    fn default() -> Self {
        Self::new()
    }
}

fn echo_metadata() -> CapabilityMetadata {
    CapabilityMetadata::new("echo", "Returns its input unchanged")
        .with_version("1.0.0")
        .with_tag("diagnostic")
}

#[async_trait]
impl Capability for EchoCapability {
    fn describe(&self) -> &CapabilityMetadata {
        &self.metadata
    }

    async fn invoke(
        &self,
        input: &CapabilityInput,
        _ctx: &InvocationContext,
    ) -> Result<Value, InvocationError> {
        Ok(Value::Object(input.clone()))
    }
}

/// Sleeps for `input.ms` milliseconds, bounded by the deadline
pub struct DelayCapability {
    metadata: CapabilityMetadata,
    max_delay: Duration,
}

impl DelayCapability {
    pub fn new(max_delay: Duration) -> Self {
        Self {
            metadata: delay_metadata(),
            max_delay,
        }
    }
}

fn delay_metadata() -> CapabilityMetadata {
    CapabilityMetadata::new("delay", "Sleeps for the requested number of milliseconds")
        .with_version("1.0.0")
        .with_tag("diagnostic")
}

#[async_trait]
impl Capability for DelayCapability {
    fn describe(&self) -> &CapabilityMetadata {
        &self.metadata
    }

    async fn invoke(
        &self,
        input: &CapabilityInput,
        ctx: &InvocationContext,
    ) -> Result<Value, InvocationError> {
        let ms = input
            .get("ms")
            .and_then(Value::as_u64)
            .ok_or_else(|| InvocationError::invalid_input("'ms' must be a non-negative integer"))?;

        let requested = Duration::from_millis(ms);
        if requested > self.max_delay {
            return Err(InvocationError::invalid_input(format!(
                "requested delay {:?} exceeds the {:?} limit",
                requested, self.max_delay
            )));
        }

        tokio::select! {
            _ = tokio::time::sleep(requested) => Ok(json!({ "slept_ms": ms })),
            _ = tokio::time::sleep_until(ctx.deadline) => {
                Err(InvocationError::timeout("deadline reached while sleeping"))
            }
        }
    }
}

/// Factory for [`EchoCapability`]
pub struct EchoFactory;

#[async_trait]
impl CapabilityFactory for EchoFactory {
    fn metadata(&self) -> CapabilityMetadata {
        echo_metadata()
    }

    async fn create(&self, _config: &Value) -> anyhow::Result<BoxedCapability> {
        Ok(Arc::new(EchoCapability::new()))
    }
}

/// Factory for [`DelayCapability`]
///
/// Accepts `{ "max_delay_ms": n }` as configuration (default 60000).
pub struct DelayFactory;

#[async_trait]
impl CapabilityFactory for DelayFactory {
    fn metadata(&self) -> CapabilityMetadata {
        delay_metadata()
    }

    async fn create(&self, config: &Value) -> anyhow::Result<BoxedCapability> {
        let max_delay_ms = match config.get("max_delay_ms") {
            None => 60_000,
            Some(value) => value
                .as_u64()
                .ok_or_else(|| anyhow::anyhow!("max_delay_ms must be a non-negative integer"))?,
        };
        Ok(Arc::new(DelayCapability::new(Duration::from_millis(
            max_delay_ms,
        ))))
    }
}

/// Shared factory for `echo`
pub fn echo_factory() -> Arc<dyn CapabilityFactory> {
    Arc::new(EchoFactory)
}

/// Shared factory for `delay`
pub fn delay_factory() -> Arc<dyn CapabilityFactory> {
    Arc::new(DelayFactory)
}

/// Every builtin factory, keyed by capability name
pub fn all() -> Vec<(&'static str, Arc<dyn CapabilityFactory>)> {
    vec![("echo", echo_factory()), ("delay", delay_factory())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn input(value: Value) -> CapabilityInput {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_echo_returns_input() {
        let echo = EchoCapability::new();
        let ctx = InvocationContext::new(Instant::now() + Duration::from_secs(1));
        let output = echo.invoke(&input(json!({"x": 1})), &ctx).await.unwrap();
        assert_eq!(output, json!({"x": 1}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_sleeps() {
        let delay = DelayCapability::new(Duration::from_secs(10));
        let ctx = InvocationContext::new(Instant::now() + Duration::from_secs(5));

        let started = Instant::now();
        let output = delay.invoke(&input(json!({"ms": 250})), &ctx).await.unwrap();
        assert_eq!(output, json!({"slept_ms": 250}));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(250) && elapsed < Duration::from_millis(260));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_respects_deadline() {
        let delay = DelayCapability::new(Duration::from_secs(10));
        let ctx = InvocationContext::new(Instant::now() + Duration::from_millis(100));

        let error = delay
            .invoke(&input(json!({"ms": 5000})), &ctx)
            .await
            .unwrap_err();
        assert_eq!(error.kind, crate::capability::ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_delay_rejects_bad_input() {
        let delay = DelayCapability::new(Duration::from_millis(10));
        let ctx = InvocationContext::new(Instant::now() + Duration::from_secs(1));

        let missing = delay.invoke(&input(json!({})), &ctx).await.unwrap_err();
        assert!(!missing.is_retryable());

        let too_long = delay.invoke(&input(json!({"ms": 50})), &ctx).await.unwrap_err();
        assert_eq!(too_long.kind, crate::capability::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_delay_factory_config() {
        assert!(DelayFactory.create(&json!({"max_delay_ms": 5})).await.is_ok());
        assert!(DelayFactory.create(&json!({"max_delay_ms": "soon"})).await.is_err());
        assert_eq!(all().len(), 2);
    }
}
