//! Capability trait, metadata and factory definitions
//!
//! A capability is a named, versioned unit of work (a linter, a schema
//! inspector, a migration checker). Capabilities are built lazily by a
//! [`CapabilityFactory`] the first time the registry is asked for them.

use super::error::InvocationError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Structured capability input: key/value mapping with no schema enforced here
pub type CapabilityInput = Map<String, Value>;

/// Capability metadata for listing and description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityMetadata {
    /// Capability name (unique identifier)
    pub name: String,

    /// Capability version
    pub version: String,

    /// Human-readable description
    pub description: String,

    /// Tags for categorization
    #[serde(default)]
    pub tags: Vec<String>,
}

impl CapabilityMetadata {
    /// Create new metadata with required fields
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "0.1.0".to_string(),
            description: description.into(),
            tags: Vec::new(),
        }
    }

    /// Set version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Add a tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// Context handed to a capability for one invocation attempt
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// Absolute deadline for the whole dispatch call
    pub deadline: Instant,

    /// Attempt number (1-indexed)
    pub attempt: u32,

    /// Request ID assigned by the pipeline
    pub request_id: Uuid,

    /// Trace ID for correlation
    pub trace_id: Option<String>,

    /// Agent ID making the call
    pub agent_id: Option<String>,

    /// Cancellation token for the dispatch call
    pub cancellation: CancellationToken,
}

impl InvocationContext {
    /// Create a context with the given deadline and fresh identifiers
    pub fn new(deadline: Instant) -> Self {
        Self {
            deadline,
            attempt: 1,
            request_id: Uuid::new_v4(),
            trace_id: None,
            agent_id: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Time left before the deadline
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether the deadline has already passed
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Check if cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Core capability trait
///
/// Implementations are shared across concurrent dispatches, so any internal
/// state (a held connection, a warm cache) must be synchronized by the
/// implementation itself.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Get capability metadata
    fn describe(&self) -> &CapabilityMetadata;

    /// Get capability name (convenience method)
    fn name(&self) -> &str {
        &self.describe().name
    }

    /// Run the capability on `input`
    ///
    /// The pipeline enforces `ctx.deadline`; long-running implementations
    /// should still check `ctx.remaining()` before starting expensive work.
    async fn invoke(
        &self,
        input: &CapabilityInput,
        ctx: &InvocationContext,
    ) -> Result<Value, InvocationError>;

    /// Report whether the capability can currently serve requests
    async fn health_check(&self) -> Result<(), InvocationError> {
        Ok(())
    }

    /// Release held resources. Called once by the registry.
    async fn shutdown(&self) -> Result<(), InvocationError> {
        Ok(())
    }
}

/// Type alias for shared capability instances
pub type BoxedCapability = Arc<dyn Capability>;

impl std::fmt::Debug for dyn Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let metadata = self.describe();
        f.debug_struct("Capability")
            .field("name", &metadata.name)
            .field("version", &metadata.version)
            .finish()
    }
}

/// Constructor for a capability, registered by name
#[async_trait]
pub trait CapabilityFactory: Send + Sync {
    /// Metadata of the capability this factory builds
    fn metadata(&self) -> CapabilityMetadata;

    /// Build the capability from its configuration value
    async fn create(&self, config: &Value) -> anyhow::Result<BoxedCapability>;
}

/// Factory backed by a synchronous constructor closure
pub struct FnFactory<F> {
    metadata: CapabilityMetadata,
    constructor: F,
}

impl<F> FnFactory<F>
where
    F: Fn(&Value) -> anyhow::Result<BoxedCapability> + Send + Sync,
{
    /// Create a factory from metadata and a constructor
    pub fn new(metadata: CapabilityMetadata, constructor: F) -> Self {
        Self {
            metadata,
            constructor,
        }
    }
}

#[async_trait]
impl<F> CapabilityFactory for FnFactory<F>
where
    F: Fn(&Value) -> anyhow::Result<BoxedCapability> + Send + Sync,
{
    fn metadata(&self) -> CapabilityMetadata {
        self.metadata.clone()
    }

    async fn create(&self, config: &Value) -> anyhow::Result<BoxedCapability> {
        (self.constructor)(config)
    }
}

/// Convenience constructor for [`FnFactory`]
pub fn factory_fn<F>(metadata: CapabilityMetadata, constructor: F) -> Arc<dyn CapabilityFactory>
where
    F: Fn(&Value) -> anyhow::Result<BoxedCapability> + Send + Sync + 'static,
{
    Arc::new(FnFactory::new(metadata, constructor))
}
