//! Capability registry: factories, lazy singletons, introspection, shutdown
//!
//! The `CapabilityRegistry` provides:
//! - Factory registration with duplicate detection
//! - Lazy, single construction of each capability on first use
//! - Listing, description and health checks
//! - Best-effort coordinated shutdown
//!
//! Each registered name owns its own slot lock, so constructing one capability
//! never blocks lookups or construction of another. Lookup of an existing
//! instance only takes shared locks.
//!
//! # Example
//!
//! ```rust,ignore
//! use tessera_core::capability::{CapabilityRegistry, builtin};
//!
//! let registry = CapabilityRegistry::new();
//! registry.register("echo", builtin::echo_factory()).await?;
//!
//! let echo = registry.get_or_create("echo", &serde_json::Value::Null).await?;
//! ```

use super::capability::{BoxedCapability, CapabilityFactory, CapabilityMetadata};
use super::panic_message;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Error type for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Empty name or otherwise unusable registration
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A factory with this name already exists
    #[error("Capability '{0}' is already registered")]
    DuplicateCapability(String),

    /// No factory registered under this name
    #[error("Capability '{0}' is not registered")]
    NotRegistered(String),

    /// The factory failed or panicked
    #[error("Failed to construct capability '{name}': {source}")]
    ConstructionFailed {
        /// Capability name
        name: String,
        /// Underlying factory error
        #[source]
        source: anyhow::Error,
    },

    /// A capability's shutdown hook failed
    #[error("Failed to shut down capability '{name}': {message}")]
    ShutdownFailed {
        /// Capability name
        name: String,
        /// Failure description
        message: String,
    },

    /// The registry has been shut down
    #[error("Capability registry is shut down")]
    ShutDown,
}

/// Description of a registered capability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityDescription {
    /// Registered name
    pub name: String,
    /// Metadata reported by the instance, or by the factory before construction
    pub metadata: CapabilityMetadata,
    /// Whether an instance is currently live
    pub instantiated: bool,
    /// When the live instance was created
    pub created_at: Option<DateTime<Utc>>,
}

/// Health of a registered capability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum HealthStatus {
    /// Instance is live and its health check passed
    Healthy,
    /// Instance is live but its health check failed
    Unhealthy(String),
    /// No instance has been created yet
    NotInstantiated,
}

#[derive(Default)]
struct SlotState {
    instance: Option<BoxedCapability>,
    created_at: Option<DateTime<Utc>>,
    retired: bool,
}

struct CapabilitySlot {
    factory: Arc<dyn CapabilityFactory>,
    state: RwLock<SlotState>,
}

impl CapabilitySlot {
    fn new(factory: Arc<dyn CapabilityFactory>) -> Self {
        Self {
            factory,
            state: RwLock::new(SlotState::default()),
        }
    }

    /// Retire the slot and hand back its live instance, if any
    async fn retire(&self) -> Option<BoxedCapability> {
        let mut state = self.state.write().await;
        state.retired = true;
        state.created_at = None;
        state.instance.take()
    }
}

/// Registry owning capability factories and their singleton instances
pub struct CapabilityRegistry {
    slots: RwLock<HashMap<String, Arc<CapabilitySlot>>>,
    closed: AtomicBool,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl CapabilityRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), RegistryError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(RegistryError::ShutDown)
        } else {
            Ok(())
        }
    }

    async fn slot(&self, name: &str) -> Option<Arc<CapabilitySlot>> {
        self.slots.read().await.get(name).cloned()
    }

    /// Register a factory under `name`
    ///
    /// Returns an error if the name is empty or already registered.
    pub async fn register(
        &self,
        name: impl Into<String>,
        factory: Arc<dyn CapabilityFactory>,
    ) -> Result<(), RegistryError> {
        self.ensure_open()?;

        let name = name.into();
        if name.trim().is_empty() {
            return Err(RegistryError::InvalidArgument(
                "capability name must not be empty".to_string(),
            ));
        }

        let mut slots = self.slots.write().await;
        if slots.contains_key(&name) {
            return Err(RegistryError::DuplicateCapability(name));
        }
        info!(capability = %name, "Registered capability factory");
        slots.insert(name, Arc::new(CapabilitySlot::new(factory)));
        Ok(())
    }

    /// Remove a capability, shutting down its instance if one is live
    ///
    /// Shutdown failures are logged, never returned. Returns whether a
    /// factory was registered under `name`.
    pub async fn unregister(&self, name: &str) -> bool {
        let Some(slot) = self.slots.write().await.remove(name) else {
            return false;
        };

        if let Some(instance) = slot.retire().await {
            match AssertUnwindSafe(instance.shutdown()).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(capability = %name, error = %e, "Capability shutdown failed during unregister");
                }
                Err(payload) => {
                    warn!(
                        capability = %name,
                        panic = %panic_message(payload.as_ref()),
                        "Capability shutdown panicked during unregister"
                    );
                }
            }
        }
        info!(capability = %name, "Unregistered capability");
        true
    }

    /// Return the live instance for `name`, constructing it on first use
    ///
    /// Concurrent first calls for the same name run the factory exactly once;
    /// every caller receives the same instance.
    pub async fn get_or_create(
        &self,
        name: &str,
        config: &Value,
    ) -> Result<BoxedCapability, RegistryError> {
        self.ensure_open()?;
        let slot = self
            .slot(name)
            .await
            .ok_or_else(|| RegistryError::NotRegistered(name.to_string()))?;

        // Fast path: shared lock only
        {
            let state = slot.state.read().await;
            if let Some(instance) = &state.instance {
                debug!(capability = %name, "Capability instance found");
                return Ok(Arc::clone(instance));
            }
            if state.retired {
                return Err(RegistryError::NotRegistered(name.to_string()));
            }
        }

        // Slow path: exclusive on this slot, re-check before constructing
        let mut state = slot.state.write().await;
        if let Some(instance) = &state.instance {
            return Ok(Arc::clone(instance));
        }
        if state.retired {
            return Err(RegistryError::NotRegistered(name.to_string()));
        }

        let created = AssertUnwindSafe(slot.factory.create(config))
            .catch_unwind()
            .await;

        match created {
            Ok(Ok(instance)) => {
                info!(capability = %name, "Constructed capability instance");
                state.instance = Some(Arc::clone(&instance));
                state.created_at = Some(Utc::now());
                Ok(instance)
            }
            Ok(Err(source)) => {
                error!(capability = %name, error = %source, "Capability construction failed");
                Err(RegistryError::ConstructionFailed {
                    name: name.to_string(),
                    source,
                })
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(capability = %name, panic = %message, "Capability factory panicked");
                Err(RegistryError::ConstructionFailed {
                    name: name.to_string(),
                    source: anyhow::anyhow!("factory panicked: {}", message),
                })
            }
        }
    }

    /// Get the live instance for `name` without constructing it
    pub async fn get(&self, name: &str) -> Option<BoxedCapability> {
        let slot = self.slot(name).await?;
        let state = slot.state.read().await;
        state.instance.clone()
    }

    /// Check if a factory is registered under `name`
    pub async fn contains(&self, name: &str) -> bool {
        self.slots.read().await.contains_key(name)
    }

    /// Registered names, sorted
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered factories
    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Check if the registry is empty
    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    async fn describe_slot(name: &str, slot: &CapabilitySlot) -> CapabilityDescription {
        let state = slot.state.read().await;
        let metadata = match &state.instance {
            Some(instance) => instance.describe().clone(),
            None => slot.factory.metadata(),
        };
        CapabilityDescription {
            name: name.to_string(),
            metadata,
            instantiated: state.instance.is_some(),
            created_at: state.created_at,
        }
    }

    /// Describe a single capability
    pub async fn describe(&self, name: &str) -> Result<CapabilityDescription, RegistryError> {
        let slot = self
            .slot(name)
            .await
            .ok_or_else(|| RegistryError::NotRegistered(name.to_string()))?;
        Ok(Self::describe_slot(name, &slot).await)
    }

    /// Describe every registered capability, sorted by name
    pub async fn list(&self) -> Vec<CapabilityDescription> {
        let slots: Vec<(String, Arc<CapabilitySlot>)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(name, slot)| (name.clone(), Arc::clone(slot)))
            .collect();

        let mut descriptions = Vec::with_capacity(slots.len());
        for (name, slot) in &slots {
            descriptions.push(Self::describe_slot(name, slot).await);
        }
        descriptions.sort_by(|a, b| a.name.cmp(&b.name));
        descriptions
    }

    /// Run the health check of a live capability
    pub async fn health_check(&self, name: &str) -> Result<HealthStatus, RegistryError> {
        if !self.contains(name).await {
            return Err(RegistryError::NotRegistered(name.to_string()));
        }
        Ok(match self.get(name).await {
            None => HealthStatus::NotInstantiated,
            Some(instance) => match instance.health_check().await {
                Ok(()) => HealthStatus::Healthy,
                Err(e) => HealthStatus::Unhealthy(e.to_string()),
            },
        })
    }

    /// Health of every registered capability
    pub async fn health_check_all(&self) -> BTreeMap<String, HealthStatus> {
        let mut report = BTreeMap::new();
        for name in self.names().await {
            if let Ok(status) = self.health_check(&name).await {
                report.insert(name, status);
            }
        }
        report
    }

    /// Shut down every live instance
    ///
    /// Every instance is attempted even if an earlier one fails; the first
    /// failure is returned. Later calls to `register` and `get_or_create`
    /// fail with [`RegistryError::ShutDown`].
    pub async fn shutdown(&self) -> Result<(), RegistryError> {
        self.closed.store(true, Ordering::SeqCst);

        let mut slots: Vec<(String, Arc<CapabilitySlot>)> =
            self.slots.write().await.drain().collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));

        let mut first_error = None;
        for (name, slot) in slots {
            let Some(instance) = slot.retire().await else {
                continue;
            };

            let outcome = AssertUnwindSafe(instance.shutdown()).catch_unwind().await;
            let message = match outcome {
                Ok(Ok(())) => {
                    info!(capability = %name, "Capability shut down");
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(payload) => format!("shutdown panicked: {}", panic_message(payload.as_ref())),
            };

            warn!(capability = %name, error = %message, "Capability shutdown failed");
            if first_error.is_none() {
                first_error = Some(RegistryError::ShutdownFailed { name, message });
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{
        factory_fn, Capability, CapabilityInput, InvocationContext, InvocationError,
    };
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Stub {
        metadata: CapabilityMetadata,
        shutdowns: Arc<AtomicUsize>,
        fail_shutdown: bool,
        panic_on_shutdown: bool,
        healthy: bool,
    }

    #[async_trait]
    impl Capability for Stub {
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

        async fn health_check(&self) -> Result<(), InvocationError> {
            if self.healthy {
                Ok(())
            } else {
                Err(InvocationError::unavailable("backend down"))
            }
        }

        async fn shutdown(&self) -> Result<(), InvocationError> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            if self.panic_on_shutdown {
                panic!("socket already torn down");
            }
            if self.fail_shutdown {
                Err(InvocationError::internal("connection already closed"))
            } else {
                Ok(())
            }
        }
    }

    /// Factory that counts constructions and yields to let callers race
    struct CountingFactory {
        name: &'static str,
        constructions: Arc<AtomicUsize>,
        shutdowns: Arc<AtomicUsize>,
        fail_shutdown: bool,
        panic_on_shutdown: bool,
    }

    impl CountingFactory {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                constructions: Arc::new(AtomicUsize::new(0)),
                shutdowns: Arc::new(AtomicUsize::new(0)),
                fail_shutdown: false,
                panic_on_shutdown: false,
            }
        }
    }

    #[async_trait]
    impl CapabilityFactory for CountingFactory {
        fn metadata(&self) -> CapabilityMetadata {
            CapabilityMetadata::new(self.name, "Counts its own constructions")
        }

        async fn create(&self, _config: &Value) -> anyhow::Result<BoxedCapability> {
            self.constructions.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(Arc::new(Stub {
                metadata: self.metadata(),
                shutdowns: Arc::clone(&self.shutdowns),
                fail_shutdown: self.fail_shutdown,
                panic_on_shutdown: self.panic_on_shutdown,
                healthy: true,
            }))
        }
    }

    #[tokio::test]
    async fn test_register_and_create() {
        let registry = CapabilityRegistry::new();
        let factory = Arc::new(CountingFactory::new("counter"));
        let constructions = Arc::clone(&factory.constructions);

        registry.register("counter", factory).await.unwrap();
        assert!(registry.contains("counter").await);
        assert!(registry.get("counter").await.is_none());

        let first = registry.get_or_create("counter", &Value::Null).await.unwrap();
        let second = registry.get_or_create("counter", &Value::Null).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(constructions.load(Ordering::SeqCst), 1);
        assert!(registry.get("counter").await.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_registration() {
        let registry = CapabilityRegistry::new();
        registry
            .register("counter", Arc::new(CountingFactory::new("counter")))
            .await
            .unwrap();

        let result = registry
            .register("counter", Arc::new(CountingFactory::new("counter")))
            .await;
        assert!(matches!(result, Err(RegistryError::DuplicateCapability(name)) if name == "counter"));
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let registry = CapabilityRegistry::new();
        let result = registry
            .register("  ", Arc::new(CountingFactory::new("counter")))
            .await;
        assert!(matches!(result, Err(RegistryError::InvalidArgument(_))));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_not_registered() {
        let registry = CapabilityRegistry::new();
        let result = registry.get_or_create("missing", &Value::Null).await;
        assert!(matches!(result, Err(RegistryError::NotRegistered(_))));
        assert!(registry.describe("missing").await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_use_constructs_once() {
        let registry = Arc::new(CapabilityRegistry::new());
        let factory = Arc::new(CountingFactory::new("counter"));
        let constructions = Arc::clone(&factory.constructions);
        registry.register("counter", factory).await.unwrap();

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.get_or_create("counter", &Value::Null).await })
            })
            .collect();

        let instances: Vec<BoxedCapability> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(constructions.load(Ordering::SeqCst), 1);
        assert!(instances.iter().all(|i| Arc::ptr_eq(i, &instances[0])));
    }

    #[tokio::test]
    async fn test_construction_failure_is_wrapped() {
        let registry = CapabilityRegistry::new();
        let factory = factory_fn(CapabilityMetadata::new("broken", "Never builds"), |_| {
            Err(anyhow::anyhow!("schema file missing"))
        });
        registry.register("broken", factory).await.unwrap();

        let error = registry
            .get_or_create("broken", &Value::Null)
            .await
            .unwrap_err();
        match error {
            RegistryError::ConstructionFailed { name, source } => {
                assert_eq!(name, "broken");
                assert!(source.to_string().contains("schema file missing"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(registry.get("broken").await.is_none());
    }

    #[tokio::test]
    async fn test_factory_panic_is_contained() {
        let registry = CapabilityRegistry::new();
        let factory = factory_fn(CapabilityMetadata::new("panicky", "Panics"), |_| {
            panic!("config was not an object")
        });
        registry.register("panicky", factory).await.unwrap();

        let error = registry
            .get_or_create("panicky", &Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(error, RegistryError::ConstructionFailed { .. }));
        assert!(error.to_string().contains("config was not an object"));

        // Registry remains usable
        registry
            .register("counter", Arc::new(CountingFactory::new("counter")))
            .await
            .unwrap();
        assert!(registry.get_or_create("counter", &Value::Null).await.is_ok());
    }

    #[tokio::test]
    async fn test_unregister_shuts_down_instance() {
        let registry = CapabilityRegistry::new();
        let mut factory = CountingFactory::new("counter");
        factory.fail_shutdown = true;
        let shutdowns = Arc::clone(&factory.shutdowns);
        registry.register("counter", Arc::new(factory)).await.unwrap();
        registry.get_or_create("counter", &Value::Null).await.unwrap();

        assert!(registry.unregister("counter").await);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert!(!registry.contains("counter").await);
        assert!(!registry.unregister("counter").await);
    }

    #[tokio::test]
    async fn test_unregister_contains_shutdown_panic() {
        let registry = CapabilityRegistry::new();
        let mut factory = CountingFactory::new("fragile");
        factory.panic_on_shutdown = true;
        let shutdowns = Arc::clone(&factory.shutdowns);
        registry.register("fragile", Arc::new(factory)).await.unwrap();
        registry.get_or_create("fragile", &Value::Null).await.unwrap();

        assert!(registry.unregister("fragile").await);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert!(!registry.contains("fragile").await);

        // Name is free again
        registry
            .register("fragile", Arc::new(CountingFactory::new("fragile")))
            .await
            .unwrap();
        assert!(registry.get_or_create("fragile", &Value::Null).await.is_ok());
    }

    #[tokio::test]
    async fn test_list_and_describe() {
        let registry = CapabilityRegistry::new();
        registry
            .register("zeta", Arc::new(CountingFactory::new("zeta")))
            .await
            .unwrap();
        registry
            .register("alpha", Arc::new(CountingFactory::new("alpha")))
            .await
            .unwrap();
        registry.get_or_create("zeta", &Value::Null).await.unwrap();

        let listed = registry.list().await;
        let names: Vec<&str> = listed.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert!(!listed[0].instantiated);
        assert!(listed[1].instantiated);
        assert!(listed[1].created_at.is_some());

        let alpha = registry.describe("alpha").await.unwrap();
        assert_eq!(alpha.metadata.description, "Counts its own constructions");
    }

    #[tokio::test]
    async fn test_health_checks() {
        let registry = CapabilityRegistry::new();
        registry
            .register("counter", Arc::new(CountingFactory::new("counter")))
            .await
            .unwrap();
        registry
            .register(
                "sick",
                factory_fn(CapabilityMetadata::new("sick", "Always unhealthy"), |_| {
                    Ok(Arc::new(Stub {
                        metadata: CapabilityMetadata::new("sick", "Always unhealthy"),
                        shutdowns: Arc::new(AtomicUsize::new(0)),
                        fail_shutdown: false,
                        panic_on_shutdown: false,
                        healthy: false,
                    }) as BoxedCapability)
                }),
            )
            .await
            .unwrap();

        assert_eq!(
            registry.health_check("counter").await.unwrap(),
            HealthStatus::NotInstantiated
        );

        registry.get_or_create("counter", &Value::Null).await.unwrap();
        registry.get_or_create("sick", &Value::Null).await.unwrap();

        let report = registry.health_check_all().await;
        assert_eq!(report["counter"], HealthStatus::Healthy);
        assert!(matches!(&report["sick"], HealthStatus::Unhealthy(reason) if reason.contains("backend down")));
    }

    #[tokio::test]
    async fn test_shutdown_is_best_effort() {
        let registry = CapabilityRegistry::new();

        let mut failing = CountingFactory::new("a_failing");
        failing.fail_shutdown = true;
        let failing_shutdowns = Arc::clone(&failing.shutdowns);

        let healthy = CountingFactory::new("b_healthy");
        let healthy_shutdowns = Arc::clone(&healthy.shutdowns);

        registry.register("a_failing", Arc::new(failing)).await.unwrap();
        registry.register("b_healthy", Arc::new(healthy)).await.unwrap();
        registry.register("c_idle", Arc::new(CountingFactory::new("c_idle"))).await.unwrap();

        registry.get_or_create("a_failing", &Value::Null).await.unwrap();
        registry.get_or_create("b_healthy", &Value::Null).await.unwrap();

        let result = registry.shutdown().await;
        assert!(matches!(result, Err(RegistryError::ShutdownFailed { ref name, .. }) if name == "a_failing"));
        assert_eq!(failing_shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(healthy_shutdowns.load(Ordering::SeqCst), 1);

        assert!(matches!(
            registry.get_or_create("b_healthy", &Value::Null).await,
            Err(RegistryError::ShutDown)
        ));
        assert!(registry.is_empty().await);
    }
}
