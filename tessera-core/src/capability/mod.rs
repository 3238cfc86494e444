//! Capability system
//!
//! Capabilities are the pluggable units of work the pipeline executes.
//! This module provides:
//! - The [`Capability`] trait and its structured [`InvocationError`]
//! - [`CapabilityFactory`] constructors registered by name
//! - The [`CapabilityRegistry`] owning lazily created singleton instances
//! - A couple of builtin capabilities
//!
//! # Example
//!
//! ```rust,no_run
//! use tessera_core::capability::{builtin, CapabilityRegistry};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = CapabilityRegistry::new();
//! registry.register("echo", builtin::echo_factory()).await?;
//!
//! let echo = registry.get_or_create("echo", &serde_json::Value::Null).await?;
//! assert_eq!(echo.name(), "echo");
//! # Ok(())
//! # }
//! ```

pub mod builtin;
#[allow(clippy::module_inception)]
mod capability;
mod error;
mod registry;

pub use capability::{
    factory_fn, BoxedCapability, Capability, CapabilityFactory, CapabilityInput,
    CapabilityMetadata, FnFactory, InvocationContext,
};
pub use error::{ErrorKind, InvocationError};
pub use registry::{CapabilityDescription, CapabilityRegistry, HealthStatus, RegistryError};

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
