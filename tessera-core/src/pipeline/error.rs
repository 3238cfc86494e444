use std::time::Duration;

use crate::capability::RegistryError;

/// Reasons a dispatch was refused before any attempt ran
///
/// These are never recorded in history. Failures that happen while
/// executing are reported through `ExecutionResult` instead.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Rate limit exceeded for '{capability}' (category '{category}'), retry after {retry_after:?}")]
    RateLimited {
        capability: String,
        category: String,
        retry_after: Duration,
    },

    #[error("Capability '{0}' is not registered")]
    NotRegistered(String),

    #[error("Failed to construct capability '{name}': {source}")]
    ConstructionFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Pipeline is shutting down")]
    ShuttingDown,
}

impl DispatchError {
    /// Stable snake_case name of the variant
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::RateLimited { .. } => "rate_limited",
            Self::NotRegistered(_) => "not_registered",
            Self::ConstructionFailed { .. } => "construction_failed",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

impl From<RegistryError> for DispatchError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::NotRegistered(name) => Self::NotRegistered(name),
            RegistryError::ConstructionFailed { name, source } => {
                Self::ConstructionFailed { name, source }
            }
            RegistryError::ShutDown => Self::ShuttingDown,
            RegistryError::InvalidArgument(message) => Self::InvalidArgument(message),
            other @ (RegistryError::DuplicateCapability(_)
            | RegistryError::ShutdownFailed { .. }) => Self::InvalidArgument(other.to_string()),
        }
    }
}
