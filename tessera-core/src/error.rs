//! Error types for Tessera operations

use crate::capability::RegistryError;
use crate::pipeline::DispatchError;

/// Result type for Tessera operations
pub type Result<T> = std::result::Result<T, TesseraError>;

/// Error types for the Tessera execution core
#[derive(Debug, thiserror::Error)]
pub enum TesseraError {
    /// Configuration could not be loaded or failed validation
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Capability registry error
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Dispatch could not be attempted
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for TesseraError {
    fn from(s: String) -> Self {
        TesseraError::Other(s)
    }
}

impl From<&str> for TesseraError {
    fn from(s: &str) -> Self {
        TesseraError::Other(s.to_string())
    }
}

impl From<figment::Error> for TesseraError {
    fn from(err: figment::Error) -> Self {
        TesseraError::Configuration(err.to_string())
    }
}
