//! Invocation error model
//!
//! Capabilities report failures as a structured [`InvocationError`]. The
//! [`ErrorKind`] decides whether the pipeline retries the call; a capability
//! can override that decision per error with [`InvocationError::with_retryable`].

use serde::{Deserialize, Serialize};

/// Structured capability failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationError {
    /// Error kind (determines default retryability)
    pub kind: ErrorKind,

    /// Human-readable error message
    pub message: String,

    /// Capability-specific error code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Explicit transient marker, overrides the kind's classification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl InvocationError {
    /// Create a new invocation error
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            retryable: None,
        }
    }

    /// Add an error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Mark this error as retryable (or not), regardless of its kind
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    /// Input was rejected by the capability
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message).with_code("INVALID_INPUT")
    }

    /// Transient failure, safe to retry
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    /// The capability's own backend timed out
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message).with_code("TIMEOUT")
    }

    /// Backend temporarily unavailable
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message).with_code("UNAVAILABLE")
    }

    /// Internal capability error (a bug, never retried)
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message).with_code("INTERNAL_ERROR")
    }

    /// Whether the pipeline should retry after this error
    pub fn is_retryable(&self) -> bool {
        self.retryable.unwrap_or_else(|| self.kind.is_retryable())
    }
}

impl std::fmt::Display for InvocationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::error::Error for InvocationError {}

/// Error kind taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Input failed validation (not retryable - fix the input)
    InvalidInput,

    /// Referenced resource does not exist (not retryable)
    NotFound,

    /// Denied by an external system (not retryable)
    PermissionDenied,

    /// Transient failure (retryable)
    Transient,

    /// Backend timed out (retryable)
    Timeout,

    /// Backend temporarily unavailable (retryable)
    Unavailable,

    /// Connection refused by the backend (retryable)
    ConnectionRefused,

    /// Internal capability error (not retryable - bug)
    Internal,
}

impl ErrorKind {
    /// Check if this error kind is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Transient
                | ErrorKind::Timeout
                | ErrorKind::Unavailable
                | ErrorKind::ConnectionRefused
        )
    }

    /// Stable snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::NotFound => "not_found",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::Transient => "transient",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::ConnectionRefused => "connection_refused",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
