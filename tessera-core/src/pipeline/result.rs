//! Outcome types for dispatch calls

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::capability::{ErrorKind, InvocationError};

/// Why an executed dispatch did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The capability returned an error
    Invocation(ErrorKind),
    /// The deadline expired before an attempt succeeded
    DeadlineExceeded,
    /// The caller cancelled the dispatch
    Cancelled,
    /// The capability panicked
    Panicked,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invocation(kind) => write!(f, "invocation:{}", kind),
            Self::DeadlineExceeded => f.write_str("deadline_exceeded"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Panicked => f.write_str("panicked"),
        }
    }
}

/// Failure attached to an unsuccessful [`ExecutionResult`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub kind: FailureKind,
    pub message: String,
    pub code: Option<String>,
}

impl ExecutionFailure {
    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::DeadlineExceeded,
            message: message.into(),
            code: Some("DEADLINE_EXCEEDED".to_string()),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: FailureKind::Cancelled,
            message: "dispatch cancelled by caller".to_string(),
            code: Some("CANCELLED".to_string()),
        }
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Panicked,
            message: message.into(),
            code: Some("PANICKED".to_string()),
        }
    }
}

impl From<InvocationError> for ExecutionFailure {
    fn from(error: InvocationError) -> Self {
        Self {
            kind: FailureKind::Invocation(error.kind),
            message: error.message,
            code: error.code,
        }
    }
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

/// Result of a dispatch that reached execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub request_id: Uuid,
    pub capability: String,
    pub success: bool,

    /// Output value; present exactly when `success` is true
    pub output: Option<Value>,

    /// Failure; present exactly when `success` is false
    pub error: Option<ExecutionFailure>,

    /// Wall-clock time of the whole dispatch, backoff included
    #[serde(rename = "duration_ms", with = "duration_millis")]
    pub duration: Duration,

    /// Invocation attempts made; zero for cache hits
    pub attempts: u32,
    pub cache_hit: bool,
    pub started_at: DateTime<Utc>,
    pub trace_id: Option<String>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Failure kind, if any
    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Convert into the output value or the failure
    pub fn into_result(self) -> Result<Value, ExecutionFailure> {
        match (self.output, self.error) {
            (_, Some(error)) => Err(error),
            (Some(output), None) => Ok(output),
            (None, None) => Ok(Value::Null),
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
