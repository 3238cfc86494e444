//! Invocation requests: what to run, with what input, under which limits

use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::error::DispatchError;
use super::retry::RetryPolicy;
use crate::capability::CapabilityInput;

/// One capability call handed to the pipeline
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    /// Registered capability name
    pub capability: String,
    /// Input object handed to the capability
    pub input: CapabilityInput,

    /// Overall deadline; the pipeline default applies when unset
    pub timeout: Option<Duration>,

    /// Retry policy; the pipeline default applies when unset
    pub retry_policy: Option<RetryPolicy>,

    /// Per-request cache switch; the pipeline default applies when unset
    pub cache: Option<bool>,

    /// Rate limit permits charged for this call
    pub cost: u64,

    /// Correlation id propagated to logs and audit entries
    pub trace_id: Option<String>,
    /// Calling agent, if known
    pub agent_id: Option<String>,
    /// Caller-owned token; cancelling it ends the call with `Cancelled`
    pub cancellation: Option<CancellationToken>,
}

impl InvocationRequest {
    /// Request with pipeline defaults and a cost of 1
    pub fn new(capability: impl Into<String>, input: CapabilityInput) -> Self {
        Self {
            capability: capability.into(),
            input,
            timeout: None,
            retry_policy: None,
            cache: None,
            cost: 1,
            trace_id: None,
            agent_id: None,
            cancellation: None,
        }
    }

    /// Build a request from a JSON value, which must be an object or null
    pub fn from_json(capability: impl Into<String>, input: Value) -> Result<Self, DispatchError> {
        let input = match input {
            Value::Object(map) => map,
            Value::Null => CapabilityInput::new(),
            other => {
                return Err(DispatchError::InvalidArgument(format!(
                    "capability input must be a JSON object, got {}",
                    json_type(&other)
                )));
            }
        };
        Ok(Self::new(capability, input))
    }

    /// Set the deadline for the whole call, backoff waits included
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the pipeline's default retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Force the result cache on or off for this call
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache = Some(enabled);
        self
    }

    /// Charge `cost` rate limit permits instead of 1
    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }

    /// Attach a trace id
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Attach the calling agent's id
    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Make the call cancellable through `token`
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Reject requests that cannot be dispatched
    pub(crate) fn validate(&self) -> Result<(), DispatchError> {
        if self.capability.is_empty() {
            return Err(DispatchError::InvalidArgument(
                "capability name cannot be empty".to_string(),
            ));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(DispatchError::InvalidArgument(
                "timeout must be greater than zero".to_string(),
            ));
        }
        if let Some(policy) = &self.retry_policy {
            policy.validate().map_err(DispatchError::InvalidArgument)?;
        }
        Ok(())
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
