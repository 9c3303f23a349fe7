//! Flow execution error types

use cdp_adapter::AdapterError;
use thiserror::Error;

/// Flow execution errors
#[derive(Debug, Clone, Error)]
pub enum FlowError {
    /// A wait condition was not satisfied within its tier
    #[error("Condition {condition} not met within {timeout_ms}ms")]
    ConditionTimeout { condition: String, timeout_ms: u64 },

    /// An expected browser target or element does not exist
    #[error("Target not found: {0}")]
    TargetNotFound(String),

    /// Navigation was rejected or never settled
    #[error("Navigation to {url} failed: {reason}")]
    NavigationFailed { url: String, reason: String },

    /// The terminal notification never arrived before the inactivity ceiling
    #[error("No terminal notification after {idle_ms}ms of inactivity (last message: {last_message:?})")]
    CompletionTimeout {
        idle_ms: u64,
        last_message: Option<String>,
    },

    /// Step execution failed
    #[error("Step {step} failed: {reason}")]
    StepFailed { step: String, reason: String },

    /// Browser adapter error
    #[error("Browser adapter error: {0}")]
    Adapter(#[from] AdapterError),
}

impl FlowError {
    /// Build a step failure with context
    pub fn step(step: impl Into<String>, reason: impl Into<String>) -> Self {
        FlowError::StepFailed {
            step: step.into(),
            reason: reason.into(),
        }
    }

    pub fn is_condition_timeout(&self) -> bool {
        matches!(self, FlowError::ConditionTimeout { .. })
    }
}

/// Errors that know whether repeating the failed operation can help.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for FlowError {
    fn is_retryable(&self) -> bool {
        match self {
            FlowError::TargetNotFound(_) | FlowError::CompletionTimeout { .. } => false,
            FlowError::Adapter(err) => err.retriable,
            FlowError::ConditionTimeout { .. }
            | FlowError::NavigationFailed { .. }
            | FlowError::StepFailed { .. } => true,
        }
    }
}
