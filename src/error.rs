//! Error taxonomy for chain execution.

use thiserror::Error;

/// Errors raised while preparing or driving a chain run.
///
/// The public entry points never return these directly; they are folded into
/// the `error` field of a [`ChainResult`](crate::ChainResult).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChainError {
    /// Definition or input problems detected before a step executes.
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// A step handler failed or returned unusable data.
    #[error("Step {step_id} ({step}) failed: {message}")]
    StepExecution {
        step_id: u32,
        step: String,
        message: String,
    },

    /// Every configured attempt failed and no fallback was declared.
    #[error("Step {step_id} ({step}) failed after {attempts} attempts: {message}")]
    RetryExhausted {
        step_id: u32,
        step: String,
        attempts: u32,
        message: String,
    },

    /// A compensating operation failed. Logged, never escalated.
    #[error("Rollback operation '{operation}' failed: {message}")]
    RollbackOperation { operation: String, message: String },

    /// The step failed and its rollback configuration was applied.
    #[error("Step {step_id} ({step}) failed and rollback performed: {message}")]
    RolledBack {
        step_id: u32,
        step: String,
        message: String,
    },

    #[error("Template syntax error: {}", errors.join("; "))]
    TemplateSyntax { errors: Vec<String> },

    #[error("Condition syntax error at offset {offset}: {message}")]
    Condition { offset: usize, message: String },

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Store error: {message}")]
    Store { message: String },

    /// Too many runs are already tracked by the registry.
    #[error("Capacity exceeded: {active} of {limit} concurrent executions in use")]
    Capacity { active: usize, limit: usize },

    #[error("Chain execution timeout after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },
}

impl ChainError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// True for errors raised before any step is allowed to run.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. } | Self::NotFound { .. } | Self::Condition { .. }
        )
    }
}
