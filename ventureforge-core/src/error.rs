//! Error types for VentureForge operations

use std::time::Duration;

use uuid::Uuid;

use crate::workflow::Phase;

/// Result type for VentureForge operations
pub type Result<T> = std::result::Result<T, ForgeError>;

/// Error types for the orchestration core
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    /// Malformed submission input; nothing was mutated
    #[error("validation error: {0}")]
    Validation(String),

    /// The running-workflow cap is full
    #[error("concurrency limit exceeded")]
    ConcurrencyLimitExceeded,

    /// A resource reservation could not be satisfied; no partial reservation remains
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Retryable provider failure (includes timeouts)
    #[error("transient provider error: {0}")]
    ProviderTransient(String),

    /// Provider asked us to back off
    #[error("provider rate limited, retry after {retry_after:?}")]
    ProviderRateLimited { retry_after: Duration },

    /// Non-retryable provider failure
    #[error("fatal provider error: {0}")]
    ProviderFatal(String),

    /// The workflow crossed its budget ceiling; the cost is recorded, the
    /// workflow is terminal
    #[error("budget exceeded: consumed {consumed:.2} of ceiling {ceiling:.2}")]
    BudgetExceeded { consumed: f64, ceiling: f64 },

    /// Phase step not permitted by the fixed phase order
    #[error("invalid phase transition: {from:?} -> {to:?}")]
    InvalidTransition { from: Phase, to: Phase },

    /// Unknown workflow id
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl ForgeError {
    /// Whether retry/failover may still absorb this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ForgeError::ProviderTransient(_) | ForgeError::ProviderRateLimited { .. }
        )
    }
}

impl From<String> for ForgeError {
    fn from(s: String) -> Self {
        ForgeError::Other(s)
    }
}

impl From<&str> for ForgeError {
    fn from(s: &str) -> Self {
        ForgeError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for ForgeError {
    fn from(err: anyhow::Error) -> Self {
        ForgeError::Other(err.to_string())
    }
}
