//! External AI provider dispatch
//!
//! The provider call itself is an opaque collaborator behind the
//! [`ProviderClient`] trait; this module owns everything around it:
//! health-scored selection, retry with backoff, failover, per-provider
//! circuit breaking, and cost accounting.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;

pub mod circuit_breaker;
pub mod coordinator;
pub mod health;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use coordinator::ProviderCoordinator;
pub use health::{ProviderHealth, ProviderHealthSnapshot};
pub use retry::RetryConfig;

/// Classified provider failure
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    /// Cost billed for the failed call, usually zero
    pub cost: f64,
}

/// How a provider failure should be handled
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProviderErrorKind {
    /// Retryable after backoff (includes timeouts)
    Transient,
    /// Retryable after the provider-specified delay
    RateLimited { retry_after: Duration },
    /// Not retryable; fails the task immediately
    Fatal,
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Transient,
            message: message.into(),
            cost: 0.0,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Duration) -> Self {
        Self {
            kind: ProviderErrorKind::RateLimited { retry_after },
            message: message.into(),
            cost: 0.0,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Fatal,
            message: message.into(),
            cost: 0.0,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

/// Successful provider response
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    /// Opaque result content
    pub output: serde_json::Value,
    /// Cost billed for this call, in dollars
    pub cost: f64,
}

/// The opaque external AI call. Implementations handle the actual provider
/// request/response; the coordinator never inspects payloads.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Stable provider identifier
    fn id(&self) -> &str;

    /// Invoke the provider. The coordinator additionally enforces `timeout`
    /// as a hard deadline around this call.
    async fn invoke(
        &self,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> std::result::Result<ProviderResponse, ProviderError>;
}

/// Sink for billed costs. Implemented by the resource allocator; kept as a
/// trait so dispatch never depends on the ledger directly.
///
/// Returns the cumulative consumed budget, or `BudgetExceeded` when this
/// recording crossed the ceiling (the cost is recorded either way).
#[async_trait]
pub trait CostRecorder: Send + Sync {
    async fn record_cost(&self, workflow_id: Uuid, cost: f64) -> Result<f64>;
}

#[async_trait]
impl CostRecorder for crate::allocator::ResourceAllocator {
    async fn record_cost(&self, workflow_id: Uuid, cost: f64) -> Result<f64> {
        crate::allocator::ResourceAllocator::record_cost(self, workflow_id, cost).await
    }
}
