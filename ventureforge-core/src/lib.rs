//! # VentureForge - Workflow Orchestration Core
//!
//! VentureForge runs multi-phase venture-building workflows against external
//! AI providers:
//! - Admission control with a hard cap on concurrently running workflows
//! - All-or-nothing resource reservation (compute slots, port ranges,
//!   storage namespaces, budget ceilings)
//! - A priority task queue with a bounded dispatch pump
//! - Multi-provider dispatch with retry, failover, and per-provider
//!   circuit breaking
//! - Deterministic post-hoc quality scoring that feeds provider selection
//! - Write-through state persistence and crash recovery
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ventureforge_core::prelude::*;
//! # use std::time::Duration;
//! # struct MyProvider;
//! # #[async_trait::async_trait]
//! # impl ProviderClient for MyProvider {
//! #     fn id(&self) -> &str { "my-provider" }
//! #     async fn invoke(&self, _p: &serde_json::Value, _t: Duration)
//! #         -> std::result::Result<ProviderResponse, ProviderError> { unimplemented!() }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let forge = Forge::builder()
//!         .config(ForgeConfig::load()?)
//!         .provider(Arc::new(MyProvider))
//!         .build()?;
//!     forge.start().await;
//!
//!     let id = forge
//!         .submit_workflow(WorkflowSpec::new("acme", "meal-kit-launch"))
//!         .await?;
//!     let status = forge.get_status(id).await?;
//!     println!("workflow {id} is {:?}", status.status);
//!
//!     forge.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod allocator;
pub mod config;
pub mod engine;
pub mod error;
pub mod provider;
pub mod quality;
pub mod queue;
pub mod registry;
pub mod render;
pub mod store;
pub mod task;
pub mod workflow;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize tracing with an env-filter (`RUST_LOG` style). Safe to call
/// once at process start; library code never installs a subscriber itself.
pub fn init_tracing(default_directive: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Re-export commonly used types
pub mod prelude {
    pub use crate::allocator::{ResourceAllocation, ResourceAllocator, ResourceRequirements};
    pub use crate::config::{
        AllocatorConfig, ConfigBuilder, DispatchConfig, ForgeConfig, RegistryConfig,
    };
    pub use crate::engine::{Forge, ForgeBuilder, ForgeStats};
    pub use crate::error::{ForgeError, Result};
    pub use crate::provider::{
        CircuitBreakerConfig, CircuitState, CostRecorder, ProviderClient, ProviderCoordinator,
        ProviderError, ProviderErrorKind, ProviderHealthSnapshot, ProviderResponse, RetryConfig,
    };
    pub use crate::quality::{QualityRecord, QualityScorer};
    pub use crate::queue::{QueueProcessor, TaskHandler};
    pub use crate::registry::WorkflowRegistry;
    pub use crate::render::{DeliverableBundle, DeliverableRenderer, NullRenderer};
    pub use crate::store::{MemoryStateStore, StateStore, WorkflowSnapshot};
    pub use crate::task::{Task, TaskStatus};
    pub use crate::workflow::{
        Phase, TaskRecord, WorkflowInstance, WorkflowSpec, WorkflowStatus, WorkflowSummary,
    };
}
