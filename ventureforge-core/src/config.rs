//! Configuration types for the orchestration core

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::provider::circuit_breaker::CircuitBreakerConfig;
use crate::provider::retry::RetryConfig;

/// Main configuration for the orchestration core
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ForgeConfig {
    /// Admission control configuration
    pub registry: RegistryConfig,

    /// Task dispatch configuration
    pub dispatch: DispatchConfig,

    /// Resource ledger configuration
    pub allocator: AllocatorConfig,

    /// Provider retry/backoff configuration
    pub retry: RetryConfig,

    /// Per-provider circuit breaker configuration
    pub circuit: CircuitBreakerConfig,
}

/// Admission control configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Global cap on concurrently running workflow instances
    pub max_running: usize,

    /// Poll interval for blocking admission
    #[serde(with = "humantime_serde")]
    pub admission_backoff: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_running: 8,
            admission_backoff: Duration::from_millis(250),
        }
    }
}

/// Task dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Task-level parallelism bound, independent of the workflow cap
    pub max_in_flight: usize,

    /// Hard timeout applied to every provider call
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 16,
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Resource ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Total compute slots in the global ledger
    pub total_compute_slots: u32,

    /// First port managed by the free-list
    pub port_floor: u16,

    /// Number of ports managed by the free-list
    pub port_span: u16,

    /// Compute slots per workflow when the spec does not say
    pub default_compute_slots: u32,

    /// Ports per workflow
    pub default_port_count: u16,

    /// Budget ceiling per workflow when the spec does not say, in dollars
    pub default_budget_ceiling: f64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            total_compute_slots: 64,
            port_floor: 42000,
            port_span: 2048,
            default_compute_slots: 2,
            default_port_count: 4,
            default_budget_ceiling: 25.0,
        }
    }
}

/// Builder for ForgeConfig
pub struct ConfigBuilder {
    config: ForgeConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ForgeConfig::default(),
        }
    }

    pub fn max_running(mut self, cap: usize) -> Self {
        self.config.registry.max_running = cap;
        self
    }

    pub fn max_in_flight(mut self, limit: usize) -> Self {
        self.config.dispatch.max_in_flight = limit;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.dispatch.call_timeout = timeout;
        self
    }

    pub fn allocator(mut self, config: AllocatorConfig) -> Self {
        self.config.allocator = config;
        self
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.config.retry = config;
        self
    }

    pub fn circuit(mut self, config: CircuitBreakerConfig) -> Self {
        self.config.circuit = config;
        self
    }

    pub fn build(self) -> ForgeConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ForgeConfig {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. Configuration file (ventureforge.toml or path from VENTURE_CONFIG_PATH)
    /// 3. Environment variable overrides (VENTURE_ prefix)
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file is invalid.
    pub fn load() -> crate::error::Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(ForgeConfig::default()))
            .merge(Toml::file("ventureforge.toml"))
            .merge(Env::prefixed("VENTURE_").split("__"));

        if let Ok(path) = std::env::var("VENTURE_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }

        let config: ForgeConfig = figment.extract().map_err(|e| {
            crate::error::ForgeError::Configuration(format!("failed to load configuration: {e}"))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::error::Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Serialized, Toml},
        };

        let config: ForgeConfig = Figment::from(Serialized::defaults(ForgeConfig::default()))
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| {
                crate::error::ForgeError::Configuration(format!(
                    "failed to load configuration file: {e}"
                ))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::ForgeError;

        if self.registry.max_running == 0 {
            return Err(ForgeError::Configuration(
                "registry.max_running must be > 0".into(),
            ));
        }
        if self.dispatch.max_in_flight == 0 {
            return Err(ForgeError::Configuration(
                "dispatch.max_in_flight must be > 0".into(),
            ));
        }
        if self.allocator.port_span < self.allocator.default_port_count {
            return Err(ForgeError::Configuration(
                "allocator.port_span smaller than default_port_count".into(),
            ));
        }
        // Range ends are computed in u16; the span must fit below the top of
        // the port space.
        if self.allocator.port_floor as u32 + self.allocator.port_span as u32 > u16::MAX as u32 {
            return Err(ForgeError::Configuration(format!(
                "allocator port range {}..{} exceeds the u16 port space",
                self.allocator.port_floor,
                self.allocator.port_floor as u32 + self.allocator.port_span as u32
            )));
        }
        if self.allocator.default_compute_slots > self.allocator.total_compute_slots {
            return Err(ForgeError::Configuration(
                "allocator.default_compute_slots exceeds total_compute_slots".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ForgeError::Configuration(
                "retry.max_attempts must be > 0".into(),
            ));
        }
        if self.circuit.failure_threshold == 0 {
            return Err(ForgeError::Configuration(
                "circuit.failure_threshold must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(ForgeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = ForgeConfig::builder()
            .max_running(2)
            .max_in_flight(4)
            .call_timeout(Duration::from_secs(5))
            .build();
        assert_eq!(config.registry.max_running, 2);
        assert_eq!(config.dispatch.max_in_flight, 4);
        assert_eq!(config.dispatch.call_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_zero_cap_rejected() {
        let config = ForgeConfig::builder().max_running(0).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_port_range_past_u16_space_rejected() {
        let mut allocator = AllocatorConfig::default();
        allocator.port_floor = 65000;
        allocator.port_span = 2000;
        let config = ForgeConfig::builder().allocator(allocator).build();
        assert!(config.validate().is_err());

        let mut allocator = AllocatorConfig::default();
        allocator.port_floor = 65000;
        allocator.port_span = 535;
        let config = ForgeConfig::builder().allocator(allocator).build();
        assert!(config.validate().is_ok());
    }
}
