//! Rolling health metrics per provider
//!
//! Feeds provider selection: success rate, latency, and cost are tracked as
//! exponentially weighted moving averages so recent behavior dominates.
//! Low quality scores register as soft failures at reduced weight; they count
//! against the rolling success rate but never toward consecutive failures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::circuit_breaker::CircuitState;

/// EWMA smoothing factor
const ALPHA: f64 = 0.2;

/// Rolling health for one provider
#[derive(Debug, Clone)]
pub struct ProviderHealth {
    pub provider_id: String,

    /// Rolling success rate in [0, 1], starts optimistic
    pub success_rate: f64,

    /// Rolling average call latency
    pub avg_latency: Duration,

    /// Rolling average cost per call, in dollars
    pub avg_cost: f64,

    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub total_failures: u64,
}

impl ProviderHealth {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            success_rate: 1.0,
            avg_latency: Duration::ZERO,
            avg_cost: 0.0,
            consecutive_failures: 0,
            total_calls: 0,
            total_failures: 0,
        }
    }

    pub fn record_success(&mut self, latency: Duration, cost: f64) {
        self.total_calls += 1;
        self.consecutive_failures = 0;
        self.success_rate = ewma(self.success_rate, 1.0, ALPHA);
        self.avg_latency = Duration::from_secs_f64(ewma(
            self.avg_latency.as_secs_f64(),
            latency.as_secs_f64(),
            ALPHA,
        ));
        self.avg_cost = ewma(self.avg_cost, cost, ALPHA);
    }

    pub fn record_failure(&mut self) {
        self.total_calls += 1;
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.success_rate = ewma(self.success_rate, 0.0, ALPHA);
    }

    /// A partial failure from post-hoc quality scoring, weighted below an
    /// outright error (`weight` in [0, 1], typically 0.5)
    pub fn record_soft_failure(&mut self, weight: f64) {
        let weight = weight.clamp(0.0, 1.0);
        self.success_rate = ewma(self.success_rate, 0.0, ALPHA * weight);
    }

    /// Read-only snapshot for observability
    pub fn snapshot(&self, circuit: CircuitState) -> ProviderHealthSnapshot {
        ProviderHealthSnapshot {
            provider_id: self.provider_id.clone(),
            success_rate: self.success_rate,
            avg_latency: self.avg_latency,
            avg_cost: self.avg_cost,
            consecutive_failures: self.consecutive_failures,
            total_calls: self.total_calls,
            total_failures: self.total_failures,
            circuit,
        }
    }
}

/// Serializable provider health view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealthSnapshot {
    pub provider_id: String,
    pub success_rate: f64,
    #[serde(with = "humantime_serde")]
    pub avg_latency: Duration,
    pub avg_cost: f64,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub circuit: CircuitState,
}

fn ewma(current: f64, sample: f64, alpha: f64) -> f64 {
    current * (1.0 - alpha) + sample * alpha
}
