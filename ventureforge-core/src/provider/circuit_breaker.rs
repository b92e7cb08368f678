//! Per-provider circuit breaker
//!
//! Halts traffic to a consistently failing provider. The circuit opens after
//! K consecutive failures, allows exactly one half-open probe after the
//! cool-down elapses, closes on probe success, and re-opens on probe failure
//! with an exponentially growing cool-down.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed,
    /// Circuit open - requests are rejected
    Open,
    /// Testing if the provider recovered; a single probe may be in flight
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// Cool-down after the first open
    #[serde(with = "humantime_serde")]
    pub base_cooldown: Duration,

    /// Cool-down growth cap
    #[serde(with = "humantime_serde")]
    pub max_cooldown: Duration,

    /// Cool-down multiplier applied on each re-open
    pub cooldown_multiplier: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            base_cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(600),
            cooldown_multiplier: 2.0,
        }
    }
}

impl CircuitBreakerConfig {
    /// Builder: set failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Builder: set base cool-down
    pub fn with_base_cooldown(mut self, cooldown: Duration) -> Self {
        self.base_cooldown = cooldown;
        self
    }
}

/// Tagged breaker state; every field only makes sense together, so the whole
/// thing lives behind one mutex rather than separate atomics.
#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    current_cooldown: Duration,
    probe_in_flight: bool,
}

/// Circuit breaker for one provider
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let current_cooldown = config.base_cooldown;
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                current_cooldown,
                probe_in_flight: false,
            }),
        }
    }

    /// Get current state, applying the open → half-open transition when the
    /// cool-down has elapsed
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().unwrap();
        Self::maybe_half_open(&mut inner);
        inner.state
    }

    /// Try to pass a request through. Closed always passes; half-open passes
    /// only while no probe is in flight and marks the probe as taken.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        Self::maybe_half_open(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Force a half-open probe on an open circuit, ignoring the cool-down.
    /// Used when every provider's circuit is open and the least-recently
    /// opened one must be tried anyway. Returns false if a probe is already
    /// in flight or the circuit is not open.
    pub fn begin_probe(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Open => {
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;
                true
            }
            CircuitState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                true
            }
            _ => false,
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
        inner.current_cooldown = self.config.base_cooldown;
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures += 1;
        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                // Probe failed: re-open with a longer cool-down.
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                let grown = inner.current_cooldown.as_secs_f64() * self.config.cooldown_multiplier;
                inner.current_cooldown =
                    Duration::from_secs_f64(grown).min(self.config.max_cooldown);
            }
            CircuitState::Open => {}
        }
    }

    /// When the circuit opened, if it is open or probing
    pub fn opened_at(&self) -> Option<Instant> {
        self.inner.lock().unwrap().opened_at
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().unwrap().consecutive_failures
    }

    /// Cool-down currently in effect
    pub fn current_cooldown(&self) -> Duration {
        self.inner.lock().unwrap().current_cooldown
    }

    fn maybe_half_open(inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open {
            if let Some(opened) = inner.opened_at {
                if opened.elapsed() >= inner.current_cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = false;
                }
            }
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("CircuitBreaker")
            .field("state", &inner.state)
            .field("consecutive_failures", &inner.consecutive_failures)
            .field("current_cooldown", &inner.current_cooldown)
            .finish()
    }
}
