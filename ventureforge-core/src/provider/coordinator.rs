//! Provider selection, dispatch, retry, and failover
//!
//! One coordinator owns the provider set, the per-provider circuit breakers,
//! and the rolling health table. Dispatch runs the full policy for a task:
//! pick the best eligible provider, call it under a hard timeout, classify
//! the failure, back off and retry, fail over after repeated failures on one
//! provider, and account every billed cost against the owning workflow.
//! No lock is held across a provider call.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{ForgeError, Result};
use crate::task::{Task, TaskStatus};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use super::health::{ProviderHealth, ProviderHealthSnapshot};
use super::retry::RetryConfig;
use super::{CostRecorder, ProviderClient, ProviderError, ProviderErrorKind};

/// Selection weights: success rate dominates, then cost, then latency
const W_SUCCESS: f64 = 0.6;
const W_COST: f64 = 0.25;
const W_LATENCY: f64 = 0.15;

/// Quality scores below this register as a soft failure
const QUALITY_SOFT_THRESHOLD: f64 = 0.5;

/// Weight of a soft failure relative to an outright error
const SOFT_FAILURE_WEIGHT: f64 = 0.5;

struct ProviderEntry {
    client: Arc<dyn ProviderClient>,
    breaker: CircuitBreaker,
}

/// Multi-provider dispatch with retry, failover, and circuit breaking
pub struct ProviderCoordinator {
    entries: HashMap<String, ProviderEntry>,
    /// Registration order, for deterministic tie-breaks
    order: Vec<String>,
    health: RwLock<HashMap<String, ProviderHealth>>,
    retry: RetryConfig,
    call_timeout: Duration,
    costs: Arc<dyn CostRecorder>,
}

impl ProviderCoordinator {
    pub fn new(
        providers: Vec<Arc<dyn ProviderClient>>,
        retry: RetryConfig,
        circuit: CircuitBreakerConfig,
        call_timeout: Duration,
        costs: Arc<dyn CostRecorder>,
    ) -> Self {
        let mut entries = HashMap::new();
        let mut order = Vec::new();
        let mut health = HashMap::new();
        for client in providers {
            let id = client.id().to_string();
            health.insert(id.clone(), ProviderHealth::new(&id));
            entries.insert(
                id.clone(),
                ProviderEntry {
                    client,
                    breaker: CircuitBreaker::new(circuit.clone()),
                },
            );
            order.push(id);
        }
        Self {
            entries,
            order,
            health: RwLock::new(health),
            retry,
            call_timeout,
            costs,
        }
    }

    /// Dispatch a task to the best eligible provider, absorbing transient and
    /// rate-limited errors through retry and failover.
    ///
    /// On success the task carries its result, provider, attempts, and cost.
    /// The returned error is the final classified failure: `ProviderFatal`,
    /// `ProviderTransient` once the retry budget is exhausted, or
    /// `BudgetExceeded` when a billed call crossed the workflow's ceiling
    /// (the call's result is still recorded on the task in that case).
    pub async fn dispatch(&self, task: &mut Task) -> Result<serde_json::Value> {
        let mut excluded: HashSet<String> = HashSet::new();
        let mut current: Option<String> = None;
        let mut failures_on_current = 0u32;
        let mut last_message = String::from("no provider attempt made");

        while task.attempts < self.retry.max_attempts {
            let provider_id = match current.clone() {
                Some(id) if self.acquire(&id) => id,
                _ => {
                    let id = match self.select_and_acquire(&excluded).await {
                        Ok(id) => id,
                        // Everything eligible is excluded; failover has run out
                        // of alternatives, so the original provider is back in
                        // play for the remaining retry budget.
                        Err(_) if !excluded.is_empty() => {
                            excluded.clear();
                            self.select_and_acquire(&excluded).await?
                        }
                        Err(e) => return Err(e),
                    };
                    if current.as_deref() != Some(id.as_str()) {
                        failures_on_current = 0;
                    }
                    current = Some(id.clone());
                    id
                }
            };

            let entry = self.entries.get(&provider_id).ok_or_else(|| {
                ForgeError::Configuration(format!("unknown provider: {provider_id}"))
            })?;

            let backoff_index = task.attempts;
            task.attempts += 1;
            task.provider = Some(provider_id.clone());
            task.status = TaskStatus::Dispatched;

            debug!(
                task = %task.id,
                provider = %provider_id,
                attempt = task.attempts,
                "dispatching task"
            );

            let started = Instant::now();
            let outcome = tokio::time::timeout(
                self.call_timeout,
                entry.client.invoke(&task.payload, self.call_timeout),
            )
            .await;
            let latency = started.elapsed();

            let failure = match outcome {
                Ok(Ok(response)) => {
                    entry.breaker.record_success();
                    self.update_health(&provider_id, |h| h.record_success(latency, response.cost))
                        .await;
                    task.cost += response.cost;
                    task.status = TaskStatus::Succeeded;
                    task.result = Some(response.output.clone());
                    // Billed even when it crosses the ceiling; the crossing
                    // surfaces as BudgetExceeded and halts further dispatch
                    // for this workflow.
                    self.costs.record_cost(task.workflow_id, response.cost).await?;
                    return Ok(response.output);
                }
                Ok(Err(err)) => err,
                Err(_) => ProviderError::transient(format!(
                    "provider call timed out after {:?}",
                    self.call_timeout
                )),
            };

            entry.breaker.record_failure();
            self.update_health(&provider_id, |h| h.record_failure()).await;
            warn!(
                task = %task.id,
                provider = %provider_id,
                attempt = task.attempts,
                error = %failure.message,
                "provider call failed"
            );

            if failure.cost > 0.0 {
                task.cost += failure.cost;
                if let Err(e) = self.costs.record_cost(task.workflow_id, failure.cost).await {
                    task.status = TaskStatus::Failed;
                    return Err(e);
                }
            }

            if failure.kind == ProviderErrorKind::Fatal {
                task.status = TaskStatus::Failed;
                return Err(ForgeError::ProviderFatal(failure.message));
            }

            failures_on_current += 1;
            last_message = failure.message;

            if failures_on_current >= self.retry.failover_threshold {
                info!(
                    task = %task.id,
                    provider = %provider_id,
                    failures = failures_on_current,
                    "failing over to next-best provider"
                );
                excluded.insert(provider_id);
                current = None;
            }

            if task.attempts < self.retry.max_attempts {
                let rate_limit = match failure.kind {
                    ProviderErrorKind::RateLimited { retry_after } => Some(retry_after),
                    _ => None,
                };
                tokio::time::sleep(self.retry.next_delay(backoff_index, rate_limit)).await;
            }
        }

        task.status = TaskStatus::Failed;
        Err(ForgeError::ProviderTransient(format!(
            "retry budget exhausted after {} attempts: {last_message}",
            task.attempts
        )))
    }

    /// Feed a post-hoc quality score into the rolling health metric. Low
    /// scores count as a partial failure, weighted below outright errors,
    /// and never toward the circuit's consecutive-failure run.
    pub async fn record_quality(&self, provider_id: &str, score: f64) {
        if score < QUALITY_SOFT_THRESHOLD {
            self.update_health(provider_id, |h| h.record_soft_failure(SOFT_FAILURE_WEIGHT))
                .await;
        }
    }

    /// Health + circuit snapshot per provider, in registration order
    pub async fn health_snapshots(&self) -> Vec<ProviderHealthSnapshot> {
        let health = self.health.read().await;
        self.order
            .iter()
            .filter_map(|id| {
                let entry = self.entries.get(id)?;
                health.get(id).map(|h| h.snapshot(entry.breaker.state()))
            })
            .collect()
    }

    pub fn provider_count(&self) -> usize {
        self.entries.len()
    }

    fn acquire(&self, provider_id: &str) -> bool {
        self.entries
            .get(provider_id)
            .map(|e| e.breaker.try_acquire())
            .unwrap_or(false)
    }

    /// Score all eligible providers and acquire the best one. When every
    /// candidate circuit is open, the least-recently-opened provider is
    /// forced into a single half-open probe.
    async fn select_and_acquire(&self, excluded: &HashSet<String>) -> Result<String> {
        if self.entries.is_empty() {
            return Err(ForgeError::Configuration("no providers registered".into()));
        }

        let mut scored: Vec<(f64, &ProviderEntry)> = Vec::new();
        let mut open: Vec<&ProviderEntry> = Vec::new();
        {
            let health = self.health.read().await;
            for id in &self.order {
                let Some(entry) = self.entries.get(id) else {
                    continue;
                };
                if excluded.contains(id) {
                    continue;
                }
                match entry.breaker.state() {
                    CircuitState::Open => open.push(entry),
                    _ => scored.push((selection_score(health.get(id)), entry)),
                }
            }
        }

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
        for (_, entry) in &scored {
            if entry.breaker.try_acquire() {
                return Ok(entry.client.id().to_string());
            }
        }

        open.sort_by_key(|e| e.breaker.opened_at());
        for entry in open {
            if entry.breaker.begin_probe() {
                debug!(provider = entry.client.id(), "all circuits open, probing half-open");
                return Ok(entry.client.id().to_string());
            }
        }

        Err(ForgeError::ProviderTransient("no provider available".into()))
    }

    async fn update_health<F: FnOnce(&mut ProviderHealth)>(&self, provider_id: &str, f: F) {
        let mut health = self.health.write().await;
        if let Some(h) = health.get_mut(provider_id) {
            f(h);
        }
    }
}

/// Weighted score, higher is better; cost and latency are inverted so cheap
/// and fast providers win
fn selection_score(health: Option<&ProviderHealth>) -> f64 {
    match health {
        Some(h) => {
            let cost_term = 1.0 / (1.0 + h.avg_cost);
            let latency_term = 1.0 / (1.0 + h.avg_latency.as_secs_f64());
            W_SUCCESS * h.success_rate + W_COST * cost_term + W_LATENCY * latency_term
        }
        None => W_SUCCESS + W_COST + W_LATENCY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderResponse;
    use crate::workflow::Phase;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
    use uuid::Uuid;

    type Scripted = std::result::Result<ProviderResponse, ProviderError>;

    struct ScriptedProvider {
        id: String,
        script: Mutex<VecDeque<Scripted>>,
        calls: AtomicU32,
    }

    impl ScriptedProvider {
        fn new(id: &str, script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(AtomicOrdering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderClient for ScriptedProvider {
        fn id(&self) -> &str {
            &self.id
        }

        async fn invoke(
            &self,
            _payload: &serde_json::Value,
            _timeout: Duration,
        ) -> std::result::Result<ProviderResponse, ProviderError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(ProviderResponse {
                output: serde_json::json!({"ok": true}),
                cost: 0.01,
            }))
        }
    }

    struct TestLedger {
        consumed: Mutex<f64>,
        ceiling: f64,
    }

    impl TestLedger {
        fn unlimited() -> Arc<Self> {
            Arc::new(Self {
                consumed: Mutex::new(0.0),
                ceiling: f64::MAX,
            })
        }

        fn with_ceiling(ceiling: f64) -> Arc<Self> {
            Arc::new(Self {
                consumed: Mutex::new(0.0),
                ceiling,
            })
        }
    }

    #[async_trait]
    impl CostRecorder for TestLedger {
        async fn record_cost(&self, _workflow_id: Uuid, cost: f64) -> Result<f64> {
            let mut consumed = self.consumed.lock().unwrap();
            *consumed += cost;
            if *consumed > self.ceiling {
                return Err(ForgeError::BudgetExceeded {
                    consumed: *consumed,
                    ceiling: self.ceiling,
                });
            }
            Ok(*consumed)
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig::default()
            .with_max_attempts(4)
            .with_initial_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(2))
            .with_jitter(false)
            .with_failover_threshold(3)
    }

    fn ok_response() -> Scripted {
        Ok(ProviderResponse {
            output: serde_json::json!({"ok": true}),
            cost: 0.01,
        })
    }

    fn task() -> Task {
        Task::new(Uuid::new_v4(), Phase::Discovery, serde_json::json!({}), 5)
    }

    #[tokio::test]
    async fn test_dispatch_success_first_try() {
        let p = ScriptedProvider::new("alpha", vec![ok_response()]);
        let coordinator = ProviderCoordinator::new(
            vec![p.clone()],
            fast_retry(),
            CircuitBreakerConfig::default(),
            Duration::from_secs(1),
            TestLedger::unlimited(),
        );

        let mut t = task();
        let output = coordinator.dispatch(&mut t).await.unwrap();
        assert_eq!(output["ok"], true);
        assert_eq!(t.status, TaskStatus::Succeeded);
        assert_eq!(t.attempts, 1);
        assert_eq!(t.provider.as_deref(), Some("alpha"));
        assert!(t.cost > 0.0);
    }

    #[tokio::test]
    async fn test_failover_after_consecutive_failures() {
        // P1 fails three times transiently, then failover to P2 which succeeds.
        let p1 = ScriptedProvider::new(
            "p1",
            vec![
                Err(ProviderError::transient("boom")),
                Err(ProviderError::transient("boom")),
                Err(ProviderError::transient("boom")),
            ],
        );
        let p2 = ScriptedProvider::new("p2", vec![ok_response()]);
        let coordinator = ProviderCoordinator::new(
            vec![p1.clone(), p2.clone()],
            fast_retry(),
            CircuitBreakerConfig::default(),
            Duration::from_secs(1),
            TestLedger::unlimited(),
        );

        let mut t = task();
        coordinator.dispatch(&mut t).await.unwrap();

        assert_eq!(p1.calls(), 3);
        assert_eq!(p2.calls(), 1);
        assert_eq!(t.provider.as_deref(), Some("p2"));
        assert_eq!(t.attempts, 4);

        let snapshots = coordinator.health_snapshots().await;
        let h1 = snapshots.iter().find(|s| s.provider_id == "p1").unwrap();
        let h2 = snapshots.iter().find(|s| s.provider_id == "p2").unwrap();
        assert_eq!(h1.consecutive_failures, 3);
        assert_eq!(h2.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_fatal_error_fails_immediately() {
        let p = ScriptedProvider::new("alpha", vec![Err(ProviderError::fatal("bad request"))]);
        let coordinator = ProviderCoordinator::new(
            vec![p.clone()],
            fast_retry(),
            CircuitBreakerConfig::default(),
            Duration::from_secs(1),
            TestLedger::unlimited(),
        );

        let mut t = task();
        let err = coordinator.dispatch(&mut t).await.unwrap_err();
        assert!(matches!(err, ForgeError::ProviderFatal(_)));
        assert_eq!(p.calls(), 1);
        assert_eq!(t.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion() {
        let p = ScriptedProvider::new(
            "alpha",
            vec![
                Err(ProviderError::transient("1")),
                Err(ProviderError::transient("2")),
                Err(ProviderError::transient("3")),
                Err(ProviderError::transient("4")),
            ],
        );
        let coordinator = ProviderCoordinator::new(
            vec![p.clone()],
            fast_retry(),
            CircuitBreakerConfig::default(),
            Duration::from_secs(1),
            TestLedger::unlimited(),
        );

        let mut t = task();
        let err = coordinator.dispatch(&mut t).await.unwrap_err();
        assert!(matches!(err, ForgeError::ProviderTransient(_)));
        assert_eq!(t.attempts, 4);
        assert_eq!(t.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_budget_exceeded_surfaces_with_result_recorded() {
        let p = ScriptedProvider::new(
            "alpha",
            vec![Ok(ProviderResponse {
                output: serde_json::json!({"deliverable": "x"}),
                cost: 5.0,
            })],
        );
        let ledger = TestLedger::with_ceiling(4.0);
        let coordinator = ProviderCoordinator::new(
            vec![p],
            fast_retry(),
            CircuitBreakerConfig::default(),
            Duration::from_secs(1),
            ledger.clone(),
        );

        let mut t = task();
        let err = coordinator.dispatch(&mut t).await.unwrap_err();
        assert!(matches!(err, ForgeError::BudgetExceeded { .. }));
        // The call itself succeeded and its cost was recorded.
        assert_eq!(t.status, TaskStatus::Succeeded);
        assert!(t.result.is_some());
        assert_eq!(*ledger.consumed.lock().unwrap(), 5.0);
    }

    #[tokio::test]
    async fn test_all_circuits_open_probes_least_recently_opened() {
        // Threshold 1 and failover after every failure: both circuits open,
        // then the least-recently-opened (p1) is probed half-open and its
        // success closes the circuit.
        let p1 = ScriptedProvider::new(
            "p1",
            vec![Err(ProviderError::transient("down")), ok_response()],
        );
        let p2 = ScriptedProvider::new("p2", vec![Err(ProviderError::transient("down"))]);
        let retry = fast_retry().with_failover_threshold(1);
        let circuit = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_base_cooldown(Duration::from_secs(3600));
        let coordinator = ProviderCoordinator::new(
            vec![p1.clone(), p2.clone()],
            retry,
            circuit,
            Duration::from_secs(1),
            TestLedger::unlimited(),
        );

        let mut t = task();
        coordinator.dispatch(&mut t).await.unwrap();

        assert_eq!(p1.calls(), 2);
        assert_eq!(p2.calls(), 1);
        assert_eq!(t.provider.as_deref(), Some("p1"));

        let snapshots = coordinator.health_snapshots().await;
        let s1 = snapshots.iter().find(|s| s.provider_id == "p1").unwrap();
        let s2 = snapshots.iter().find(|s| s.provider_id == "p2").unwrap();
        assert_eq!(s1.circuit, CircuitState::Closed);
        assert_eq!(s2.circuit, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_timeout_is_transient_and_retried() {
        struct SlowThenFast {
            calls: AtomicU32,
        }

        #[async_trait]
        impl ProviderClient for SlowThenFast {
            fn id(&self) -> &str {
                "slow"
            }

            async fn invoke(
                &self,
                _payload: &serde_json::Value,
                _timeout: Duration,
            ) -> std::result::Result<ProviderResponse, ProviderError> {
                if self.calls.fetch_add(1, AtomicOrdering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok(ProviderResponse {
                    output: serde_json::json!({"ok": true}),
                    cost: 0.0,
                })
            }
        }

        let coordinator = ProviderCoordinator::new(
            vec![Arc::new(SlowThenFast {
                calls: AtomicU32::new(0),
            })],
            fast_retry(),
            CircuitBreakerConfig::default(),
            Duration::from_millis(20),
            TestLedger::unlimited(),
        );

        let mut t = task();
        coordinator.dispatch(&mut t).await.unwrap();
        assert_eq!(t.attempts, 2);
    }

    #[tokio::test]
    async fn test_rate_limit_delay_is_honored() {
        let p = ScriptedProvider::new(
            "alpha",
            vec![
                Err(ProviderError::rate_limited("slow down", Duration::from_millis(40))),
                ok_response(),
            ],
        );
        let coordinator = ProviderCoordinator::new(
            vec![p],
            fast_retry(),
            CircuitBreakerConfig::default(),
            Duration::from_secs(1),
            TestLedger::unlimited(),
        );

        let mut t = task();
        let started = Instant::now();
        coordinator.dispatch(&mut t).await.unwrap();
        // Waited at least the provider-specified delay, not the 1ms backoff.
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(t.attempts, 2);
    }
}
