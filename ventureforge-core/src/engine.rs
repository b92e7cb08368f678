//! The orchestration engine
//!
//! [`Forge`] wires the registry, allocator, queue, provider coordinator,
//! scorer, store, and renderer into one façade. Submission is synchronous up
//! to admission; everything after that runs through the dispatch pump.
//!
//! Lock discipline: registry and allocator each release their own lock before
//! the next component is touched, and no lock is ever held across a provider
//! call.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::allocator::ResourceAllocator;
use crate::config::ForgeConfig;
use crate::error::{ForgeError, Result};
use crate::provider::coordinator::ProviderCoordinator;
use crate::provider::{ProviderClient, ProviderHealthSnapshot};
use crate::quality::QualityScorer;
use crate::queue::{QueueProcessor, TaskHandler};
use crate::registry::WorkflowRegistry;
use crate::render::{DeliverableBundle, DeliverableRenderer, NullRenderer};
use crate::store::{MemoryStateStore, StateStore, WorkflowSnapshot};
use crate::task::Task;
use crate::workflow::{Phase, WorkflowInstance, WorkflowSpec, WorkflowStatus, WorkflowSummary};

/// Point-in-time engine counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeStats {
    pub running: usize,
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub queue_depth: usize,
    pub tasks_in_flight: usize,
    pub free_compute_slots: u32,
}

/// Builder for [`Forge`]
pub struct ForgeBuilder {
    config: ForgeConfig,
    providers: Vec<Arc<dyn ProviderClient>>,
    store: Option<Arc<dyn StateStore>>,
    renderer: Option<Arc<dyn DeliverableRenderer>>,
}

impl ForgeBuilder {
    pub fn new() -> Self {
        Self {
            config: ForgeConfig::default(),
            providers: Vec::new(),
            store: None,
            renderer: None,
        }
    }

    pub fn config(mut self, config: ForgeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn provider(mut self, provider: Arc<dyn ProviderClient>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn DeliverableRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn build(self) -> Result<Forge> {
        self.config.validate()?;
        if self.providers.is_empty() {
            return Err(ForgeError::Configuration(
                "at least one provider is required".into(),
            ));
        }
        let allocator = Arc::new(ResourceAllocator::new(self.config.allocator.clone()));
        let coordinator = ProviderCoordinator::new(
            self.providers,
            self.config.retry.clone(),
            self.config.circuit.clone(),
            self.config.dispatch.call_timeout,
            allocator.clone(),
        );
        let inner = Arc::new(ForgeInner {
            registry: WorkflowRegistry::new(self.config.registry.clone()),
            allocator,
            coordinator,
            scorer: QualityScorer::new(),
            store: self.store.unwrap_or_else(|| Arc::new(MemoryStateStore::new())),
            renderer: self.renderer.unwrap_or_else(|| Arc::new(NullRenderer)),
            queue: QueueProcessor::new(self.config.dispatch.max_in_flight),
            outputs: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            config: self.config,
        });
        Ok(Forge { inner })
    }
}

impl Default for ForgeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The orchestration engine façade
#[derive(Clone)]
pub struct Forge {
    inner: Arc<ForgeInner>,
}

impl Forge {
    pub fn builder() -> ForgeBuilder {
        ForgeBuilder::new()
    }

    /// Start the dispatch pump. Call once after construction or recovery.
    pub async fn start(&self) {
        self.inner.queue.start(self.inner.clone()).await;
        info!(
            max_running = self.inner.config.registry.max_running,
            max_in_flight = self.inner.config.dispatch.max_in_flight,
            providers = self.inner.coordinator.provider_count(),
            "engine started"
        );
    }

    /// Stop dispatching. Queued tasks stay queued; in-flight tasks finish.
    pub async fn shutdown(&self) {
        self.inner.queue.stop().await;
        info!("engine stopped");
    }

    /// Submit a new workflow. Validation and admission are synchronous; if
    /// the running cap or the resource pool is full the workflow parks as
    /// pending and is admitted FIFO as capacity frees.
    pub async fn submit_workflow(&self, spec: WorkflowSpec) -> Result<Uuid> {
        let id = self.inner.registry.create(&spec).await?;
        match self.inner.launch(id).await? {
            true => debug!(workflow = %id, "workflow admitted on submit"),
            false => {
                self.inner.registry.park_pending(id).await;
                info!(workflow = %id, "capacity full, workflow parked pending");
            }
        }
        self.inner.persist(id).await?;
        Ok(id)
    }

    /// Cancel a workflow. Takes effect immediately in the registry; an
    /// in-flight provider call is allowed to finish and its result is
    /// discarded. Resources are released exactly once, by the in-flight
    /// task's completion path when one is running, otherwise here.
    pub async fn cancel_workflow(&self, id: Uuid) -> Result<()> {
        self.inner.registry.mark_cancelled(id).await?;
        self.inner.outputs.lock().await.remove(&id);
        let deferred = self.inner.in_flight.lock().await.contains(&id);
        if deferred {
            debug!(workflow = %id, "release deferred to in-flight task");
        } else {
            self.inner.release(id).await;
        }
        self.inner.persist(id).await?;
        self.inner.pump_pending().await;
        Ok(())
    }

    pub async fn get_status(&self, id: Uuid) -> Result<WorkflowSummary> {
        self.inner
            .registry
            .get(id)
            .await
            .map(|wf| wf.summary())
            .ok_or(ForgeError::WorkflowNotFound(id))
    }

    /// Full instance, including task history
    pub async fn get_workflow(&self, id: Uuid) -> Result<WorkflowInstance> {
        self.inner
            .registry
            .get(id)
            .await
            .ok_or(ForgeError::WorkflowNotFound(id))
    }

    pub async fn list_active(&self) -> Vec<WorkflowSummary> {
        self.inner.registry.get_active().await
    }

    pub async fn provider_health(&self) -> Vec<ProviderHealthSnapshot> {
        self.inner.coordinator.health_snapshots().await
    }

    pub async fn stats(&self) -> ForgeStats {
        ForgeStats {
            running: self.inner.registry.running_count().await,
            pending: self.inner.registry.count_by_status(WorkflowStatus::Pending).await,
            completed: self.inner.registry.count_by_status(WorkflowStatus::Completed).await,
            failed: self.inner.registry.count_by_status(WorkflowStatus::Failed).await,
            cancelled: self.inner.registry.count_by_status(WorkflowStatus::Cancelled).await,
            queue_depth: self.inner.queue.depth().await,
            tasks_in_flight: self.inner.queue.in_flight(),
            free_compute_slots: self.inner.allocator.free_compute_slots().await,
        }
    }

    /// Rebuild registry state from the store after a restart.
    ///
    /// Resources held before the crash are gone, so workflows that were
    /// running or blocked are marked failed; pending workflows re-enter the
    /// admission backlog and are admitted once the pump starts.
    pub async fn recover(&self) -> Result<usize> {
        let snapshots = self.inner.store.load_all().await?;
        let mut restored = 0;
        for snapshot in snapshots {
            let mut wf = snapshot.workflow;
            match wf.status {
                WorkflowStatus::Running | WorkflowStatus::Blocked => {
                    wf.status = WorkflowStatus::Failed;
                    wf.failure = Some("interrupted by restart".into());
                    wf.allocation = None;
                    self.inner
                        .store
                        .save(WorkflowSnapshot::of(&wf))
                        .await?;
                    warn!(workflow = %wf.id, "marked interrupted workflow failed");
                }
                _ => {}
            }
            self.inner.registry.restore(wf).await;
            restored += 1;
        }
        self.inner.pump_pending().await;
        info!(restored, "recovery complete");
        Ok(restored)
    }

    pub fn config(&self) -> &ForgeConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for Forge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forge")
            .field("max_running", &self.inner.config.registry.max_running)
            .field("max_in_flight", &self.inner.config.dispatch.max_in_flight)
            .field("providers", &self.inner.coordinator.provider_count())
            .finish()
    }
}

struct ForgeInner {
    config: ForgeConfig,
    registry: WorkflowRegistry,
    allocator: Arc<ResourceAllocator>,
    coordinator: ProviderCoordinator,
    scorer: QualityScorer,
    store: Arc<dyn StateStore>,
    renderer: Arc<dyn DeliverableRenderer>,
    queue: QueueProcessor,
    /// Per-phase outputs collected for the final deliverable
    outputs: Mutex<HashMap<Uuid, BTreeMap<Phase, Value>>>,
    /// Workflows with a task currently in a provider call. Cancellation
    /// defers the resource release to that task's completion path.
    in_flight: Mutex<HashSet<Uuid>>,
}

impl ForgeInner {
    /// Admit a workflow and reserve its resources. Returns `Ok(false)` when
    /// either capacity check fails, leaving the workflow pending.
    async fn launch(&self, id: Uuid) -> Result<bool> {
        let wf = self
            .registry
            .get(id)
            .await
            .ok_or(ForgeError::WorkflowNotFound(id))?;
        if !self.registry.try_admit(id).await? {
            return Ok(false);
        }
        let req = self
            .allocator
            .requirements(wf.compute_slots, wf.budget_ceiling);
        let allocation = match self.allocator.allocate(id, &wf.tenant, &req).await {
            Ok(allocation) => allocation,
            Err(ForgeError::ResourceExhausted(reason)) => {
                debug!(workflow = %id, %reason, "resources unavailable, demoting to pending");
                self.registry.demote_to_pending(id).await?;
                return Ok(false);
            }
            Err(e) => {
                self.registry.demote_to_pending(id).await?;
                return Err(e);
            }
        };
        self.registry.set_allocation(id, Some(allocation)).await?;
        let wf = self
            .registry
            .get(id)
            .await
            .ok_or(ForgeError::WorkflowNotFound(id))?;
        self.enqueue_phase_task(&wf).await;
        Ok(true)
    }

    async fn enqueue_phase_task(&self, wf: &WorkflowInstance) {
        let task = Task::new(wf.id, wf.phase, wf.payload.clone(), wf.priority);
        debug!(workflow = %wf.id, phase = wf.phase.as_str(), task = %task.id, "phase task queued");
        self.queue.enqueue(task).await;
    }

    /// Admit parked workflows while capacity allows, FIFO.
    async fn pump_pending(&self) {
        while let Some(id) = self.registry.next_pending().await {
            match self.launch(id).await {
                Ok(true) => {
                    if let Err(e) = self.persist(id).await {
                        warn!(workflow = %id, error = %e, "persist failed after admission");
                    }
                }
                Ok(false) => {
                    self.registry.park_pending(id).await;
                    break;
                }
                Err(e) => {
                    error!(workflow = %id, error = %e, "failed to launch pending workflow");
                    let _ = self.registry.mark_failed(id, e.to_string()).await;
                    let _ = self.persist(id).await;
                }
            }
        }
    }

    /// Release a workflow's resources. Deallocation is idempotent, so this
    /// is safe to reach from both cancellation and task completion.
    async fn release(&self, id: Uuid) {
        match self.allocator.deallocate(id).await {
            Ok(Some(_)) => debug!(workflow = %id, "resources released"),
            Ok(None) => {}
            Err(e) => warn!(workflow = %id, error = %e, "deallocation failed"),
        }
        if let Err(e) = self.registry.set_allocation(id, None).await {
            debug!(workflow = %id, error = %e, "allocation snapshot not cleared");
        }
    }

    async fn persist(&self, id: Uuid) -> Result<()> {
        let Some(wf) = self.registry.get(id).await else {
            return Err(ForgeError::WorkflowNotFound(id));
        };
        self.store.save(WorkflowSnapshot::of(&wf)).await
    }

    /// Run one phase task end to end. All errors terminate inside; a task
    /// failure must never take the pump down.
    async fn run_task(&self, mut task: Task) {
        let id = task.workflow_id;
        self.in_flight.lock().await.insert(id);

        // Cancellation or failure may have landed while the task sat queued.
        match self.registry.get(id).await {
            Some(wf) if wf.status == WorkflowStatus::Running => {}
            Some(wf) => {
                self.in_flight.lock().await.remove(&id);
                debug!(workflow = %id, status = ?wf.status, "dropping task for inactive workflow");
                if wf.status == WorkflowStatus::Cancelled {
                    // Cancellation may have deferred the release to us.
                    self.release(id).await;
                    if let Err(e) = self.persist(id).await {
                        warn!(workflow = %id, error = %e, "persist failed after cancellation");
                    }
                    self.pump_pending().await;
                }
                return;
            }
            None => {
                self.in_flight.lock().await.remove(&id);
                warn!(workflow = %id, "dropping task for unknown workflow");
                return;
            }
        }

        let dispatched = self.coordinator.dispatch(&mut task).await;
        self.in_flight.lock().await.remove(&id);

        // Re-check: cancellation during the provider call discards the result
        // and the release deferred by cancel happens here.
        if let Some(wf) = self.registry.get(id).await {
            if wf.status == WorkflowStatus::Cancelled {
                info!(workflow = %id, task = %task.id, "workflow cancelled mid-flight, discarding result");
                self.outputs.lock().await.remove(&id);
                self.release(id).await;
                if let Err(e) = self.persist(id).await {
                    warn!(workflow = %id, error = %e, "persist failed after cancellation");
                }
                self.pump_pending().await;
                return;
            }
        }

        match dispatched {
            Ok(output) => self.complete_task(task, output).await,
            Err(e) => self.fail_workflow(task, e).await,
        }
    }

    async fn complete_task(&self, task: Task, output: Value) {
        let id = task.workflow_id;
        let provider = task.provider.clone();

        let quality = self.scorer.score(task.id, task.phase, &output);
        if let Some(provider_id) = provider.as_deref() {
            self.coordinator.record_quality(provider_id, quality.score).await;
        }
        debug!(
            workflow = %id,
            task = %task.id,
            score = quality.score,
            soft_failure = quality.is_soft_failure(),
            "task output scored"
        );

        // The workflow may have gone terminal since the post-dispatch check;
        // the registry rejects records on archived instances, so the result
        // is discarded and any deferred release happens here.
        if let Err(e) = self
            .registry
            .record_task(id, task.record(Some(quality.score)))
            .await
        {
            debug!(workflow = %id, error = %e, "task record rejected, discarding result");
            self.outputs.lock().await.remove(&id);
            self.release(id).await;
            self.pump_pending().await;
            return;
        }
        self.outputs
            .lock()
            .await
            .entry(id)
            .or_default()
            .insert(task.phase, output);

        match task.phase.next() {
            Some(next) => {
                if let Err(e) = self.registry.advance_phase(id, next).await {
                    error!(workflow = %id, error = %e, "phase advance rejected");
                    let _ = self.registry.mark_failed(id, e.to_string()).await;
                    self.release(id).await;
                    self.pump_pending().await;
                } else if let Some(wf) = self.registry.get(id).await {
                    self.enqueue_phase_task(&wf).await;
                }
                if let Err(e) = self.persist(id).await {
                    warn!(workflow = %id, error = %e, "persist failed after phase advance");
                }
            }
            None => self.complete_workflow(id).await,
        }
    }

    /// Final phase done: complete, release, persist, render, admit the next
    /// parked workflow.
    async fn complete_workflow(&self, id: Uuid) {
        if let Err(e) = self.registry.mark_completed(id).await {
            error!(workflow = %id, error = %e, "completion rejected");
            return;
        }
        self.release(id).await;
        if let Err(e) = self.persist(id).await {
            warn!(workflow = %id, error = %e, "persist failed after completion");
        }

        let outputs = self.outputs.lock().await.remove(&id).unwrap_or_default();
        if let Some(wf) = self.registry.get(id).await {
            let bundle = DeliverableBundle::assemble(&wf, &outputs);
            // Rendering is best-effort and never changes workflow status.
            if let Err(e) = self.renderer.render(&bundle).await {
                warn!(workflow = %id, error = %e, "deliverable render failed");
            }
            info!(
                workflow = %id,
                tenant = %wf.tenant,
                total_cost = wf.budget_consumed,
                tasks = wf.history.len(),
                "workflow completed"
            );
        }
        self.pump_pending().await;
    }

    /// Terminal dispatch failure: record what happened, fail the workflow,
    /// release its resources, admit the next parked workflow.
    async fn fail_workflow(&self, task: Task, err: ForgeError) {
        let id = task.workflow_id;
        warn!(workflow = %id, task = %task.id, error = %err, "workflow failed");

        // On a budget crossing the final call succeeded; its record keeps
        // the result and cost even though the workflow terminates.
        if let Err(e) = self.registry.record_task(id, task.record(None)).await {
            debug!(workflow = %id, error = %e, "failure record dropped");
        }
        self.outputs.lock().await.remove(&id);
        let _ = self.registry.mark_failed(id, err.to_string()).await;
        self.release(id).await;
        if let Err(e) = self.persist(id).await {
            warn!(workflow = %id, error = %e, "persist failed after workflow failure");
        }
        self.pump_pending().await;
    }
}

#[async_trait]
impl TaskHandler for ForgeInner {
    async fn handle(&self, task: Task) {
        self.run_task(task).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderError, ProviderResponse};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Succeeds every call with a fixed cost and echoes the payload.
    struct EchoProvider {
        id: String,
        cost: f64,
    }

    impl EchoProvider {
        fn new(id: &str, cost: f64) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                cost,
            })
        }
    }

    #[async_trait]
    impl ProviderClient for EchoProvider {
        fn id(&self) -> &str {
            &self.id
        }

        async fn invoke(
            &self,
            payload: &Value,
            _timeout: Duration,
        ) -> std::result::Result<ProviderResponse, ProviderError> {
            Ok(ProviderResponse {
                output: serde_json::json!({
                    "echo": payload,
                    "analysis": "The proposed venture shows a concrete and reachable early market."
                }),
                cost: self.cost,
            })
        }
    }

    fn forge_with(config: ForgeConfig) -> Forge {
        Forge::builder()
            .config(config)
            .provider(EchoProvider::new("alpha", 0.5))
            .build()
            .unwrap()
    }

    async fn wait_for_terminal(forge: &Forge, id: Uuid) -> WorkflowSummary {
        for _ in 0..200 {
            let status = forge.get_status(id).await.unwrap();
            if status.status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("workflow {id} never reached a terminal status");
    }

    #[tokio::test]
    async fn test_workflow_runs_all_phases_to_completion() {
        let forge = forge_with(ForgeConfig::default());
        forge.start().await;

        let id = forge
            .submit_workflow(
                WorkflowSpec::new("acme", "launch").with_payload(serde_json::json!({"idea": "x"})),
            )
            .await
            .unwrap();
        let status = wait_for_terminal(&forge, id).await;
        assert_eq!(status.status, WorkflowStatus::Completed);

        let wf = forge.get_workflow(id).await.unwrap();
        assert_eq!(wf.history.len(), 4);
        let phases: Vec<Phase> = wf.history.iter().map(|r| r.phase).collect();
        assert_eq!(phases, Phase::ORDER.to_vec());
        // 4 phase calls at 0.5 each.
        assert!((wf.budget_consumed - 2.0).abs() < 1e-9);
        assert!(wf.allocation.is_none());
        forge.shutdown().await;
    }

    #[tokio::test]
    async fn test_submission_with_invalid_spec_fails_fast() {
        let forge = forge_with(ForgeConfig::default());
        let err = forge
            .submit_workflow(WorkflowSpec::new("", "launch"))
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::Validation(_)));
        assert!(forge.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn test_builder_requires_provider() {
        let err = Forge::builder().build().unwrap_err();
        assert!(matches!(err, ForgeError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_stats_reflect_lifecycle() {
        let forge = forge_with(ForgeConfig::default());
        forge.start().await;
        let id = forge
            .submit_workflow(WorkflowSpec::new("acme", "launch"))
            .await
            .unwrap();
        wait_for_terminal(&forge, id).await;

        let stats = forge.stats().await;
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.running, 0);
        assert_eq!(stats.free_compute_slots, forge.config().allocator.total_compute_slots);
        forge.shutdown().await;
    }

    #[tokio::test]
    async fn test_recover_marks_interrupted_workflows_failed() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());

        // Simulate a crashed engine that left a running workflow behind.
        let spec = WorkflowSpec::new("acme", "launch");
        let mut wf = WorkflowInstance::from_spec(&spec);
        wf.status = WorkflowStatus::Running;
        store.save(WorkflowSnapshot::of(&wf)).await.unwrap();

        let forge = Forge::builder()
            .provider(EchoProvider::new("alpha", 0.1))
            .store(store)
            .build()
            .unwrap();
        assert_eq!(forge.recover().await.unwrap(), 1);

        let status = forge.get_status(wf.id).await.unwrap();
        assert_eq!(status.status, WorkflowStatus::Failed);
        assert_eq!(status.failure.as_deref(), Some("interrupted by restart"));
    }
}
