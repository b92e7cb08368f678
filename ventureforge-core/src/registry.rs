//! Workflow registry: admission control and the phase state machine
//!
//! The registry is the only mutator of workflow instances. The capacity
//! check-and-increment runs as a single atomic step under the registry
//! mutex, so admissions can never race past the cap. Terminal workflows are
//! archived in place, never deleted.

use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::allocator::ResourceAllocation;
use crate::config::RegistryConfig;
use crate::error::{ForgeError, Result};
use crate::workflow::{Phase, TaskRecord, WorkflowInstance, WorkflowSpec, WorkflowStatus, WorkflowSummary};

#[derive(Debug, Default)]
struct RegistryState {
    workflows: HashMap<Uuid, WorkflowInstance>,
    running: usize,
    /// Submissions waiting for a running slot, admitted FIFO
    pending: VecDeque<Uuid>,
}

/// Admission control and phase state machine for workflow instances
pub struct WorkflowRegistry {
    config: RegistryConfig,
    state: Mutex<RegistryState>,
}

impl WorkflowRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Create a workflow instance from a validated spec. Fails with
    /// `Validation` on malformed input without mutating any state.
    pub async fn create(&self, spec: &WorkflowSpec) -> Result<Uuid> {
        spec.validate()?;
        let instance = WorkflowInstance::from_spec(spec);
        let id = instance.id;
        let mut state = self.state.lock().await;
        state.workflows.insert(id, instance);
        debug!(workflow = %id, tenant = %spec.tenant, "workflow created");
        Ok(id)
    }

    /// Insert a pre-built instance, used by crash recovery.
    pub async fn restore(&self, instance: WorkflowInstance) {
        let mut state = self.state.lock().await;
        if instance.status == WorkflowStatus::Pending {
            state.pending.push_back(instance.id);
        }
        state.workflows.insert(instance.id, instance);
    }

    /// Try to admit a pending workflow. The capacity check and the increment
    /// happen atomically under the registry lock; returns `false` when the
    /// cap is full.
    pub async fn try_admit(&self, id: Uuid) -> Result<bool> {
        let mut state = self.state.lock().await;
        let cap = self.config.max_running;
        if state.running >= cap {
            return Ok(false);
        }
        let wf = state
            .workflows
            .get_mut(&id)
            .ok_or(ForgeError::WorkflowNotFound(id))?;
        if wf.status != WorkflowStatus::Pending {
            return Err(ForgeError::Validation(format!(
                "workflow {id} is {:?}, only pending workflows can be admitted",
                wf.status
            )));
        }
        wf.status = WorkflowStatus::Running;
        wf.updated_at = Utc::now();
        state.running += 1;
        debug!(workflow = %id, running = state.running, "workflow admitted");
        Ok(true)
    }

    /// Admit or fail immediately with `ConcurrencyLimitExceeded`.
    pub async fn admit(&self, id: Uuid) -> Result<()> {
        if self.try_admit(id).await? {
            Ok(())
        } else {
            Err(ForgeError::ConcurrencyLimitExceeded)
        }
    }

    /// Admit, blocking with backoff until a slot frees or the deadline passes.
    pub async fn admit_waiting(&self, id: Uuid, deadline: std::time::Duration) -> Result<()> {
        let started = std::time::Instant::now();
        loop {
            if self.try_admit(id).await? {
                return Ok(());
            }
            if started.elapsed() >= deadline {
                return Err(ForgeError::ConcurrencyLimitExceeded);
            }
            tokio::time::sleep(self.config.admission_backoff).await;
        }
    }

    /// Park a pending workflow in the FIFO admission backlog.
    pub async fn park_pending(&self, id: Uuid) {
        let mut state = self.state.lock().await;
        if !state.pending.contains(&id) {
            state.pending.push_back(id);
        }
    }

    /// Pop the next parked workflow that is still pending.
    pub async fn next_pending(&self) -> Option<Uuid> {
        let mut state = self.state.lock().await;
        while let Some(id) = state.pending.pop_front() {
            match state.workflows.get(&id) {
                Some(wf) if wf.status == WorkflowStatus::Pending => return Some(id),
                _ => continue,
            }
        }
        None
    }

    /// Undo an admission whose resource reservation failed: the workflow goes
    /// back to pending and its running slot is returned.
    pub async fn demote_to_pending(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        let wf = state
            .workflows
            .get_mut(&id)
            .ok_or(ForgeError::WorkflowNotFound(id))?;
        if wf.status == WorkflowStatus::Running {
            wf.status = WorkflowStatus::Pending;
            wf.updated_at = Utc::now();
            state.running = state.running.saturating_sub(1);
        }
        Ok(())
    }

    /// Advance a running workflow to the next phase. Illegal steps fail with
    /// `InvalidTransition` and mutate nothing.
    pub async fn advance_phase(&self, id: Uuid, next: Phase) -> Result<()> {
        let mut state = self.state.lock().await;
        let wf = state
            .workflows
            .get_mut(&id)
            .ok_or(ForgeError::WorkflowNotFound(id))?;
        if wf.status != WorkflowStatus::Running {
            return Err(ForgeError::Validation(format!(
                "workflow {id} is {:?}, cannot advance phase",
                wf.status
            )));
        }
        if wf.phase.next() != Some(next) {
            return Err(ForgeError::InvalidTransition {
                from: wf.phase,
                to: next,
            });
        }
        debug!(workflow = %id, from = wf.phase.as_str(), to = next.as_str(), "phase advanced");
        wf.phase = next;
        wf.updated_at = Utc::now();
        Ok(())
    }

    pub async fn mark_completed(&self, id: Uuid) -> Result<()> {
        self.transition(id, WorkflowStatus::Completed, None).await
    }

    pub async fn mark_failed(&self, id: Uuid, reason: impl Into<String>) -> Result<()> {
        self.transition(id, WorkflowStatus::Failed, Some(reason.into()))
            .await
    }

    /// Cancellation is immediate in the registry; in-flight work is allowed
    /// to finish elsewhere and its result discarded.
    pub async fn mark_cancelled(&self, id: Uuid) -> Result<()> {
        self.transition(id, WorkflowStatus::Cancelled, None).await
    }

    /// Block a running workflow; it keeps its resources but stops counting
    /// against the running cap and receives no further dispatch.
    pub async fn mark_blocked(&self, id: Uuid) -> Result<()> {
        self.transition(id, WorkflowStatus::Blocked, None).await
    }

    async fn transition(&self, id: Uuid, to: WorkflowStatus, reason: Option<String>) -> Result<()> {
        let mut state = self.state.lock().await;
        let wf = state
            .workflows
            .get_mut(&id)
            .ok_or(ForgeError::WorkflowNotFound(id))?;
        if wf.status.is_terminal() {
            return Err(ForgeError::Validation(format!(
                "workflow {id} is already terminal ({:?})",
                wf.status
            )));
        }
        let was_running = wf.status == WorkflowStatus::Running;
        wf.status = to;
        wf.failure = reason;
        wf.updated_at = Utc::now();
        if was_running && to != WorkflowStatus::Running {
            state.running = state.running.saturating_sub(1);
        }
        info!(workflow = %id, status = ?to, "workflow status changed");
        Ok(())
    }

    /// Append a task history entry and fold its cost into the instance.
    /// Terminal workflows are archived and reject records; the caller treats
    /// that as the discard path.
    pub async fn record_task(&self, id: Uuid, record: TaskRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        let wf = state
            .workflows
            .get_mut(&id)
            .ok_or(ForgeError::WorkflowNotFound(id))?;
        if wf.status.is_terminal() {
            return Err(ForgeError::Validation(format!(
                "workflow {id} is {:?}, task record rejected",
                wf.status
            )));
        }
        wf.budget_consumed += record.cost;
        wf.retry_count += record.attempts.saturating_sub(1);
        wf.history.push(record);
        wf.updated_at = Utc::now();
        Ok(())
    }

    /// Attach or clear the allocation snapshot on an instance.
    pub async fn set_allocation(&self, id: Uuid, allocation: Option<ResourceAllocation>) -> Result<()> {
        let mut state = self.state.lock().await;
        let wf = state
            .workflows
            .get_mut(&id)
            .ok_or(ForgeError::WorkflowNotFound(id))?;
        wf.allocation = allocation;
        wf.updated_at = Utc::now();
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Option<WorkflowInstance> {
        let state = self.state.lock().await;
        state.workflows.get(&id).cloned()
    }

    /// Summaries of all non-terminal workflows
    pub async fn get_active(&self) -> Vec<WorkflowSummary> {
        let state = self.state.lock().await;
        let mut active: Vec<WorkflowSummary> = state
            .workflows
            .values()
            .filter(|wf| !wf.status.is_terminal())
            .map(|wf| wf.summary())
            .collect();
        active.sort_by_key(|s| s.created_at);
        active
    }

    pub async fn running_count(&self) -> usize {
        self.state.lock().await.running
    }

    pub async fn count_by_status(&self, status: WorkflowStatus) -> usize {
        let state = self.state.lock().await;
        state
            .workflows
            .values()
            .filter(|wf| wf.status == status)
            .count()
    }
}
