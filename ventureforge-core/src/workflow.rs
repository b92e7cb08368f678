//! Workflow instance data model
//!
//! A workflow instance is one end-to-end pipeline run for one tenant. It moves
//! through the fixed phase order Discovery → Design → Build → Validate and is
//! mutated only by the registry; terminal instances are archived in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::allocator::ResourceAllocation;
use crate::error::{ForgeError, Result};
use crate::task::TaskStatus;

/// Ordered pipeline phases; the derived ordering follows execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Discovery,
    Design,
    Build,
    Validate,
}

impl Phase {
    /// Phases in execution order
    pub const ORDER: [Phase; 4] = [Phase::Discovery, Phase::Design, Phase::Build, Phase::Validate];

    /// The first phase of every workflow
    pub fn first() -> Phase {
        Phase::Discovery
    }

    /// Successor phase, or `None` after the last phase
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Discovery => Some(Phase::Design),
            Phase::Design => Some(Phase::Build),
            Phase::Build => Some(Phase::Validate),
            Phase::Validate => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Discovery => "discovery",
            Phase::Design => "design",
            Phase::Build => "build",
            Phase::Validate => "validate",
        }
    }
}

/// Workflow lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    /// Admitted to the registry but waiting for a running slot
    Pending,
    /// Counted against the concurrency cap, tasks may dispatch
    Running,
    /// Holding resources but not dispatching (e.g. budget hold)
    Blocked,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Terminal statuses are archived and never mutated again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

/// Submission input for a new workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    /// Owning tenant
    pub tenant: String,

    /// Human-readable workflow name
    pub name: String,

    /// Numeric priority, lower is served first
    #[serde(default)]
    pub priority: u8,

    /// Budget ceiling override; allocator default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_ceiling: Option<f64>,

    /// Compute slot override; allocator default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_slots: Option<u32>,

    /// Opaque request payload carried into every phase task
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl WorkflowSpec {
    pub fn new(tenant: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            name: name.into(),
            priority: 10,
            budget_ceiling: None,
            compute_slots: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_budget_ceiling(mut self, ceiling: f64) -> Self {
        self.budget_ceiling = Some(ceiling);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Validate submission input. Errors here surface synchronously and
    /// never mutate registry state.
    pub fn validate(&self) -> Result<()> {
        if self.tenant.trim().is_empty() {
            return Err(ForgeError::Validation("tenant must not be empty".into()));
        }
        if self.name.trim().is_empty() {
            return Err(ForgeError::Validation("name must not be empty".into()));
        }
        if let Some(ceiling) = self.budget_ceiling {
            if !ceiling.is_finite() || ceiling <= 0.0 {
                return Err(ForgeError::Validation(format!(
                    "budget ceiling must be positive, got {ceiling}"
                )));
            }
        }
        if let Some(slots) = self.compute_slots {
            if slots == 0 {
                return Err(ForgeError::Validation("compute_slots must be > 0".into()));
            }
        }
        Ok(())
    }
}

/// One entry in a workflow's ordered task history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub phase: Phase,
    pub provider: Option<String>,
    pub status: TaskStatus,
    pub attempts: u32,
    pub cost: f64,
    pub score: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

/// A single workflow instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub tenant: String,
    pub name: String,
    pub phase: Phase,
    pub status: WorkflowStatus,
    pub priority: u8,

    /// Requested budget ceiling override from the spec
    pub budget_ceiling: Option<f64>,

    /// Requested compute slot override from the spec
    pub compute_slots: Option<u32>,

    /// Snapshot of the reservation while the workflow holds resources
    pub allocation: Option<ResourceAllocation>,

    /// Cumulative cost, monotonic
    pub budget_consumed: f64,

    pub retry_count: u32,

    /// Ordered task history log
    pub history: Vec<TaskRecord>,

    /// Reason recorded on terminal failure
    pub failure: Option<String>,

    pub payload: serde_json::Value,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    pub fn from_spec(spec: &WorkflowSpec) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant: spec.tenant.clone(),
            name: spec.name.clone(),
            phase: Phase::first(),
            status: WorkflowStatus::Pending,
            priority: spec.priority,
            budget_ceiling: spec.budget_ceiling,
            compute_slots: spec.compute_slots,
            allocation: None,
            budget_consumed: 0.0,
            retry_count: 0,
            history: Vec::new(),
            failure: None,
            payload: spec.payload.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            id: self.id,
            tenant: self.tenant.clone(),
            name: self.name.clone(),
            phase: self.phase,
            status: self.status,
            budget_consumed: self.budget_consumed,
            task_count: self.history.len(),
            failure: self.failure.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Read-only view returned by status and listing operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: Uuid,
    pub tenant: String,
    pub name: String,
    pub phase: Phase,
    pub status: WorkflowStatus,
    pub budget_consumed: f64,
    pub task_count: usize,
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order() {
        assert_eq!(Phase::first(), Phase::Discovery);
        assert_eq!(Phase::Discovery.next(), Some(Phase::Design));
        assert_eq!(Phase::Design.next(), Some(Phase::Build));
        assert_eq!(Phase::Build.next(), Some(Phase::Validate));
        assert_eq!(Phase::Validate.next(), None);
    }

    #[test]
    fn test_phase_sort_matches_execution_order() {
        let mut phases = vec![Phase::Validate, Phase::Build, Phase::Discovery, Phase::Design];
        phases.sort();
        assert_eq!(phases, Phase::ORDER.to_vec());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
        assert!(!WorkflowStatus::Pending.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(!WorkflowStatus::Blocked.is_terminal());
    }

    #[test]
    fn test_spec_validation() {
        assert!(WorkflowSpec::new("acme", "launch").validate().is_ok());
        assert!(WorkflowSpec::new("", "launch").validate().is_err());
        assert!(WorkflowSpec::new("acme", "  ").validate().is_err());
        assert!(WorkflowSpec::new("acme", "launch")
            .with_budget_ceiling(-5.0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_instance_from_spec() {
        let spec = WorkflowSpec::new("acme", "launch").with_priority(3);
        let wf = WorkflowInstance::from_spec(&spec);
        assert_eq!(wf.status, WorkflowStatus::Pending);
        assert_eq!(wf.phase, Phase::Discovery);
        assert_eq!(wf.priority, 3);
        assert!(wf.history.is_empty());
        assert_eq!(wf.budget_consumed, 0.0);
    }
}
