//! Task unit dispatched to an external AI provider

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{Phase, TaskRecord};

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Dispatched,
    Succeeded,
    Failed,
}

/// One unit of work within a phase, dispatched to an external provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub phase: Phase,

    /// Opaque request payload passed through to the provider
    pub payload: serde_json::Value,

    /// Numeric priority, lower is served first
    pub priority: u8,

    /// Provider that handled the final attempt
    pub provider: Option<String>,

    pub attempts: u32,
    pub status: TaskStatus,

    /// Provider output on success
    pub result: Option<serde_json::Value>,

    /// Cumulative cost billed across all attempts
    pub cost: f64,

    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(workflow_id: Uuid, phase: Phase, payload: serde_json::Value, priority: u8) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            phase,
            payload,
            priority,
            provider: None,
            attempts: 0,
            status: TaskStatus::Queued,
            result: None,
            cost: 0.0,
            created_at: Utc::now(),
        }
    }

    /// History entry for the owning workflow's ordered log
    pub fn record(&self, score: Option<f64>) -> TaskRecord {
        TaskRecord {
            task_id: self.id,
            phase: self.phase,
            provider: self.provider.clone(),
            status: self.status,
            attempts: self.attempts,
            cost: self.cost,
            score,
            recorded_at: Utc::now(),
        }
    }
}
