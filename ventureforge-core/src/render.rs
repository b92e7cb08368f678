//! Deliverable assembly for completed workflows
//!
//! After the final phase succeeds, the engine assembles phase outputs into a
//! deliverable bundle and hands it to a renderer. Rendering is best-effort:
//! a renderer failure is logged and never changes workflow status.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::workflow::{Phase, WorkflowInstance};

/// Assembled output of a completed workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverableBundle {
    pub workflow_id: Uuid,
    pub tenant: String,
    pub name: String,

    /// Final output per phase, keyed by phase name in execution order
    pub phases: BTreeMap<String, Value>,

    pub total_cost: f64,
    pub task_count: usize,
    pub assembled_at: DateTime<Utc>,
}

impl DeliverableBundle {
    /// Assemble from a completed instance and the per-phase outputs the
    /// engine collected along the way.
    pub fn assemble(workflow: &WorkflowInstance, outputs: &BTreeMap<Phase, Value>) -> Self {
        let mut phases = BTreeMap::new();
        for phase in Phase::ORDER {
            if let Some(output) = outputs.get(&phase) {
                phases.insert(phase.as_str().to_string(), output.clone());
            }
        }
        Self {
            workflow_id: workflow.id,
            tenant: workflow.tenant.clone(),
            name: workflow.name.clone(),
            phases,
            total_cost: workflow.budget_consumed,
            task_count: workflow.history.len(),
            assembled_at: Utc::now(),
        }
    }
}

/// Terminal sink for deliverable bundles
#[async_trait]
pub trait DeliverableRenderer: Send + Sync {
    async fn render(&self, bundle: &DeliverableBundle) -> Result<()>;
}

/// Renderer that only logs the completion. Default when no sink is wired up.
#[derive(Debug, Default)]
pub struct NullRenderer;

#[async_trait]
impl DeliverableRenderer for NullRenderer {
    async fn render(&self, bundle: &DeliverableBundle) -> Result<()> {
        info!(
            workflow = %bundle.workflow_id,
            tenant = %bundle.tenant,
            phases = bundle.phases.len(),
            total_cost = bundle.total_cost,
            "deliverable assembled"
        );
        Ok(())
    }
}
