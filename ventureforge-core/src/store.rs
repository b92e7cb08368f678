//! Workflow state persistence
//!
//! State is written through on every meaningful transition so a crashed
//! process can be reconstructed. The snapshot format is self-describing JSON
//! with a schema version; the in-memory store backs tests and single-process
//! deployments, while real deployments implement [`StateStore`] over durable
//! storage.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{ForgeError, Result};
use crate::workflow::WorkflowInstance;

/// Snapshot schema version, bumped on breaking layout changes
pub const SNAPSHOT_VERSION: u32 = 1;

/// Versioned envelope around a persisted workflow instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub version: u32,
    pub workflow: WorkflowInstance,
}

impl WorkflowSnapshot {
    pub fn of(workflow: &WorkflowInstance) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            workflow: workflow.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let snapshot: WorkflowSnapshot = serde_json::from_str(raw)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(ForgeError::Configuration(format!(
                "unsupported snapshot version {} (expected {SNAPSHOT_VERSION})",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }
}

/// Durable storage for workflow snapshots
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist a snapshot, replacing any previous one for the same workflow
    async fn save(&self, snapshot: WorkflowSnapshot) -> Result<()>;

    async fn load(&self, id: Uuid) -> Result<Option<WorkflowSnapshot>>;

    /// Every stored snapshot, used by crash recovery
    async fn load_all(&self) -> Result<Vec<WorkflowSnapshot>>;
}

/// In-memory store for tests and single-process use
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    snapshots: RwLock<HashMap<Uuid, String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save(&self, snapshot: WorkflowSnapshot) -> Result<()> {
        // Serialize through JSON so the memory store exercises the same
        // encode/decode path as a durable backend.
        let raw = snapshot.to_json()?;
        self.snapshots
            .write()
            .await
            .insert(snapshot.workflow.id, raw);
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<WorkflowSnapshot>> {
        let snapshots = self.snapshots.read().await;
        snapshots
            .get(&id)
            .map(|raw| WorkflowSnapshot::from_json(raw))
            .transpose()
    }

    async fn load_all(&self) -> Result<Vec<WorkflowSnapshot>> {
        let snapshots = self.snapshots.read().await;
        snapshots
            .values()
            .map(|raw| WorkflowSnapshot::from_json(raw))
            .collect()
    }
}
