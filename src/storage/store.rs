//! Two-layer state store: in-memory authoritative maps over write-through
//! SQLite.
//!
//! `patch_execution` is the serialization point for every execution state
//! transition. The mutator runs on a fresh copy under a per-execution lock,
//! the copy is persisted, and only then does the in-memory record advance,
//! so the cache can never be ahead of durable state.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tracing::debug;

use super::models::Execution;
use super::sqlite::SqliteStorage;
use crate::error::{Error, Result};
use crate::workflow::Workflow;

type ExecutionSlot = Arc<Mutex<Execution>>;

/// Authoritative state store for workflows and executions.
#[derive(Clone)]
pub struct StateStore {
    db: SqliteStorage,
    /// Workflows are immutable after creation, so readers just clone an Arc.
    workflows: Arc<RwLock<HashMap<String, Arc<Workflow>>>>,
    /// Per-execution slots; the inner mutex orders all transitions.
    executions: Arc<Mutex<HashMap<String, ExecutionSlot>>>,
}

impl StateStore {
    pub fn new(db: SqliteStorage) -> Self {
        Self {
            db,
            workflows: Arc::new(RwLock::new(HashMap::new())),
            executions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Direct access to the durable layer (the job queue shares it).
    pub fn db(&self) -> &SqliteStorage {
        &self.db
    }

    // ========================================================================
    // Workflows
    // ========================================================================

    pub async fn put_workflow(&self, workflow: Workflow) -> Result<Arc<Workflow>> {
        self.db.save_workflow(&workflow).await?;
        let workflow = Arc::new(workflow);
        self.workflows
            .write()
            .expect("workflow cache lock poisoned")
            .insert(workflow.id.clone(), workflow.clone());
        Ok(workflow)
    }

    /// Read-through workflow lookup.
    pub async fn get_workflow(&self, id: &str) -> Result<Option<Arc<Workflow>>> {
        if let Some(found) = self
            .workflows
            .read()
            .expect("workflow cache lock poisoned")
            .get(id)
        {
            return Ok(Some(found.clone()));
        }

        match self.db.get_workflow(id).await? {
            Some(workflow) => {
                debug!(workflow_id = %id, "hydrating workflow from storage");
                let workflow = Arc::new(workflow);
                self.workflows
                    .write()
                    .expect("workflow cache lock poisoned")
                    .insert(id.to_string(), workflow.clone());
                Ok(Some(workflow))
            }
            None => Ok(None),
        }
    }

    pub async fn list_workflows(&self) -> Result<Vec<Workflow>> {
        self.db.list_workflows().await
    }

    // ========================================================================
    // Executions
    // ========================================================================

    /// Insert a new execution (durable first, then cached).
    pub async fn put_execution(&self, execution: Execution) -> Result<()> {
        self.db.save_execution(&execution).await?;
        self.executions
            .lock()
            .await
            .insert(execution.id.clone(), Arc::new(Mutex::new(execution)));
        Ok(())
    }

    /// Current snapshot of an execution.
    pub async fn get_execution(&self, id: &str) -> Result<Option<Execution>> {
        match self.execution_slot(id).await? {
            Some(slot) => Ok(Some(slot.lock().await.clone())),
            None => Ok(None),
        }
    }

    pub async fn list_executions(&self, workflow_id: Option<&str>) -> Result<Vec<Execution>> {
        self.db.list_executions(workflow_id).await
    }

    /// Apply a mutation to an execution under its lock.
    ///
    /// The mutator observes a fresh copy of the current state. If it errors,
    /// nothing changes. If the durable write fails, the in-memory record is
    /// left at its previous (durable) state and the error propagates.
    pub async fn patch_execution<T, F>(&self, id: &str, mutator: F) -> Result<T>
    where
        F: FnOnce(&mut Execution) -> Result<T>,
    {
        let slot = self
            .execution_slot(id)
            .await?
            .ok_or_else(|| Error::ExecutionNotFound(id.to_string()))?;

        let mut current = slot.lock().await;
        let mut patched = current.clone();
        let output = mutator(&mut patched)?;

        self.db.save_execution(&patched).await?;
        *current = patched;

        Ok(output)
    }

    /// Read-through slot lookup, hydrating from SQLite on first touch.
    async fn execution_slot(&self, id: &str) -> Result<Option<ExecutionSlot>> {
        let mut slots = self.executions.lock().await;
        if let Some(slot) = slots.get(id) {
            return Ok(Some(slot.clone()));
        }

        match self.db.get_execution(id).await? {
            Some(execution) => {
                let slot = Arc::new(Mutex::new(execution));
                slots.insert(id.to_string(), slot.clone());
                Ok(Some(slot))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::ExecutionStatus;
    use crate::workflow::WorkflowDefinition;
    use chrono::Utc;
    use serde_json::json;

    fn sample_workflow(id: &str) -> Workflow {
        let def = WorkflowDefinition::parse(
            r#"{"name": "sample", "nodes": [{"id": "a", "type": "value"}]}"#,
        )
        .unwrap();
        Workflow {
            id: id.to_string(),
            name: def.name,
            nodes: def.nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
            edges: def.edges,
            created_at: Utc::now(),
        }
    }

    fn store() -> StateStore {
        StateStore::new(SqliteStorage::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_workflow_read_through() {
        let db = SqliteStorage::open_in_memory().unwrap();
        db.save_workflow(&sample_workflow("wf-1")).await.unwrap();

        // Fresh store over the same db: first read hydrates the cache.
        let store = StateStore::new(db);
        assert!(store.get_workflow("wf-1").await.unwrap().is_some());
        assert!(store.get_workflow("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_patch_execution_serializes_and_persists() {
        let store = store();
        store.put_workflow(sample_workflow("wf-1")).await.unwrap();
        store
            .put_execution(Execution::new("e-1".into(), "wf-1".into(), json!(null)))
            .await
            .unwrap();

        store
            .patch_execution("e-1", |execution| {
                execution.status = ExecutionStatus::Running;
                execution.node_results.insert("a".into(), json!(1));
                Ok(())
            })
            .await
            .unwrap();

        // Both the cache and the durable layer observed the patch.
        let cached = store.get_execution("e-1").await.unwrap().unwrap();
        assert_eq!(cached.status, ExecutionStatus::Running);
        let durable = store.db().get_execution("e-1").await.unwrap().unwrap();
        assert_eq!(durable.node_results["a"], json!(1));
    }

    #[tokio::test]
    async fn test_patch_failure_leaves_state_untouched() {
        let store = store();
        store.put_workflow(sample_workflow("wf-1")).await.unwrap();
        store
            .put_execution(Execution::new("e-1".into(), "wf-1".into(), json!(null)))
            .await
            .unwrap();

        let result: Result<()> = store
            .patch_execution("e-1", |execution| {
                execution.node_results.insert("a".into(), json!(1));
                Err(Error::Execution("mutator bailed".into()))
            })
            .await;
        assert!(result.is_err());

        let unchanged = store.get_execution("e-1").await.unwrap().unwrap();
        assert!(unchanged.node_results.is_empty());
    }

    #[tokio::test]
    async fn test_patch_missing_execution() {
        let store = store();
        let err = store
            .patch_execution("ghost", |_| Ok(()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "EXECUTION_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_in_flight_survives_in_cache_not_in_db() {
        let store = store();
        store.put_workflow(sample_workflow("wf-1")).await.unwrap();
        store
            .put_execution(Execution::new("e-1".into(), "wf-1".into(), json!(null)))
            .await
            .unwrap();

        store
            .patch_execution("e-1", |execution| {
                execution.in_flight.insert("a".into());
                Ok(())
            })
            .await
            .unwrap();

        let cached = store.get_execution("e-1").await.unwrap().unwrap();
        assert!(cached.in_flight.contains("a"));

        let durable = store.db().get_execution("e-1").await.unwrap().unwrap();
        assert!(durable.in_flight.is_empty());
    }
}
