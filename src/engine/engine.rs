//! Engine facade.
//!
//! The public surface of the execution engine: register node types, create
//! workflows, start/query/cancel executions, subscribe to lifecycle events,
//! and shut down. Everything else in the crate hangs off the pieces wired
//! together here.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::info;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, EventFilter, Subscription};
use crate::nodes::{register_builtin_nodes, NodeFactory, NodeMetadata, NodeRegistry};
use crate::queue::{JobHandler, JobQueue};
use crate::shutdown::ShutdownCoordinator;
use crate::storage::{Execution, SqliteStorage, StateStore};
use crate::workflow::{validate_definition, Workflow, WorkflowDefinition};

use super::scheduler::Scheduler;

/// A running workflow execution engine.
pub struct Engine {
    config: EngineConfig,
    store: StateStore,
    registry: NodeRegistry,
    events: EventBus,
    queue: Arc<JobQueue>,
    scheduler: Arc<Scheduler>,
    shutdown: ShutdownCoordinator,
}

impl Engine {
    /// Open the configured database and start the engine.
    pub async fn start(config: EngineConfig) -> Result<Self> {
        let db = SqliteStorage::open(&config.database_path())?;
        Self::start_with_storage(config, db).await
    }

    /// Start the engine over an existing storage handle.
    ///
    /// Runs crash recovery before the worker pool starts pulling, so
    /// executions interrupted by a previous process resume from their
    /// durable state.
    pub async fn start_with_storage(config: EngineConfig, db: SqliteStorage) -> Result<Self> {
        let store = StateStore::new(db.clone());
        let registry = NodeRegistry::new();
        register_builtin_nodes(&registry)?;

        let events = EventBus::new();
        let queue = Arc::new(JobQueue::new(db, &config));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            registry.clone(),
            events.clone(),
            queue.clone(),
            &config,
        ));

        scheduler.recover().await?;
        queue
            .clone()
            .start(scheduler.clone() as Arc<dyn JobHandler>)
            .await;

        info!(
            max_concurrency = config.max_concurrency,
            "engine started"
        );

        Ok(Self {
            config,
            store,
            registry,
            events,
            queue,
            scheduler,
            shutdown: ShutdownCoordinator::new(),
        })
    }

    /// Register a node type. Call during startup, before executions that
    /// reference the type begin.
    pub fn register_node(&self, metadata: NodeMetadata, factory: NodeFactory) -> Result<()> {
        self.registry.register(metadata, factory)
    }

    /// Metadata of all registered node types.
    pub fn node_types(&self) -> Vec<NodeMetadata> {
        self.registry.list_types()
    }

    // ========================================================================
    // Workflows
    // ========================================================================

    /// Validate a definition and persist it as an immutable workflow.
    pub async fn create_workflow(&self, definition: WorkflowDefinition) -> Result<Arc<Workflow>> {
        validate_definition(&definition)?;

        let workflow = Workflow {
            id: definition
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            name: definition.name,
            nodes: definition
                .nodes
                .into_iter()
                .map(|node| (node.id.clone(), node))
                .collect(),
            edges: definition.edges,
            created_at: Utc::now(),
        };

        let workflow = self.store.put_workflow(workflow).await?;
        info!(workflow_id = %workflow.id, name = %workflow.name, "workflow created");
        Ok(workflow)
    }

    pub async fn get_workflow(&self, id: &str) -> Result<Arc<Workflow>> {
        self.store
            .get_workflow(id)
            .await?
            .ok_or_else(|| Error::WorkflowNotFound(id.to_string()))
    }

    pub async fn list_workflows(&self) -> Result<Vec<Workflow>> {
        self.store.list_workflows().await
    }

    // ========================================================================
    // Executions
    // ========================================================================

    /// Start executing a workflow; returns the new execution id.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        initial_input: Value,
    ) -> Result<String> {
        if self.shutdown.is_shutdown_requested() {
            return Err(Error::Execution("engine is shutting down".into()));
        }
        self.scheduler.start_execution(workflow_id, initial_input).await
    }

    /// Current snapshot of an execution, including partial results and
    /// errors.
    pub async fn get_execution(&self, id: &str) -> Result<Execution> {
        self.store
            .get_execution(id)
            .await?
            .ok_or_else(|| Error::ExecutionNotFound(id.to_string()))
    }

    pub async fn list_executions(&self, workflow_id: Option<&str>) -> Result<Vec<Execution>> {
        self.store.list_executions(workflow_id).await
    }

    /// Cancel a pending or running execution.
    pub async fn cancel_execution(&self, id: &str) -> Result<Execution> {
        self.scheduler.cancel_execution(id).await
    }

    /// Poll until the execution reaches a terminal status.
    pub async fn wait_for_terminal(&self, id: &str, timeout: Duration) -> Result<Execution> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let execution = self.get_execution(id).await?;
            if execution.status.is_terminal() {
                return Ok(execution);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Execution(format!(
                    "execution '{}' did not finish within {:?}",
                    id, timeout
                )));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    // ========================================================================
    // Events and lifecycle
    // ========================================================================

    /// Subscribe to lifecycle events matching a filter.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.events.subscribe(filter)
    }

    /// Remove a subscription by handle id.
    pub fn unsubscribe(&self, subscription_id: u64) {
        self.events.unsubscribe(subscription_id);
    }

    /// Coordinator for external shutdown signalling (SIGTERM/SIGINT).
    pub fn shutdown_coordinator(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Stop accepting work, wait for in-flight jobs up to the configured
    /// grace period, then abort. Durable state is left ready for the next
    /// start to resume.
    pub async fn shutdown(&self) {
        self.shutdown.request_shutdown();
        self.queue
            .shutdown(Duration::from_millis(self.config.shutdown_grace_ms))
            .await;
        info!("engine stopped");
    }
}
