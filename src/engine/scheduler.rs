//! DAG scheduler.
//!
//! Per execution, the scheduler tracks which nodes are settled, which are in
//! flight, and which have become ready (all predecessors completed), and
//! feeds ready nodes to the job queue. It is also the queue's handler: every
//! delivery resolves the node type through the registry, runs it under a
//! deadline, and records the outcome.
//!
//! All execution mutation happens inside `patch_execution`; lifecycle events
//! are emitted after the durable write they describe, and newly-ready
//! successors are enqueued after the patch commits.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, EventKind};
use crate::nodes::{NodeError, NodeRegistry};
use crate::queue::{JobHandler, JobOutcome, JobQueue};
use crate::storage::{Execution, ExecutionStatus, JobRow, NodeErrorRecord, StateStore};
use crate::workflow::{DependencyGraph, Workflow};

/// Result of one state patch: what to tell subscribers and what to enqueue,
/// both applied strictly after the durable write.
struct Transition {
    execution_id: String,
    events: Vec<Event>,
    enqueue: Vec<(String, Value)>,
}

impl Transition {
    fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            events: Vec::new(),
            enqueue: Vec::new(),
        }
    }
}

pub struct Scheduler {
    store: StateStore,
    registry: NodeRegistry,
    events: EventBus,
    queue: Arc<JobQueue>,
    default_retry_attempts: u32,
    node_default_timeout: Duration,
    /// Adjacency indexes, one per workflow, built on first use.
    graphs: RwLock<HashMap<String, Arc<DependencyGraph>>>,
}

impl Scheduler {
    pub fn new(
        store: StateStore,
        registry: NodeRegistry,
        events: EventBus,
        queue: Arc<JobQueue>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            events,
            queue,
            default_retry_attempts: config.default_retry_attempts.max(1),
            node_default_timeout: Duration::from_millis(config.node_default_timeout_ms.max(1)),
            graphs: RwLock::new(HashMap::new()),
        }
    }

    /// Create a new execution of a workflow and enqueue its source nodes.
    pub async fn start_execution(&self, workflow_id: &str, initial_input: Value) -> Result<String> {
        let workflow = self
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| Error::WorkflowNotFound(workflow_id.to_string()))?;
        let graph = self.graph_for(&workflow);

        let execution_id = uuid::Uuid::new_v4().to_string();
        self.store
            .put_execution(Execution::new(
                execution_id.clone(),
                workflow.id.clone(),
                initial_input,
            ))
            .await?;

        let transition = self
            .store
            .patch_execution(&execution_id, |execution| {
                execution.status = ExecutionStatus::Running;

                let mut transition = Transition::new(execution.id.clone());
                transition.events.push(Event::new(
                    EventKind::WorkflowStarted,
                    execution.id.clone(),
                    execution.workflow_id.clone(),
                ));
                self.claim_ready_nodes(&workflow, &graph, execution, &mut transition);
                Ok(transition)
            })
            .await?;

        info!(execution_id = %execution_id, workflow_id = %workflow.id, "execution started");
        self.apply_transition(transition).await;
        Ok(execution_id)
    }

    /// Cancel an execution: no new nodes are enqueued, queued jobs are
    /// purged, and results from still-running nodes are discarded on
    /// arrival. External side effects already under way are not rolled back.
    pub async fn cancel_execution(&self, execution_id: &str) -> Result<Execution> {
        let cancelled = self
            .store
            .patch_execution(execution_id, |execution| {
                if execution.status.is_terminal() {
                    return Err(Error::Execution(format!(
                        "cannot cancel execution '{}' in status '{}'",
                        execution.id, execution.status
                    )));
                }
                execution.status = ExecutionStatus::Cancelled;
                execution.ended_at = Some(Utc::now());
                execution.in_flight.clear();
                Ok(execution.clone())
            })
            .await?;

        let purged = self.queue.purge_execution(execution_id).await?;
        debug!(execution_id, purged, "purged queued jobs for cancelled execution");

        self.events.publish(Event::new(
            EventKind::WorkflowCancelled,
            cancelled.id.clone(),
            cancelled.workflow_id.clone(),
        ));

        info!(execution_id, "execution cancelled");
        Ok(cancelled)
    }

    /// Crash recovery: unclaim surviving job rows, rebuild each unfinished
    /// execution's in-flight set from them, re-enqueue nodes whose
    /// predecessors are complete but which have no job and no result, and
    /// re-evaluate termination.
    pub async fn recover(&self) -> Result<()> {
        self.queue.recover().await?;

        let executions = self.store.list_executions(None).await?;
        for snapshot in executions {
            if snapshot.status.is_terminal() {
                continue;
            }

            let Some(workflow) = self.store.get_workflow(&snapshot.workflow_id).await? else {
                warn!(
                    execution_id = %snapshot.id,
                    workflow_id = %snapshot.workflow_id,
                    "skipping recovery: workflow missing"
                );
                continue;
            };
            let graph = self.graph_for(&workflow);

            let queued: HashSet<String> = self
                .queue
                .jobs_for_execution(&snapshot.id)
                .await?
                .into_iter()
                .map(|job| job.node_id)
                .collect();

            let transition = self
                .store
                .patch_execution(&snapshot.id, |execution| {
                    execution.status = ExecutionStatus::Running;
                    execution.in_flight = queued.clone();

                    let mut transition = Transition::new(execution.id.clone());
                    self.claim_ready_nodes(&workflow, &graph, execution, &mut transition);
                    self.evaluate_termination(&workflow, &graph, execution, &mut transition);
                    Ok(transition)
                })
                .await?;

            info!(
                execution_id = %snapshot.id,
                requeued = transition.enqueue.len(),
                "execution recovered"
            );
            self.apply_transition(transition).await;
        }

        Ok(())
    }

    // ========================================================================
    // State transitions
    // ========================================================================

    /// Record a successful node result and schedule newly-ready successors.
    async fn record_result(&self, job: &JobRow, value: Value) -> Result<()> {
        let (workflow, graph) = self.workflow_for_execution(&job.execution_id).await?;

        let transition = self
            .store
            .patch_execution(&job.execution_id, |execution| {
                if execution.status != ExecutionStatus::Running {
                    debug!(
                        execution_id = %execution.id,
                        node_id = %job.node_id,
                        status = %execution.status,
                        "discarding node result for non-running execution"
                    );
                    return Ok(Transition::new(execution.id.clone()));
                }
                if execution.is_settled(&job.node_id) {
                    // Duplicate delivery (at-least-once); the first write won.
                    return Ok(Transition::new(execution.id.clone()));
                }

                execution
                    .node_results
                    .insert(job.node_id.clone(), value.clone());
                execution.in_flight.remove(&job.node_id);

                let mut transition = Transition::new(execution.id.clone());
                transition.events.push(
                    Event::new(
                        EventKind::NodeCompleted,
                        execution.id.clone(),
                        execution.workflow_id.clone(),
                    )
                    .with_node(job.node_id.clone())
                    .with_payload(value.clone()),
                );

                self.claim_ready_nodes(&workflow, &graph, execution, &mut transition);
                self.evaluate_termination(&workflow, &graph, execution, &mut transition);
                Ok(transition)
            })
            .await?;

        self.apply_transition(transition).await;
        Ok(())
    }

    /// Record a terminal node failure and mark the execution failed once
    /// nothing else can run.
    async fn record_failure(&self, job: &JobRow, message: String, attempts: u32) -> Result<()> {
        let (workflow, graph) = self.workflow_for_execution(&job.execution_id).await?;

        let transition = self
            .store
            .patch_execution(&job.execution_id, |execution| {
                if execution.status != ExecutionStatus::Running {
                    return Ok(Transition::new(execution.id.clone()));
                }
                if execution.is_settled(&job.node_id) {
                    return Ok(Transition::new(execution.id.clone()));
                }

                execution.node_errors.insert(
                    job.node_id.clone(),
                    NodeErrorRecord {
                        message: message.clone(),
                        attempts,
                    },
                );
                execution.in_flight.remove(&job.node_id);

                let mut transition = Transition::new(execution.id.clone());
                transition.events.push(
                    Event::new(
                        EventKind::NodeError,
                        execution.id.clone(),
                        execution.workflow_id.clone(),
                    )
                    .with_node(job.node_id.clone())
                    .with_payload(json!({ "message": message, "attempts": attempts })),
                );

                // Successors of a failed node can never become ready, but
                // other branches may still be live.
                self.claim_ready_nodes(&workflow, &graph, execution, &mut transition);
                self.evaluate_termination(&workflow, &graph, execution, &mut transition);
                Ok(transition)
            })
            .await?;

        warn!(
            execution_id = %job.execution_id,
            node_id = %job.node_id,
            attempts,
            "node failed terminally: {}",
            message
        );
        self.apply_transition(transition).await;
        Ok(())
    }

    /// Move every ready node into the in-flight set and stage its enqueue.
    ///
    /// Ready means: every predecessor has a result, and the node itself is
    /// neither settled nor in flight. Nodes are claimed in ascending id
    /// order so replay is deterministic.
    fn claim_ready_nodes(
        &self,
        workflow: &Workflow,
        graph: &DependencyGraph,
        execution: &mut Execution,
        transition: &mut Transition,
    ) {
        let mut ready: Vec<&String> = workflow
            .nodes
            .keys()
            .filter(|node_id| {
                !execution.is_settled(node_id)
                    && !execution.in_flight.contains(*node_id)
                    && graph
                        .predecessors(node_id)
                        .iter()
                        .all(|pred| execution.node_results.contains_key(pred))
            })
            .collect();
        ready.sort();

        for node_id in ready {
            let input = assemble_input(graph, execution, node_id);
            execution.in_flight.insert(node_id.clone());
            transition.enqueue.push((node_id.clone(), input));
        }
    }

    /// Termination rule, applied after every node transition:
    /// - every node has a result → `completed`
    /// - nothing in flight, nothing ready, and at least one terminal node
    ///   error → `failed` (remaining nodes are unreachable)
    fn evaluate_termination(
        &self,
        workflow: &Workflow,
        graph: &DependencyGraph,
        execution: &mut Execution,
        transition: &mut Transition,
    ) {
        if execution.node_results.len() == workflow.node_count() {
            execution.status = ExecutionStatus::Completed;
            execution.ended_at = Some(Utc::now());
            transition.events.push(
                Event::new(
                    EventKind::WorkflowCompleted,
                    execution.id.clone(),
                    execution.workflow_id.clone(),
                )
                .with_payload(json!({ "node_results": execution.node_results })),
            );
            return;
        }

        // `claim_ready_nodes` has already moved every ready node into
        // `in_flight`, so an empty in-flight set means nothing can run.
        if execution.in_flight.is_empty() && !execution.node_errors.is_empty() {
            let mut failed: Vec<String> = execution.node_errors.keys().cloned().collect();
            failed.sort();
            let mut unreachable: Vec<String> = graph
                .transitive_successors(failed.iter().map(|s| s.as_str()))
                .into_iter()
                .collect();
            unreachable.sort();

            execution.status = ExecutionStatus::Failed;
            execution.ended_at = Some(Utc::now());
            execution.fatal_error = Some(format!(
                "{} node(s) failed terminally: {}",
                failed.len(),
                failed.join(", ")
            ));
            transition.events.push(
                Event::new(
                    EventKind::WorkflowFailed,
                    execution.id.clone(),
                    execution.workflow_id.clone(),
                )
                .with_payload(json!({
                    "failed_nodes": failed,
                    "unreachable_nodes": unreachable,
                })),
            );
        }
    }

    /// Emit staged events and enqueue staged jobs. Runs after the patch that
    /// produced the transition has been durably committed.
    async fn apply_transition(&self, transition: Transition) {
        let execution_id = transition.execution_id;

        for event in transition.events {
            self.events.publish(event);
        }

        for (node_id, input) in transition.enqueue {
            if let Err(e) = self
                .queue
                .enqueue(
                    &execution_id,
                    &node_id,
                    input,
                    self.default_retry_attempts,
                    None,
                )
                .await
            {
                // Startup recovery re-enqueues ready nodes without results.
                warn!(
                    execution_id = %execution_id,
                    node_id = %node_id,
                    "failed to enqueue ready node: {}",
                    e
                );
            }
        }
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    async fn workflow_for_execution(
        &self,
        execution_id: &str,
    ) -> Result<(Arc<Workflow>, Arc<DependencyGraph>)> {
        let execution = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| Error::ExecutionNotFound(execution_id.to_string()))?;
        let workflow = self
            .store
            .get_workflow(&execution.workflow_id)
            .await?
            .ok_or_else(|| Error::WorkflowNotFound(execution.workflow_id.clone()))?;
        let graph = self.graph_for(&workflow);
        Ok((workflow, graph))
    }

    fn graph_for(&self, workflow: &Arc<Workflow>) -> Arc<DependencyGraph> {
        if let Some(graph) = self
            .graphs
            .read()
            .expect("graph cache lock poisoned")
            .get(&workflow.id)
        {
            return graph.clone();
        }

        let graph = Arc::new(DependencyGraph::new(workflow));
        self.graphs
            .write()
            .expect("graph cache lock poisoned")
            .insert(workflow.id.clone(), graph.clone());
        graph
    }
}

/// Construct a node's input from its predecessors:
/// - no predecessors: the execution's initial input
/// - otherwise: `{pred_id: result}` for every predecessor (also for a single
///   predecessor, so the shape is uniform)
fn assemble_input(graph: &DependencyGraph, execution: &Execution, node_id: &str) -> Value {
    let preds = graph.predecessors(node_id);
    if preds.is_empty() {
        return execution.initial_input.clone();
    }

    let mut input = Map::new();
    for pred in preds {
        let value = execution
            .node_results
            .get(pred)
            .cloned()
            .unwrap_or(Value::Null);
        input.insert(pred.clone(), value);
    }
    Value::Object(input)
}

// ============================================================================
// Queue handler
// ============================================================================

#[async_trait]
impl JobHandler for Scheduler {
    async fn handle(&self, job: &JobRow) -> JobOutcome {
        let execution = match self.store.get_execution(&job.execution_id).await {
            Ok(Some(execution)) => execution,
            Ok(None) => {
                warn!(job_id = %job.id, "dropping job for unknown execution");
                return JobOutcome::Done;
            }
            Err(e) => return JobOutcome::Park { error: e.to_string() },
        };

        if execution.status != ExecutionStatus::Running {
            debug!(
                execution_id = %execution.id,
                node_id = %job.node_id,
                status = %execution.status,
                "dropping job for non-running execution"
            );
            return JobOutcome::Done;
        }

        if execution.is_settled(&job.node_id) {
            // Redelivery of work that was already recorded (the process died
            // between the state write and the row delete).
            debug!(
                execution_id = %execution.id,
                node_id = %job.node_id,
                "dropping redelivered job for settled node"
            );
            return JobOutcome::Done;
        }

        let workflow = match self.store.get_workflow(&execution.workflow_id).await {
            Ok(Some(workflow)) => workflow,
            Ok(None) => {
                return self
                    .settle_failure(
                        job,
                        format!("workflow '{}' not found", execution.workflow_id),
                    )
                    .await;
            }
            Err(e) => return JobOutcome::Park { error: e.to_string() },
        };

        let Some(spec) = workflow.get_node(&job.node_id) else {
            return self
                .settle_failure(
                    job,
                    format!("node '{}' not present in workflow", job.node_id),
                )
                .await;
        };

        let node = match self.registry.instantiate(&spec.node_type, &spec.config) {
            Ok(node) => node,
            // UnknownNodeType / InvalidNodeConfig are terminal for the node.
            Err(e) => return self.settle_failure(job, e.to_string()).await,
        };

        self.events.publish(
            Event::new(
                EventKind::NodeStarted,
                execution.id.clone(),
                execution.workflow_id.clone(),
            )
            .with_node(job.node_id.clone())
            .with_payload(json!({ "attempt": job.attempt, "type": spec.node_type })),
        );

        let deadline = node.timeout().unwrap_or(self.node_default_timeout);
        let upstream = execution.node_results.clone();
        let outcome = tokio::time::timeout(deadline, node.execute(&job.input, &upstream)).await;

        match outcome {
            Ok(Ok(value)) => match self.record_result(job, value).await {
                Ok(()) => JobOutcome::Done,
                Err(e) => {
                    error!(job_id = %job.id, "failed to record node result: {}", e);
                    JobOutcome::Park { error: e.to_string() }
                }
            },
            Ok(Err(NodeError::Transient(message))) => self.retry_or_report(job, message, &execution),
            Ok(Err(NodeError::Terminal(message))) => self.settle_failure(job, message).await,
            Err(_) => {
                let message = format!(
                    "node '{}' timed out after {:?}",
                    job.node_id, deadline
                );
                if node.timeout_is_transient() {
                    self.retry_or_report(job, message, &execution)
                } else {
                    self.settle_failure(job, message).await
                }
            }
        }
    }

    async fn exhausted(&self, job: &JobRow, error: String) {
        if let Err(e) = self.record_failure(job, error, job.attempt).await {
            error!(
                job_id = %job.id,
                execution_id = %job.execution_id,
                "failed to record exhausted node: {}",
                e
            );
        }
    }
}

impl Scheduler {
    /// Terminal failure path shared by classification errors and
    /// `NodeError::Terminal`.
    async fn settle_failure(&self, job: &JobRow, message: String) -> JobOutcome {
        match self.record_failure(job, message, job.attempt).await {
            Ok(()) => JobOutcome::Done,
            Err(e) => {
                error!(job_id = %job.id, "failed to record node failure: {}", e);
                JobOutcome::Park { error: e.to_string() }
            }
        }
    }

    /// Transient failure path: announce the retry when attempts remain; the
    /// queue owns the backoff and, at exhaustion, calls back into
    /// [`JobHandler::exhausted`].
    fn retry_or_report(&self, job: &JobRow, message: String, execution: &Execution) -> JobOutcome {
        if job.attempts_remaining > 1 {
            self.events.publish(
                Event::new(
                    EventKind::NodeFailed,
                    execution.id.clone(),
                    execution.workflow_id.clone(),
                )
                .with_node(job.node_id.clone())
                .with_payload(json!({ "message": message, "attempt": job.attempt })),
            );
        }
        JobOutcome::Retry { error: message }
    }
}
