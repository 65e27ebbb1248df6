//! dagr - durable DAG workflow execution engine
//!
//! dagr executes directed acyclic graphs of typed operations. Clients submit
//! a workflow (nodes + edges), and the engine runs it honoring data
//! dependencies: a node is dispatched once every predecessor has produced a
//! result, its input is assembled from those results, transient failures are
//! retried with exponential backoff, and all state is persisted so a restart
//! resumes unfinished executions where they left off. Lifecycle transitions
//! stream to in-process subscribers.
//!
//! ## Example
//!
//! ```no_run
//! use dagr::{Engine, EngineConfig, WorkflowDefinition};
//! use serde_json::json;
//!
//! # async fn example() -> dagr::Result<()> {
//! let engine = Engine::start(EngineConfig::default()).await?;
//!
//! let workflow = engine
//!     .create_workflow(WorkflowDefinition::parse(
//!         r#"{
//!             "name": "hello",
//!             "nodes": [
//!                 {"id": "greet", "type": "value", "config": {"value": "hi"}}
//!             ],
//!             "edges": []
//!         }"#,
//!     )?)
//!     .await?;
//!
//! let execution_id = engine.execute_workflow(&workflow.id, json!(null)).await?;
//! let finished = engine
//!     .wait_for_terminal(&execution_id, std::time::Duration::from_secs(10))
//!     .await?;
//! assert_eq!(finished.node_results["greet"], json!("hi"));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod nodes;
pub mod queue;
pub mod shutdown;
pub mod storage;
pub mod telemetry;
pub mod workflow;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{Error, Result};
pub use events::{Event, EventFilter, EventKind, Subscription};
pub use nodes::{FnNode, Node, NodeError, NodeMetadata, NodeRegistry};
pub use storage::{Execution, ExecutionStatus, SqliteStorage};
pub use workflow::{Workflow, WorkflowDefinition};
