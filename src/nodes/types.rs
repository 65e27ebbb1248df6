//! Node trait and supporting types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Failure classification reported by node implementations.
///
/// The scheduler re-enqueues `Transient` failures with backoff until the
/// node's attempts are exhausted; `Terminal` failures are recorded
/// immediately and never retried.
#[derive(Error, Debug, Clone)]
pub enum NodeError {
    /// May succeed on retry (connection reset, upstream 5xx, timeout).
    #[error("{0}")]
    Transient(String),

    /// Will not succeed on retry (bad config, upstream 4xx, malformed data).
    #[error("{0}")]
    Terminal(String),
}

impl NodeError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::Terminal(msg.into())
    }
}

/// Result type for node execution.
pub type NodeOutput = std::result::Result<Value, NodeError>;

/// Map of completed upstream results, keyed by node id.
pub type UpstreamResults = HashMap<String, Value>;

/// Static metadata a node type advertises at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// Registry key.
    pub node_type: String,

    /// One-line description for listings.
    #[serde(default)]
    pub description: String,

    /// Advertised number of inputs (0 = source-only).
    #[serde(default)]
    pub inputs: u32,

    /// Advertised number of outputs.
    #[serde(default = "default_outputs")]
    pub outputs: u32,

    /// Optional JSON schema for the node config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_schema: Option<Value>,
}

fn default_outputs() -> u32 {
    1
}

impl NodeMetadata {
    pub fn new(node_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
            description: description.into(),
            inputs: 1,
            outputs: 1,
            config_schema: None,
        }
    }

    pub fn with_inputs(mut self, inputs: u32) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_config_schema(mut self, schema: Value) -> Self {
        self.config_schema = Some(schema);
        self
    }
}

/// An instantiated node, ready to execute.
///
/// Instances are produced by a registered factory from a node's config and
/// treated by the scheduler as opaque asynchronous computations.
#[async_trait]
pub trait Node: Send + Sync {
    /// Execute the node.
    ///
    /// # Arguments
    /// * `input` - assembled input: the execution's initial input for source
    ///   nodes, or a `{pred_id: result}` object otherwise
    /// * `upstream` - all results recorded so far for this execution
    async fn execute(&self, input: &Value, upstream: &UpstreamResults) -> NodeOutput;

    /// Per-node deadline override. `None` uses the engine default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Whether exceeding the deadline should be retried. Nodes with
    /// non-idempotent side effects opt out by returning `false`.
    fn timeout_is_transient(&self) -> bool {
        true
    }
}

impl std::fmt::Debug for dyn Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dyn Node")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_error_constructors() {
        assert!(matches!(
            NodeError::transient("x"),
            NodeError::Transient(_)
        ));
        assert!(matches!(NodeError::terminal("x"), NodeError::Terminal(_)));
    }

    #[test]
    fn test_metadata_builder() {
        let meta = NodeMetadata::new("merge", "Flatten fan-in").with_inputs(2);
        assert_eq!(meta.node_type, "merge");
        assert_eq!(meta.inputs, 2);
        assert_eq!(meta.outputs, 1);
    }
}
