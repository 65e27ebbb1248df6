//! Workflow type definitions.
//!
//! A workflow is an immutable DAG of typed nodes and directed edges. The
//! JSON shape here is both the persistence format and the API payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A complete workflow definition.
///
/// # Example JSON
///
/// ```json
/// {
///   "id": "wf-orders",
///   "name": "order-pipeline",
///   "nodes": [
///     { "id": "fetch", "type": "value", "config": { "value": [1, 2, 3] } },
///     { "id": "report", "type": "merge", "config": {} }
///   ],
///   "edges": [
///     { "source": "fetch", "target": "report" }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique workflow identifier.
    pub id: String,

    /// Human-readable display name.
    pub name: String,

    /// Nodes keyed by node id.
    #[serde(with = "node_map")]
    pub nodes: HashMap<String, NodeSpec>,

    /// Directed edges between nodes.
    pub edges: Vec<Edge>,

    /// Creation timestamp.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    /// Look up a node by id.
    pub fn get_node(&self, node_id: &str) -> Option<&NodeSpec> {
        self.nodes.get(node_id)
    }

    /// Number of nodes in the workflow.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// A node (step) in the workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Unique node id within this workflow.
    pub id: String,

    /// Node type (registry key).
    #[serde(rename = "type")]
    pub node_type: String,

    /// Node-specific configuration, consumed only by the node implementation.
    #[serde(default)]
    pub config: serde_json::Value,

    /// Editor-only metadata (canvas position and the like). Stored, never
    /// interpreted by the engine.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// A directed edge: run `target` after `source`, feeding it `source`'s
/// output. Edges carry no payload of their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    /// Optional edge identifier (kept for round-tripping editor payloads).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub source: String,
    pub target: String,
}

/// Incoming definition for workflow creation. Same shape as [`Workflow`]
/// but `id` and `created_at` may be omitted and are assigned by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub id: Option<String>,

    pub name: String,

    #[serde(default)]
    pub nodes: Vec<NodeSpec>,

    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl WorkflowDefinition {
    /// Parse a definition from JSON or YAML text.
    pub fn parse(content: &str) -> crate::error::Result<Self> {
        if content.trim_start().starts_with('{') {
            Ok(serde_json::from_str(content)?)
        } else {
            Ok(serde_yaml::from_str(content)?)
        }
    }
}

/// Nodes serialize as a JSON array (the wire format) while living in a map
/// keyed by id in memory, so edge resolution stays O(1).
mod node_map {
    use super::NodeSpec;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::HashMap;

    pub fn serialize<S: Serializer>(
        nodes: &HashMap<String, NodeSpec>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut list: Vec<&NodeSpec> = nodes.values().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashMap<String, NodeSpec>, D::Error> {
        let list = Vec::<NodeSpec>::deserialize(deserializer)?;
        let mut map = HashMap::with_capacity(list.len());
        for node in list {
            if map.insert(node.id.clone(), node).is_some() {
                return Err(D::Error::custom("duplicate node id"));
            }
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_json_definition() {
        let def = WorkflowDefinition::parse(
            r#"{
                "name": "linear",
                "nodes": [
                    {"id": "a", "type": "value", "config": {"value": 1}},
                    {"id": "b", "type": "merge"}
                ],
                "edges": [{"source": "a", "target": "b"}]
            }"#,
        )
        .unwrap();

        assert_eq!(def.name, "linear");
        assert_eq!(def.nodes.len(), 2);
        assert_eq!(def.edges[0].source, "a");
    }

    #[test]
    fn test_parse_yaml_definition() {
        let def = WorkflowDefinition::parse(
            r#"
name: linear
nodes:
  - id: a
    type: value
edges: []
"#,
        )
        .unwrap();

        assert_eq!(def.name, "linear");
        assert_eq!(def.nodes[0].node_type, "value");
    }

    #[test]
    fn test_editor_fields_round_trip() {
        let def = WorkflowDefinition::parse(
            r#"{
                "name": "wf",
                "nodes": [{"id": "a", "type": "value", "position": {"x": 10, "y": 20}}],
                "edges": []
            }"#,
        )
        .unwrap();

        assert_eq!(def.nodes[0].extra["position"], json!({"x": 10, "y": 20}));
    }

    #[test]
    fn test_workflow_serializes_nodes_as_array() {
        let mut nodes = HashMap::new();
        for id in ["b", "a"] {
            nodes.insert(
                id.to_string(),
                NodeSpec {
                    id: id.to_string(),
                    node_type: "value".to_string(),
                    config: json!({}),
                    extra: HashMap::new(),
                },
            );
        }
        let workflow = Workflow {
            id: "wf-1".to_string(),
            name: "wf".to_string(),
            nodes,
            edges: vec![],
            created_at: Utc::now(),
        };

        let value = serde_json::to_value(&workflow).unwrap();
        let ids: Vec<&str> = value["nodes"]
            .as_array()
            .unwrap()
            .iter()
            .map(|n| n["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);

        let back: Workflow = serde_json::from_value(value).unwrap();
        assert_eq!(back.node_count(), 2);
    }

    #[test]
    fn test_duplicate_node_ids_rejected_on_deserialize() {
        let result: std::result::Result<Workflow, _> = serde_json::from_value(json!({
            "id": "wf-1",
            "name": "wf",
            "nodes": [
                {"id": "a", "type": "value"},
                {"id": "a", "type": "value"}
            ],
            "edges": []
        }));
        assert!(result.is_err());
    }
}
