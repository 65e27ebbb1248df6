//! Dependency graph view over a workflow's edge list.
//!
//! The scheduler asks the same questions over and over (who are this node's
//! predecessors, who becomes reachable after it completes), so the edge list
//! is indexed once per workflow into adjacency maps.

use std::collections::{HashMap, HashSet, VecDeque};

use super::types::Workflow;

/// Precomputed adjacency for a workflow.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    predecessors: HashMap<String, Vec<String>>,
    successors: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Build the adjacency maps from a workflow's edges. Neighbor lists are
    /// sorted so iteration order is deterministic.
    pub fn new(workflow: &Workflow) -> Self {
        let mut predecessors: HashMap<String, Vec<String>> = HashMap::new();
        let mut successors: HashMap<String, Vec<String>> = HashMap::new();

        for node_id in workflow.nodes.keys() {
            predecessors.entry(node_id.clone()).or_default();
            successors.entry(node_id.clone()).or_default();
        }

        for edge in &workflow.edges {
            predecessors
                .entry(edge.target.clone())
                .or_default()
                .push(edge.source.clone());
            successors
                .entry(edge.source.clone())
                .or_default()
                .push(edge.target.clone());
        }

        for list in predecessors.values_mut() {
            list.sort();
            list.dedup();
        }
        for list in successors.values_mut() {
            list.sort();
            list.dedup();
        }

        Self {
            predecessors,
            successors,
        }
    }

    /// Direct predecessors of a node.
    pub fn predecessors(&self, node_id: &str) -> &[String] {
        self.predecessors
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Direct successors of a node.
    pub fn successors(&self, node_id: &str) -> &[String] {
        self.successors
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Nodes with no predecessors, in ascending id order.
    pub fn source_nodes(&self) -> Vec<String> {
        let mut sources: Vec<String> = self
            .predecessors
            .iter()
            .filter(|(_, preds)| preds.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        sources.sort();
        sources
    }

    /// All transitive successors of the given nodes. Used to derive the set
    /// of nodes a terminal failure makes unreachable.
    pub fn transitive_successors<'a, I>(&self, roots: I) -> HashSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut reached = HashSet::new();
        let mut queue: VecDeque<&str> = roots.into_iter().collect();

        while let Some(node_id) = queue.pop_front() {
            for succ in self.successors(node_id) {
                if reached.insert(succ.clone()) {
                    queue.push_back(succ);
                }
            }
        }

        reached
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::{Edge, NodeSpec, Workflow};
    use chrono::Utc;
    use std::collections::HashMap;

    fn workflow(nodes: &[&str], edges: &[(&str, &str)]) -> Workflow {
        Workflow {
            id: "wf-1".to_string(),
            name: "test".to_string(),
            nodes: nodes
                .iter()
                .map(|id| {
                    (
                        id.to_string(),
                        NodeSpec {
                            id: id.to_string(),
                            node_type: "value".to_string(),
                            config: serde_json::json!({}),
                            extra: HashMap::new(),
                        },
                    )
                })
                .collect(),
            edges: edges
                .iter()
                .map(|(s, t)| Edge {
                    id: None,
                    source: s.to_string(),
                    target: t.to_string(),
                })
                .collect(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_source_nodes() {
        let wf = workflow(&["a", "b", "c"], &[("a", "b"), ("b", "c")]);
        let graph = DependencyGraph::new(&wf);
        assert_eq!(graph.source_nodes(), vec!["a"]);
    }

    #[test]
    fn test_diamond_adjacency() {
        let wf = workflow(
            &["a", "b", "c", "d"],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
        );
        let graph = DependencyGraph::new(&wf);

        assert_eq!(graph.predecessors("d"), &["b", "c"]);
        assert_eq!(graph.successors("a"), &["b", "c"]);
        assert_eq!(graph.source_nodes(), vec!["a"]);
    }

    #[test]
    fn test_transitive_successors() {
        let wf = workflow(
            &["a", "b", "c", "d", "e"],
            &[("a", "b"), ("b", "c"), ("b", "d"), ("e", "d")],
        );
        let graph = DependencyGraph::new(&wf);

        let reached = graph.transitive_successors(["b"]);
        assert_eq!(
            reached,
            ["c", "d"].iter().map(|s| s.to_string()).collect()
        );
        assert!(graph.transitive_successors(["c"]).is_empty());
    }

    #[test]
    fn test_duplicate_edges_collapse() {
        let wf = workflow(&["a", "b"], &[("a", "b"), ("a", "b")]);
        let graph = DependencyGraph::new(&wf);
        assert_eq!(graph.predecessors("b"), &["a"]);
    }

    #[test]
    fn test_disconnected_components() {
        let wf = workflow(&["a", "b", "x", "y"], &[("a", "b"), ("x", "y")]);
        let graph = DependencyGraph::new(&wf);
        assert_eq!(graph.source_nodes(), vec!["a", "x"]);
    }
}
