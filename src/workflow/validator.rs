//! Workflow validation.

use std::collections::{HashMap, HashSet};

use super::types::WorkflowDefinition;
use crate::error::{Error, Result};

/// Validate a workflow definition before it is accepted into the store.
///
/// Checks for:
/// - Required fields (name, at least one node)
/// - Unique node IDs
/// - Edge endpoints referencing existing nodes
/// - No circular dependencies
pub fn validate_definition(def: &WorkflowDefinition) -> Result<()> {
    if def.name.is_empty() {
        return Err(Error::InvalidWorkflow("workflow name is required".into()));
    }

    if def.nodes.is_empty() {
        return Err(Error::InvalidWorkflow(
            "workflow must have at least one node".into(),
        ));
    }

    let mut ids = HashSet::new();
    for node in &def.nodes {
        if node.id.is_empty() {
            return Err(Error::InvalidWorkflow("node id cannot be empty".into()));
        }
        if node.node_type.is_empty() {
            return Err(Error::InvalidWorkflow(format!(
                "node '{}' has empty type",
                node.id
            )));
        }
        if !ids.insert(node.id.as_str()) {
            return Err(Error::InvalidWorkflow(format!(
                "duplicate node id: {}",
                node.id
            )));
        }
    }

    for edge in &def.edges {
        if !ids.contains(edge.source.as_str()) {
            return Err(Error::InvalidWorkflow(format!(
                "edge references non-existent source node '{}'",
                edge.source
            )));
        }
        if !ids.contains(edge.target.as_str()) {
            return Err(Error::InvalidWorkflow(format!(
                "edge references non-existent target node '{}'",
                edge.target
            )));
        }
    }

    if let Some(node_id) = find_cycle(def) {
        return Err(Error::InvalidWorkflow(format!(
            "workflow has a dependency cycle involving node '{}'",
            node_id
        )));
    }

    Ok(())
}

/// DFS cycle detection over the edge list. Returns a node on a cycle, if any.
fn find_cycle(def: &WorkflowDefinition) -> Option<String> {
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &def.edges {
        successors
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
    }

    fn dfs<'a>(
        node: &'a str,
        successors: &HashMap<&'a str, Vec<&'a str>>,
        visited: &mut HashSet<&'a str>,
        rec_stack: &mut HashSet<&'a str>,
    ) -> bool {
        visited.insert(node);
        rec_stack.insert(node);

        if let Some(next) = successors.get(node) {
            for neighbor in next {
                if !visited.contains(neighbor) {
                    if dfs(neighbor, successors, visited, rec_stack) {
                        return true;
                    }
                } else if rec_stack.contains(neighbor) {
                    return true;
                }
            }
        }

        rec_stack.remove(node);
        false
    }

    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    for node in &def.nodes {
        if !visited.contains(node.id.as_str())
            && dfs(node.id.as_str(), &successors, &mut visited, &mut rec_stack)
        {
            return Some(node.id.clone());
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::WorkflowDefinition;

    fn parse(json: &str) -> WorkflowDefinition {
        WorkflowDefinition::parse(json).unwrap()
    }

    #[test]
    fn test_validate_empty_name() {
        let def = parse(r#"{"name": "", "nodes": [{"id": "a", "type": "value"}]}"#);
        assert!(validate_definition(&def).is_err());
    }

    #[test]
    fn test_validate_no_nodes() {
        let def = parse(r#"{"name": "wf", "nodes": []}"#);
        assert!(validate_definition(&def).is_err());
    }

    #[test]
    fn test_validate_duplicate_ids() {
        let def = parse(
            r#"{"name": "wf", "nodes": [
                {"id": "a", "type": "value"},
                {"id": "a", "type": "value"}
            ]}"#,
        );
        assert!(validate_definition(&def).is_err());
    }

    #[test]
    fn test_validate_dangling_edge() {
        let def = parse(
            r#"{"name": "wf",
                "nodes": [{"id": "a", "type": "value"}],
                "edges": [{"source": "a", "target": "ghost"}]}"#,
        );
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_validate_cycle() {
        let def = parse(
            r#"{"name": "wf",
                "nodes": [
                    {"id": "a", "type": "value"},
                    {"id": "b", "type": "value"}
                ],
                "edges": [
                    {"source": "a", "target": "b"},
                    {"source": "b", "target": "a"}
                ]}"#,
        );
        assert!(validate_definition(&def).is_err());
    }

    #[test]
    fn test_validate_self_loop() {
        let def = parse(
            r#"{"name": "wf",
                "nodes": [{"id": "a", "type": "value"}],
                "edges": [{"source": "a", "target": "a"}]}"#,
        );
        assert!(validate_definition(&def).is_err());
    }

    #[test]
    fn test_validate_diamond_ok() {
        let def = parse(
            r#"{"name": "wf",
                "nodes": [
                    {"id": "a", "type": "value"},
                    {"id": "b", "type": "value"},
                    {"id": "c", "type": "value"},
                    {"id": "d", "type": "merge"}
                ],
                "edges": [
                    {"source": "a", "target": "b"},
                    {"source": "a", "target": "c"},
                    {"source": "b", "target": "d"},
                    {"source": "c", "target": "d"}
                ]}"#,
        );
        assert!(validate_definition(&def).is_ok());
    }
}
