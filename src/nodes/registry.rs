//! Node registry - maps node type tags to factories.
//!
//! The registry decouples the scheduler from what nodes do: scheduling only
//! ever sees a type tag, and resolves it here into an executable instance.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use super::types::{Node, NodeMetadata};
use crate::error::{Error, Result};

/// Factory producing a node instance from its config.
pub type NodeFactory =
    Box<dyn Fn(&Value) -> std::result::Result<Arc<dyn Node>, String> + Send + Sync>;

struct RegistryEntry {
    metadata: NodeMetadata,
    factory: NodeFactory,
}

/// Registry of available node types.
///
/// Registration happens during engine startup; after that the registry is
/// only read, so the lock is effectively uncontended.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    entries: Arc<RwLock<HashMap<String, Arc<RegistryEntry>>>>,
}

impl NodeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node type. Re-registering an existing tag is an error,
    /// not a replacement.
    pub fn register(&self, metadata: NodeMetadata, factory: NodeFactory) -> Result<()> {
        let mut entries = self.entries.write().expect("registry lock poisoned");
        let node_type = metadata.node_type.clone();
        if entries.contains_key(&node_type) {
            return Err(Error::DuplicateNodeType(node_type));
        }
        entries.insert(node_type, Arc::new(RegistryEntry { metadata, factory }));
        Ok(())
    }

    /// Instantiate a node of the given type from its config.
    pub fn instantiate(&self, node_type: &str, config: &Value) -> Result<Arc<dyn Node>> {
        let entry = {
            let entries = self.entries.read().expect("registry lock poisoned");
            entries
                .get(node_type)
                .cloned()
                .ok_or_else(|| Error::UnknownNodeType(node_type.to_string()))?
        };

        (entry.factory)(config).map_err(|message| Error::InvalidNodeConfig {
            node_type: node_type.to_string(),
            message,
        })
    }

    /// Check if a node type is registered.
    pub fn has(&self, node_type: &str) -> bool {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .contains_key(node_type)
    }

    /// Metadata for all registered node types, sorted by type tag.
    pub fn list_types(&self) -> Vec<NodeMetadata> {
        let entries = self.entries.read().expect("registry lock poisoned");
        let mut types: Vec<NodeMetadata> =
            entries.values().map(|e| e.metadata.clone()).collect();
        types.sort_by(|a, b| a.node_type.cmp(&b.node_type));
        types
    }
}
