//! Node contract, registry, and built-in node types.

mod builtin;
mod function;
mod registry;
mod types;

pub use builtin::register_builtin_nodes;
pub use function::FnNode;
pub use registry::{NodeFactory, NodeRegistry};
pub use types::{Node, NodeError, NodeMetadata, NodeOutput, UpstreamResults};
