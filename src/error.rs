//! Error types for dagr.
//!
//! Errors carry a stable machine-readable code so callers embedding the
//! engine can branch on failures without string matching.

use thiserror::Error;

/// Result type alias for dagr operations.
pub type Result<T> = std::result::Result<T, Error>;

/// dagr error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Workflow definition rejected at creation (cycle, dangling edge,
    /// duplicate id, missing fields).
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Node type already registered: {0}")]
    DuplicateNodeType(String),

    #[error("Invalid node config for '{node_type}': {message}")]
    InvalidNodeConfig { node_type: String, message: String },

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Execution cancelled: {0}")]
    Cancelled(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the stable error code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidWorkflow(_) => "INVALID_WORKFLOW",
            Error::WorkflowNotFound(_) => "WORKFLOW_NOT_FOUND",
            Error::ExecutionNotFound(_) => "EXECUTION_NOT_FOUND",
            Error::UnknownNodeType(_) => "UNKNOWN_NODE_TYPE",
            Error::DuplicateNodeType(_) => "DUPLICATE_NODE_TYPE",
            Error::InvalidNodeConfig { .. } => "INVALID_NODE_CONFIG",
            Error::Execution(_) => "EXECUTION_ERROR",
            Error::Cancelled(_) => "CANCELLED",
            Error::Queue(_) => "QUEUE_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Yaml(_) => "YAML_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// Convert to a structured JSON error body.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        })
    }
}
