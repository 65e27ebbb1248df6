//! Storage models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Whether this status is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}

/// Terminal failure record for a single node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeErrorRecord {
    pub message: String,
    /// Attempts consumed before the failure became terminal.
    pub attempts: u32,
}

/// A single run of a workflow.
///
/// Mutated only through the state store's `patch_execution`, which serializes
/// all transitions per execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub initial_input: Value,

    /// Results of completed nodes, keyed by node id. Disjoint from
    /// `node_errors`.
    #[serde(default)]
    pub node_results: HashMap<String, Value>,

    /// Terminal failures, keyed by node id.
    #[serde(default)]
    pub node_errors: HashMap<String, NodeErrorRecord>,

    /// Summary set when the execution fails.
    #[serde(default)]
    pub fatal_error: Option<String>,

    /// Node ids currently enqueued or running. Not persisted: rebuilt from
    /// surviving job rows during crash recovery.
    #[serde(skip)]
    pub in_flight: HashSet<String>,
}

impl Execution {
    /// Create a fresh pending execution.
    pub fn new(id: String, workflow_id: String, initial_input: Value) -> Self {
        Self {
            id,
            workflow_id,
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            initial_input,
            node_results: HashMap::new(),
            node_errors: HashMap::new(),
            fatal_error: None,
            in_flight: HashSet::new(),
        }
    }

    /// A node is settled once it has either a result or a terminal error.
    pub fn is_settled(&self, node_id: &str) -> bool {
        self.node_results.contains_key(node_id) || self.node_errors.contains_key(node_id)
    }
}

/// A unit of queued work: one attempt window for one node of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRow {
    pub id: String,
    pub execution_id: String,
    pub node_id: String,
    /// Materialized node input (assembled at enqueue time).
    pub input: Value,
    /// 1-based delivery attempt.
    pub attempt: u32,
    /// Deliveries left, counting this one.
    pub attempts_remaining: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Earliest delivery time (backoff).
    pub available_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_round_trip() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
        ] {
            let text = status.to_string();
            assert_eq!(text.parse::<ExecutionStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_in_flight_not_serialized() {
        let mut execution = Execution::new("e-1".into(), "wf-1".into(), json!(null));
        execution.in_flight.insert("a".to_string());

        let value = serde_json::to_value(&execution).unwrap();
        assert!(value.get("in_flight").is_none());

        let back: Execution = serde_json::from_value(value).unwrap();
        assert!(back.in_flight.is_empty());
    }

    #[test]
    fn test_is_settled() {
        let mut execution = Execution::new("e-1".into(), "wf-1".into(), json!(null));
        execution.node_results.insert("a".into(), json!(1));
        execution.node_errors.insert(
            "b".into(),
            NodeErrorRecord {
                message: "boom".into(),
                attempts: 3,
            },
        );

        assert!(execution.is_settled("a"));
        assert!(execution.is_settled("b"));
        assert!(!execution.is_settled("c"));
    }
}
