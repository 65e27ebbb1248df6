//! Persistence: SQLite backing store, models, and the two-layer state store.

mod models;
mod sqlite;
mod store;

pub use models::{Execution, ExecutionStatus, JobRow, NodeErrorRecord};
pub use sqlite::SqliteStorage;
pub use store::StateStore;
