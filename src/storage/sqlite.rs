//! SQLite persistence for workflows, executions, and the job queue.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use super::models::{Execution, ExecutionStatus, JobRow, NodeErrorRecord};
use crate::error::{Error, Result};
use crate::workflow::Workflow;

/// SQLite-backed durable storage.
///
/// One connection, serialized behind an async mutex. Every write the engine
/// performs goes through here; the in-memory caches in the state store sit
/// on top and never get ahead of what this layer has committed.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                definition TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                initial_input TEXT NOT NULL,
                node_results TEXT NOT NULL,
                node_errors TEXT NOT NULL,
                fatal_error TEXT,
                FOREIGN KEY (workflow_id) REFERENCES workflows(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                input TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                attempts_remaining INTEGER NOT NULL,
                enqueued_at TEXT NOT NULL,
                available_at TEXT NOT NULL,
                claimed INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_executions_workflow ON executions(workflow_id);
            CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(claimed, available_at);
            CREATE INDEX IF NOT EXISTS idx_jobs_execution ON jobs(execution_id);
            "#,
        )?;
        Ok(())
    }

    // ========================================================================
    // Workflow operations
    // ========================================================================

    pub async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        let definition = serde_json::to_string(workflow)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO workflows (id, name, definition, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                workflow.id,
                workflow.name,
                definition,
                workflow.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        let conn = self.conn.lock().await;
        let definition: Option<String> = conn
            .query_row(
                "SELECT definition FROM workflows WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?;

        match definition {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    pub async fn list_workflows(&self) -> Result<Vec<Workflow>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT definition FROM workflows ORDER BY created_at, id")?;
        let definitions = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        definitions
            .iter()
            .map(|text| serde_json::from_str(text).map_err(Error::from))
            .collect()
    }

    // ========================================================================
    // Execution operations
    // ========================================================================

    pub async fn save_execution(&self, execution: &Execution) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO executions
                (id, workflow_id, status, started_at, ended_at,
                 initial_input, node_results, node_errors, fatal_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                execution.id,
                execution.workflow_id,
                execution.status.to_string(),
                execution.started_at.to_rfc3339(),
                execution.ended_at.map(|t| t.to_rfc3339()),
                serde_json::to_string(&execution.initial_input)?,
                serde_json::to_string(&execution.node_results)?,
                serde_json::to_string(&execution.node_errors)?,
                execution.fatal_error,
            ],
        )?;
        Ok(())
    }

    pub async fn get_execution(&self, id: &str) -> Result<Option<Execution>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, workflow_id, status, started_at, ended_at,
                    initial_input, node_results, node_errors, fatal_error
             FROM executions WHERE id = ?1",
        )?;
        let execution = stmt.query_row([id], row_to_execution).optional()?;
        Ok(execution)
    }

    pub async fn list_executions(&self, workflow_id: Option<&str>) -> Result<Vec<Execution>> {
        let conn = self.conn.lock().await;
        let executions = match workflow_id {
            Some(wf) => {
                let mut stmt = conn.prepare(
                    "SELECT id, workflow_id, status, started_at, ended_at,
                            initial_input, node_results, node_errors, fatal_error
                     FROM executions WHERE workflow_id = ?1 ORDER BY started_at, id",
                )?;
                let rows = stmt.query_map([wf], row_to_execution)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, workflow_id, status, started_at, ended_at,
                            initial_input, node_results, node_errors, fatal_error
                     FROM executions ORDER BY started_at, id",
                )?;
                let rows = stmt.query_map([], row_to_execution)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            }
        };
        Ok(executions)
    }

    // ========================================================================
    // Job queue operations
    // ========================================================================

    pub async fn enqueue_job(&self, job: &JobRow) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO jobs
                (id, execution_id, node_id, input, attempt, attempts_remaining,
                 enqueued_at, available_at, claimed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)",
            params![
                job.id,
                job.execution_id,
                job.node_id,
                serde_json::to_string(&job.input)?,
                job.attempt,
                job.attempts_remaining,
                job.enqueued_at.to_rfc3339(),
                job.available_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Atomically fetch the oldest due unclaimed job and mark it claimed.
    ///
    /// The single-connection mutex makes the select-then-update pair atomic
    /// with respect to other workers.
    pub async fn claim_next_job(&self, now: DateTime<Utc>) -> Result<Option<JobRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, execution_id, node_id, input, attempt, attempts_remaining,
                    enqueued_at, available_at
             FROM jobs
             WHERE claimed = 0 AND available_at <= ?1
             ORDER BY enqueued_at, id
             LIMIT 1",
        )?;
        let job = stmt
            .query_row([now.to_rfc3339()], row_to_job)
            .optional()?;

        if let Some(ref job) = job {
            conn.execute("UPDATE jobs SET claimed = 1 WHERE id = ?1", [&job.id])?;
        }

        Ok(job)
    }

    /// Re-enqueue a claimed job for a later attempt.
    pub async fn release_job(
        &self,
        id: &str,
        attempt: u32,
        attempts_remaining: u32,
        available_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE jobs
             SET claimed = 0, attempt = ?1, attempts_remaining = ?2, available_at = ?3
             WHERE id = ?4",
            params![attempt, attempts_remaining, available_at.to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub async fn delete_job(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Unclaim every job. Called once at startup so work that was in flight
    /// at process death gets redelivered.
    pub async fn reset_claimed_jobs(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count = conn.execute("UPDATE jobs SET claimed = 0 WHERE claimed = 1", [])?;
        Ok(count as u64)
    }

    /// Total undelivered backlog (claimed or not).
    pub async fn count_jobs(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count: u64 = conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?;
        Ok(count)
    }

    pub async fn jobs_for_execution(&self, execution_id: &str) -> Result<Vec<JobRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, execution_id, node_id, input, attempt, attempts_remaining,
                    enqueued_at, available_at
             FROM jobs WHERE execution_id = ?1 ORDER BY enqueued_at, id",
        )?;
        let jobs = stmt
            .query_map([execution_id], row_to_job)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    pub async fn delete_jobs_for_execution(&self, execution_id: &str) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count = conn.execute("DELETE FROM jobs WHERE execution_id = ?1", [execution_id])?;
        Ok(count as u64)
    }
}

fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<Execution> {
    let status_text: String = row.get(2)?;
    let initial_input: String = row.get(5)?;
    let node_results: String = row.get(6)?;
    let node_errors: String = row.get(7)?;

    Ok(Execution {
        id: row.get(0)?,
        workflow_id: row.get(1)?,
        status: status_text
            .parse::<ExecutionStatus>()
            .unwrap_or(ExecutionStatus::Failed),
        started_at: parse_timestamp(row, 3)?,
        ended_at: parse_optional_timestamp(row, 4)?,
        initial_input: serde_json::from_str(&initial_input).unwrap_or_default(),
        node_results: serde_json::from_str::<HashMap<String, serde_json::Value>>(&node_results)
            .unwrap_or_default(),
        node_errors: serde_json::from_str::<HashMap<String, NodeErrorRecord>>(&node_errors)
            .unwrap_or_default(),
        fatal_error: row.get(8)?,
        in_flight: HashSet::new(),
    })
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<JobRow> {
    let input: String = row.get(3)?;
    Ok(JobRow {
        id: row.get(0)?,
        execution_id: row.get(1)?,
        node_id: row.get(2)?,
        input: serde_json::from_str(&input).unwrap_or_default(),
        attempt: row.get(4)?,
        attempts_remaining: row.get(5)?,
        enqueued_at: parse_timestamp(row, 6)?,
        available_at: parse_timestamp(row, 7)?,
    })
}

fn parse_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn parse_optional_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    match text {
        Some(text) => DateTime::parse_from_rfc3339(&text)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            }),
        None => Ok(None),
    }
}
