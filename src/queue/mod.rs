//! Persistent job queue with a bounded worker pool.
//!
//! Work items live in the SQLite `jobs` table and are delivered at least
//! once: a row is deleted only when its handler reports a terminal outcome.
//! Retryable failures release the row back to the queue with exponentially
//! increasing delay; rows claimed by a worker that dies are unclaimed at the
//! next startup and redelivered.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::storage::{JobRow, SqliteStorage};

/// What a handler reports back for one delivery.
#[derive(Debug)]
pub enum JobOutcome {
    /// Work is settled (success or terminal failure already recorded by the
    /// handler). The row is deleted.
    Done,
    /// Transient failure. The row is released with backoff; once attempts
    /// are exhausted it is surfaced via [`JobHandler::exhausted`].
    Retry { error: String },
    /// The handler could not durably record its result. The row stays
    /// claimed so the job is redelivered after a restart.
    Park { error: String },
}

/// Consumer of queue deliveries.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Process one delivery.
    async fn handle(&self, job: &JobRow) -> JobOutcome;

    /// Called when a retryable failure has no attempts left. The row is
    /// deleted after this returns.
    async fn exhausted(&self, job: &JobRow, error: String);
}

/// Persistent FIFO of (execution, node) work items.
pub struct JobQueue {
    db: SqliteStorage,
    worker_count: usize,
    poll_interval: Duration,
    backlog_limit: u64,
    retry_base_delay: Duration,
    retry_max_delay: Duration,

    /// Wakes idle workers when work arrives.
    work_ready: Arc<Notify>,
    /// Wakes blocked enqueuers when backlog drains.
    space_ready: Arc<Notify>,
    accepting: AtomicBool,
    stopping: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobQueue {
    pub fn new(db: SqliteStorage, config: &EngineConfig) -> Self {
        Self {
            db,
            worker_count: config.max_concurrency.max(1),
            poll_interval: Duration::from_millis(config.queue.poll_interval_ms.max(1)),
            backlog_limit: config.queue.backlog_limit.max(1),
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(config.retry_max_delay_ms.max(1)),
            work_ready: Arc::new(Notify::new()),
            space_ready: Arc::new(Notify::new()),
            accepting: AtomicBool::new(true),
            stopping: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicUsize::new(0)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Enqueue a work item.
    ///
    /// Blocks (asynchronously) while the durable backlog is above the
    /// configured limit; callers are scheduler tasks, and blocking them is
    /// the designed backpressure.
    pub async fn enqueue(
        &self,
        execution_id: &str,
        node_id: &str,
        input: serde_json::Value,
        attempts_remaining: u32,
        initial_delay: Option<Duration>,
    ) -> Result<()> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Error::Queue("queue is shutting down".into()));
        }

        loop {
            let backlog = self.db.count_jobs().await?;
            if backlog < self.backlog_limit {
                break;
            }
            debug!(backlog, "job backlog full, enqueue waiting");
            // Re-check periodically in case the drain notification raced
            // the backlog read.
            tokio::select! {
                _ = self.space_ready.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        let now = Utc::now();
        let available_at = match initial_delay {
            Some(delay) => now + chrono::Duration::from_std(delay).unwrap_or_default(),
            None => now,
        };

        let job = JobRow {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id: execution_id.to_string(),
            node_id: node_id.to_string(),
            input,
            attempt: 1,
            attempts_remaining: attempts_remaining.max(1),
            enqueued_at: now,
            available_at,
        };

        self.db.enqueue_job(&job).await?;
        self.work_ready.notify_one();
        Ok(())
    }

    /// Start the worker pool.
    pub async fn start(self: Arc<Self>, handler: Arc<dyn JobHandler>) {
        let mut workers = self.workers.lock().await;
        for worker_id in 0..self.worker_count {
            let queue = self.clone();
            let handler = handler.clone();
            workers.push(tokio::spawn(async move {
                queue.worker_loop(worker_id, handler).await;
            }));
        }
        info!(workers = self.worker_count, "job queue workers started");
    }

    async fn worker_loop(&self, worker_id: usize, handler: Arc<dyn JobHandler>) {
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }

            let job = match self.db.claim_next_job(Utc::now()).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    tokio::select! {
                        _ = self.work_ready.notified() => {}
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                    continue;
                }
                Err(e) => {
                    error!(worker_id, "failed to claim job: {}", e);
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
            };

            self.active.fetch_add(1, Ordering::SeqCst);
            debug!(
                worker_id,
                job_id = %job.id,
                node_id = %job.node_id,
                attempt = job.attempt,
                "job delivered"
            );

            let outcome = handler.handle(&job).await;
            if let Err(e) = self.settle(&job, outcome, handler.as_ref()).await {
                // The row stays put; redelivery after restart covers it.
                error!(job_id = %job.id, "failed to settle job: {}", e);
            }

            self.active.fetch_sub(1, Ordering::SeqCst);
            self.space_ready.notify_waiters();
        }
        debug!(worker_id, "queue worker exiting");
    }

    async fn settle(
        &self,
        job: &JobRow,
        outcome: JobOutcome,
        handler: &dyn JobHandler,
    ) -> Result<()> {
        match outcome {
            JobOutcome::Done => self.db.delete_job(&job.id).await,
            JobOutcome::Park { error } => {
                warn!(
                    job_id = %job.id,
                    node_id = %job.node_id,
                    "parking job for redelivery after restart: {}",
                    error
                );
                Ok(())
            }
            JobOutcome::Retry { error } => {
                if job.attempts_remaining > 1 {
                    let delay = self.backoff_delay(job.attempt);
                    warn!(
                        job_id = %job.id,
                        node_id = %job.node_id,
                        attempt = job.attempt,
                        "retrying in {:?}: {}",
                        delay,
                        error
                    );
                    self.db
                        .release_job(
                            &job.id,
                            job.attempt + 1,
                            job.attempts_remaining - 1,
                            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default(),
                        )
                        .await
                } else {
                    handler.exhausted(job, error).await;
                    self.db.delete_job(&job.id).await
                }
            }
        }
    }

    /// Exponential backoff for the next delivery after `attempt` failed:
    /// `base * 2^(attempt-1)`, capped.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let delay = self
            .retry_base_delay
            .saturating_mul(1u32.checked_shl(shift).unwrap_or(u32::MAX));
        delay.min(self.retry_max_delay)
    }

    /// Unclaim rows left claimed by a previous process. Returns how many
    /// items will be redelivered.
    pub async fn recover(&self) -> Result<u64> {
        let redelivered = self.db.reset_claimed_jobs().await?;
        if redelivered > 0 {
            info!(redelivered, "unclaimed in-flight jobs from previous run");
            self.work_ready.notify_waiters();
        }
        Ok(redelivered)
    }

    /// Pending job rows for one execution (used to rebuild in-flight sets).
    pub async fn jobs_for_execution(&self, execution_id: &str) -> Result<Vec<JobRow>> {
        self.db.jobs_for_execution(execution_id).await
    }

    /// Drop all queued work for an execution (cancellation).
    pub async fn purge_execution(&self, execution_id: &str) -> Result<u64> {
        let purged = self.db.delete_jobs_for_execution(execution_id).await?;
        self.space_ready.notify_waiters();
        Ok(purged)
    }

    /// Stop accepting work, let in-flight jobs finish up to `grace`, then
    /// abort the workers. Queue state stays durable for the next start.
    pub async fn shutdown(&self, grace: Duration) {
        self.accepting.store(false, Ordering::SeqCst);
        self.stopping.store(true, Ordering::SeqCst);
        self.work_ready.notify_waiters();

        let deadline = tokio::time::Instant::now() + grace;
        while self.active.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    in_flight = self.active.load(Ordering::SeqCst),
                    "shutdown grace elapsed, aborting workers"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            worker.abort();
        }
        info!("job queue stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct RecordingHandler {
        /// node_id -> number of deliveries.
        deliveries: StdMutex<HashMap<String, u32>>,
        /// node_id -> outcome script per delivery ("ok", "retry").
        scripts: HashMap<String, Vec<&'static str>>,
        exhausted: StdMutex<Vec<String>>,
    }

    impl RecordingHandler {
        fn new(scripts: HashMap<String, Vec<&'static str>>) -> Self {
            Self {
                deliveries: StdMutex::new(HashMap::new()),
                scripts,
                exhausted: StdMutex::new(Vec::new()),
            }
        }

        fn delivery_count(&self, node_id: &str) -> u32 {
            *self.deliveries.lock().unwrap().get(node_id).unwrap_or(&0)
        }
    }

    #[async_trait]
    impl JobHandler for RecordingHandler {
        async fn handle(&self, job: &JobRow) -> JobOutcome {
            let count = {
                let mut deliveries = self.deliveries.lock().unwrap();
                let entry = deliveries.entry(job.node_id.clone()).or_insert(0);
                *entry += 1;
                *entry
            };

            let step = self
                .scripts
                .get(&job.node_id)
                .and_then(|script| script.get((count - 1) as usize))
                .copied()
                .unwrap_or("ok");

            match step {
                "retry" => JobOutcome::Retry {
                    error: "scripted transient failure".into(),
                },
                _ => JobOutcome::Done,
            }
        }

        async fn exhausted(&self, job: &JobRow, _error: String) {
            self.exhausted.lock().unwrap().push(job.node_id.clone());
        }
    }

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.max_concurrency = 2;
        config.retry_base_delay_ms = 10;
        config.queue.poll_interval_ms = 10;
        config
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 5s");
    }

    #[tokio::test]
    async fn test_delivery_and_completion() {
        let db = SqliteStorage::open_in_memory().unwrap();
        let queue = Arc::new(JobQueue::new(db.clone(), &test_config()));
        let handler = Arc::new(RecordingHandler::new(HashMap::new()));

        queue.clone().start(handler.clone() as Arc<dyn JobHandler>).await;
        queue
            .enqueue("e-1", "a", json!(null), 3, None)
            .await
            .unwrap();

        wait_until(|| handler.delivery_count("a") == 1).await;

        // The row is deleted once the handler reports Done.
        for _ in 0..100 {
            if db.count_jobs().await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(db.count_jobs().await.unwrap(), 0);

        queue.shutdown(Duration::from_millis(100)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_retry_until_success() {
        let db = SqliteStorage::open_in_memory().unwrap();
        let queue = Arc::new(JobQueue::new(db.clone(), &test_config()));
        let handler = Arc::new(RecordingHandler::new(HashMap::from([(
            "a".to_string(),
            vec!["retry", "retry", "ok"],
        )])));

        queue.clone().start(handler.clone() as Arc<dyn JobHandler>).await;
        queue
            .enqueue("e-1", "a", json!(null), 3, None)
            .await
            .unwrap();

        wait_until(|| handler.delivery_count("a") == 3).await;
        assert!(handler.exhausted.lock().unwrap().is_empty());

        queue.shutdown(Duration::from_millis(100)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_exhaustion_reported() {
        let db = SqliteStorage::open_in_memory().unwrap();
        let queue = Arc::new(JobQueue::new(db.clone(), &test_config()));
        let handler = Arc::new(RecordingHandler::new(HashMap::from([(
            "a".to_string(),
            vec!["retry", "retry", "retry"],
        )])));

        queue.clone().start(handler.clone() as Arc<dyn JobHandler>).await;
        queue
            .enqueue("e-1", "a", json!(null), 3, None)
            .await
            .unwrap();

        wait_until(|| handler.exhausted.lock().unwrap().len() == 1).await;
        // Exactly max_attempts deliveries, then the row is gone.
        assert_eq!(handler.delivery_count("a"), 3);
        assert_eq!(db.count_jobs().await.unwrap(), 0);

        queue.shutdown(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_enqueue_rejected_after_shutdown() {
        let db = SqliteStorage::open_in_memory().unwrap();
        let queue = Arc::new(JobQueue::new(db, &test_config()));
        queue.shutdown(Duration::from_millis(10)).await;

        let err = queue
            .enqueue("e-1", "a", json!(null), 3, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "QUEUE_ERROR");
    }

    #[tokio::test]
    async fn test_backoff_delay_series() {
        let mut config = test_config();
        config.retry_base_delay_ms = 100;
        config.retry_max_delay_ms = 450;
        let queue = JobQueue::new(SqliteStorage::open_in_memory().unwrap(), &config);

        assert_eq!(queue.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(queue.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(queue.backoff_delay(3), Duration::from_millis(400));
        // Capped.
        assert_eq!(queue.backoff_delay(4), Duration::from_millis(450));
        assert_eq!(queue.backoff_delay(31), Duration::from_millis(450));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_backpressure_blocks_then_drains() {
        let db = SqliteStorage::open_in_memory().unwrap();
        let mut config = test_config();
        config.queue.backlog_limit = 1;
        let queue = Arc::new(JobQueue::new(db, &config));
        let handler = Arc::new(RecordingHandler::new(HashMap::new()));

        queue.clone().start(handler.clone() as Arc<dyn JobHandler>).await;

        // With a backlog limit of one, later enqueues block until workers
        // drain earlier rows; all of them must still get through.
        for i in 0..5 {
            queue
                .enqueue("e-1", &format!("n{}", i), json!(null), 1, None)
                .await
                .unwrap();
        }

        wait_until(|| {
            (0..5).all(|i| handler.delivery_count(&format!("n{}", i)) == 1)
        })
        .await;

        queue.shutdown(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_recover_unclaims() {
        let db = SqliteStorage::open_in_memory().unwrap();
        {
            // Simulate a previous process that died mid-delivery.
            let queue = Arc::new(JobQueue::new(db.clone(), &test_config()));
            queue
                .enqueue("e-1", "a", json!(null), 3, None)
                .await
                .unwrap();
            db.claim_next_job(Utc::now()).await.unwrap().unwrap();
        }

        let queue = Arc::new(JobQueue::new(db.clone(), &test_config()));
        assert_eq!(queue.recover().await.unwrap(), 1);
        assert!(db.claim_next_job(Utc::now()).await.unwrap().is_some());
    }
}
