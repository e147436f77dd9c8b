//! Bounded worker pool that claims from the [`PriorityQueue`] and runs jobs
//! under a semaphore (spec §4.2, §5).

use std::borrow::Cow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Categorizable, ErrorCategory};
use crate::execution::ExecutionStore;
use crate::logs::{BlobStore, LogHub};
use crate::queue::{Claimed, PriorityQueue};
use crate::types::{ExecutionStatus, Job, LogCategory, LogEntry, LogLevel};

#[derive(Debug, Error)]
pub enum WorkerPoolError {
    #[error("job handler timed out after {0:?}")]
    Timeout(Duration),
    #[error("job handler panicked or returned an error: {0}")]
    HandlerFailed(#[source] anyhow::Error),
}

impl Categorizable for WorkerPoolError {
    fn category(&self) -> ErrorCategory {
        match self {
            WorkerPoolError::Timeout(_) => ErrorCategory::Timeout,
            WorkerPoolError::HandlerFailed(_) => ErrorCategory::Internal,
        }
    }

    fn reason(&self) -> Cow<'static, str> {
        match self {
            WorkerPoolError::Timeout(_) => Cow::Borrowed("handler_timeout"),
            WorkerPoolError::HandlerFailed(_) => Cow::Borrowed("handler_failed"),
        }
    }
}

/// Executes a claimed job. Registered once per process; the pool fans
/// claimed messages out to it under the concurrency semaphore.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub concurrency: usize,
    pub batch_size: usize,
    pub task_timeout: Duration,
    pub drain_timeout: Duration,
    pub poll_interval: Duration,
    pub claim_min_idle: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            batch_size: 10,
            task_timeout: Duration::from_secs(60 * 60),
            drain_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(200),
            claim_min_idle: Duration::from_secs(5 * 60),
        }
    }
}

/// Live counters exposed for the log/metrics category (spec §4.8).
#[derive(Default)]
pub struct WorkerPoolMetrics {
    pub in_flight: AtomicUsize,
    pub completed: AtomicUsize,
    pub failed: AtomicUsize,
}

pub struct WorkerPool<Q: PriorityQueue> {
    queue: Arc<Q>,
    handler: Arc<dyn JobHandler>,
    executions: Arc<dyn ExecutionStore>,
    logs: Arc<LogHub>,
    blobs: Arc<dyn BlobStore>,
    config: WorkerPoolConfig,
    consumer_id: String,
    metrics: Arc<WorkerPoolMetrics>,
}

impl<Q: PriorityQueue + 'static> WorkerPool<Q> {
    pub fn new(
        queue: Arc<Q>,
        handler: Arc<dyn JobHandler>,
        executions: Arc<dyn ExecutionStore>,
        logs: Arc<LogHub>,
        blobs: Arc<dyn BlobStore>,
        config: WorkerPoolConfig,
        consumer_id: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            handler,
            executions,
            logs,
            blobs,
            config,
            consumer_id: consumer_id.into(),
            metrics: Arc::new(WorkerPoolMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<WorkerPoolMetrics> {
        self.metrics.clone()
    }

    /// Run one claim-and-dispatch cycle. Returns the number of jobs
    /// dispatched, so callers (and tests) can drive the loop deterministically
    /// instead of sleeping on a fixed poll interval.
    ///
    /// Reclaims this consumer group's own stale pending entries before
    /// claiming fresh work (spec §4.1, §5): a crashed peer's unacked
    /// messages become visible again once idle past `claim_min_idle`,
    /// which is what makes delivery at-least-once rather than at-most-once.
    pub async fn tick(&self, semaphore: &Semaphore) -> anyhow::Result<usize> {
        let available = semaphore.available_permits().min(self.config.batch_size);
        if available == 0 {
            return Ok(0);
        }
        let reclaimed = self.queue.reclaim_stale(&self.consumer_id, self.config.claim_min_idle).await?;
        let mut n = 0;
        for item in reclaimed.into_iter().take(available) {
            self.spawn_one(item, semaphore).await;
            n += 1;
        }
        let remaining = available - n;
        if remaining > 0 {
            let claimed = self.queue.claim(&self.consumer_id, remaining).await?;
            n += claimed.len();
            for item in claimed {
                self.spawn_one(item, semaphore).await;
            }
        }
        Ok(n)
    }

    async fn spawn_one(&self, item: Claimed, semaphore: &Semaphore) {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return,
        };
        let handler = self.handler.clone();
        let queue = self.queue.clone();
        let executions = self.executions.clone();
        let logs = self.logs.clone();
        let blobs = self.blobs.clone();
        let metrics = self.metrics.clone();
        let task_timeout = self.config.task_timeout;

        metrics.in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let _permit = permit;
            let Claimed { stream, message } = item;
            let job = message.job.clone();

            let mut execution = match executions.start(job.id).await {
                Ok(execution) => Some(execution),
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "failed to open execution record");
                    None
                }
            };
            if let Some(execution) = &execution {
                logs.publish(
                    job.id,
                    execution.execution_number,
                    LogEntry::builder()
                        .level(LogLevel::Info)
                        .category(LogCategory::Lifecycle)
                        .message("job started")
                        .job_id(job.id)
                        .execution_id(execution.id)
                        .build(),
                )
                .await;
            }

            let result = timeout(task_timeout, handler.handle(&job)).await;

            let status = match &result {
                Ok(Ok(())) => ExecutionStatus::Succeeded,
                Ok(Err(_)) | Err(_) => ExecutionStatus::Failed,
            };
            if let Some(execution) = execution.as_mut() {
                execution.finish(status, chrono::Utc::now());
                if let Err(e) = executions.save(execution).await {
                    warn!(job_id = %job.id, error = %e, "failed to save execution record");
                }
                logs.publish(
                    job.id,
                    execution.execution_number,
                    LogEntry::builder()
                        .level(if status == ExecutionStatus::Succeeded { LogLevel::Info } else { LogLevel::Error })
                        .category(LogCategory::Lifecycle)
                        .message(format!("job {status:?} in {}ms", execution.duration_ms.unwrap_or_default()))
                        .job_id(job.id)
                        .execution_id(execution.id)
                        .build(),
                )
                .await;
                if let Err(e) = logs.archive(blobs.as_ref(), job.id, execution.execution_number).await {
                    warn!(job_id = %job.id, error = %e, "failed to archive execution log");
                }
            }

            match result {
                Ok(Ok(())) => {
                    metrics.completed.fetch_add(1, Ordering::SeqCst);
                    if let (Some(id), false) = (message.message_id.as_deref(), stream.is_empty()) {
                        if let Err(e) = queue.ack(&stream, id).await {
                            warn!(error = %e, "failed to ack completed job");
                        }
                    }
                    info!(
                        job_id = %job.id,
                        execution_number = execution.as_ref().map(|e| e.execution_number),
                        duration_ms = execution.as_ref().and_then(|e| e.duration_ms),
                        "job completed"
                    );
                }
                Ok(Err(e)) => {
                    metrics.failed.fetch_add(1, Ordering::SeqCst);
                    error!(
                        job_id = %job.id,
                        execution_number = execution.as_ref().map(|e| e.execution_number),
                        error = %e,
                        "job handler returned error"
                    );
                }
                Err(_) => {
                    metrics.failed.fetch_add(1, Ordering::SeqCst);
                    error!(
                        job_id = %job.id,
                        execution_number = execution.as_ref().map(|e| e.execution_number),
                        timeout = ?task_timeout,
                        "job handler timed out"
                    );
                }
            }
            metrics.in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Poll loop honoring cooperative shutdown (spec §5): on cancellation,
    /// stop claiming new work and wait up to `drain_timeout` for in-flight
    /// jobs to finish before returning.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.tick(&semaphore).await {
                        warn!(error = %e, "worker pool tick failed");
                    }
                }
            }
        }

        let drain = timeout(self.config.drain_timeout, async {
            let _ = semaphore.acquire_many(self.config.concurrency as u32).await;
        })
        .await;
        if drain.is_err() {
            warn!(
                in_flight = self.metrics.in_flight.load(Ordering::SeqCst),
                "drain timeout elapsed with jobs still in flight"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::InMemoryExecutionStore;
    use crate::logs::{InMemoryBlobStore, LogHub};
    use crate::queue::InMemoryPriorityQueue;
    use crate::types::QueueMessage;
    use std::sync::atomic::AtomicBool;

    struct RecordingHandler {
        called: Arc<AtomicBool>,
    }

    #[async_trait]
    impl JobHandler for RecordingHandler {
        async fn handle(&self, _job: &Job) -> anyhow::Result<()> {
            self.called.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn tick_dispatches_claimed_jobs() {
        let queue = Arc::new(InMemoryPriorityQueue::new());
        let job = Job::builder()
            .source_id("source-a")
            .url("https://example.com")
            .build();
        queue.enqueue(QueueMessage::new(job)).await.unwrap();

        let called = Arc::new(AtomicBool::new(false));
        let handler = Arc::new(RecordingHandler { called: called.clone() });
        let executions = Arc::new(InMemoryExecutionStore::new());
        let logs = Arc::new(LogHub::new(16));
        let blobs = Arc::new(InMemoryBlobStore::new());
        let pool = WorkerPool::new(queue, handler, executions, logs, blobs, WorkerPoolConfig::default(), "worker-a");
        let sem = Semaphore::new(4);

        let n = pool.tick(&sem).await.unwrap();
        assert_eq!(n, 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn tick_respects_available_permits() {
        let queue = Arc::new(InMemoryPriorityQueue::new());
        for _ in 0..5 {
            let job = Job::builder()
                .source_id("source-a")
                .url("https://example.com")
                .build();
            queue.enqueue(QueueMessage::new(job)).await.unwrap();
        }
        let handler = Arc::new(RecordingHandler {
            called: Arc::new(AtomicBool::new(false)),
        });
        let executions = Arc::new(InMemoryExecutionStore::new());
        let logs = Arc::new(LogHub::new(16));
        let blobs = Arc::new(InMemoryBlobStore::new());
        let pool = WorkerPool::new(queue, handler, executions, logs, blobs, WorkerPoolConfig::default(), "worker-a");
        let sem = Semaphore::new(2);
        let n = pool.tick(&sem).await.unwrap();
        assert_eq!(n, 2);
    }
}
