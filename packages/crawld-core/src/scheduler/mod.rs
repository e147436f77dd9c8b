//! Leader-gated poll loop that moves due jobs from the job repository onto
//! the priority queue, and recomputes `next_run_at` on completion
//! (spec §4.3).

mod memory;
mod postgres;
mod stagger;

use std::borrow::Cow;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Categorizable, ErrorCategory};
use crate::queue::{PriorityQueue, QueueError};
use crate::types::{Job, JobStatus, ScheduleStrategy};

pub use memory::InMemoryJobRepository;
pub use postgres::PostgresJobRepository;
pub use stagger::stagger_offset;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("invalid cron expression {0:?}: {1}")]
    BadCron(String, String),
}

impl Categorizable for SchedulerError {
    fn category(&self) -> ErrorCategory {
        match self {
            SchedulerError::NotFound(_) => ErrorCategory::NotFound,
            SchedulerError::Queue(e) => e.category(),
            SchedulerError::BadCron(..) => ErrorCategory::Validation,
        }
    }

    fn reason(&self) -> Cow<'static, str> {
        match self {
            SchedulerError::NotFound(_) => Cow::Borrowed("job_not_found"),
            SchedulerError::Queue(_) => Cow::Borrowed("queue_error"),
            SchedulerError::BadCron(..) => Cow::Borrowed("bad_cron_expression"),
        }
    }
}

/// Storage seam the scheduler polls and writes back through. Kept narrow —
/// only what the poll loop and completion handler need — so tests can swap
/// in [`InMemoryJobRepository`] without a database.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn due_jobs(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>, SchedulerError>;
    async fn get(&self, job_id: Uuid) -> Result<Job, SchedulerError>;
    async fn save(&self, job: Job) -> Result<(), SchedulerError>;
    async fn find_by_source_id(&self, source_id: &str) -> Result<Option<Job>, SchedulerError>;
}

/// Compute the next fire time for a job's strategy. `Immediate` and
/// `Event` jobs never recur through this path: `Immediate` fires once and
/// falls to `Completed`, `Event` jobs are only ever driven by the trigger
/// router.
pub fn next_run_at(strategy: &ScheduleStrategy, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, SchedulerError> {
    match strategy {
        ScheduleStrategy::Interval { value, unit } => {
            let dur = chrono::Duration::from_std(unit.to_duration(*value))
                .map_err(|e| SchedulerError::BadCron("interval".into(), e.to_string()))?;
            Ok(Some(now + dur))
        }
        ScheduleStrategy::Cron { expression } => {
            let schedule = Schedule::from_str(expression)
                .map_err(|e| SchedulerError::BadCron(expression.clone(), e.to_string()))?;
            Ok(schedule.after(&now).next())
        }
        ScheduleStrategy::Immediate => Ok(None),
        ScheduleStrategy::Event => Ok(None),
    }
}

pub struct Scheduler<Q: PriorityQueue> {
    repository: Arc<dyn JobRepository>,
    queue: Arc<Q>,
    batch_size: i64,
}

impl<Q: PriorityQueue + 'static> Scheduler<Q> {
    pub fn new(repository: Arc<dyn JobRepository>, queue: Arc<Q>, batch_size: i64) -> Self {
        Self {
            repository,
            queue,
            batch_size,
        }
    }

    /// One poll cycle (spec §4.3 step 1-3): fetch due jobs, enqueue each,
    /// flip status to `running` so a concurrent tick can't re-dispatch it.
    /// Caller is expected to only invoke this while holding the leader
    /// lease (spec §4.6) — the scheduler itself does not check leadership.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let due = self.repository.due_jobs(now, self.batch_size).await?;
        let mut dispatched = 0;
        for mut job in due {
            job.status = JobStatus::Scheduled;
            job.next_run_at = None;
            self.queue
                .enqueue(crate::types::QueueMessage::new(job.clone()))
                .await?;
            self.repository.save(job.clone()).await?;
            dispatched += 1;
            info!(job_id = %job.id, source_id = %job.source_id, "dispatched job");
        }
        Ok(dispatched)
    }

    /// Handle a completed execution (spec §4.3 step 4): recurring
    /// strategies get their next `next_run_at` computed from `now`,
    /// one-shot strategies complete.
    pub async fn complete(&self, job_id: Uuid, succeeded: bool, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        let mut job = self.repository.get(job_id).await?;
        match next_run_at(&job.strategy, now)? {
            Some(next) => {
                job.status = JobStatus::Scheduled;
                job.next_run_at = Some(next);
            }
            None => {
                job.status = if succeeded { JobStatus::Completed } else { JobStatus::Failed };
                job.next_run_at = None;
            }
        }
        self.repository.save(job).await
    }

    /// Force-run (spec §4.3, property 9): bypasses `next_run_at` and
    /// dispatches immediately regardless of schedule, subject to the same
    /// status guard as any other force-run.
    pub async fn force_run(&self, job_id: Uuid) -> Result<(), SchedulerError> {
        let mut job = self.repository.get(job_id).await?;
        job.force_run().map_err(|_| SchedulerError::NotFound(job_id))?;
        self.queue
            .enqueue(crate::types::QueueMessage::new(job.clone()))
            .await?;
        self.repository.save(job).await
    }

    /// Apply a fresh source-sync's stagger slot to a newly created job's
    /// first `next_run_at` (spec §4.3, §4.7): deterministic by `source_id`
    /// so restarts don't reshuffle the whole fleet's fire times.
    pub fn initial_next_run_at(
        &self,
        source_id: &str,
        source_count: usize,
        stagger_unit: std::time::Duration,
        base: DateTime<Utc>,
    ) -> DateTime<Utc> {
        base + chrono::Duration::from_std(stagger_offset(source_id, source_count, stagger_unit)).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryPriorityQueue;
    use std::time::Duration;

    fn job(strategy: ScheduleStrategy, status: JobStatus, next_run_at: Option<DateTime<Utc>>) -> Job {
        let mut job = Job::builder()
            .source_id("source-a")
            .url("https://example.com")
            .build();
        job.strategy = strategy;
        job.status = status;
        job.next_run_at = next_run_at;
        job
    }

    #[tokio::test]
    async fn tick_dispatches_due_jobs_and_clears_next_run_at() {
        let repo = Arc::new(InMemoryJobRepository::new());
        let due = job(
            ScheduleStrategy::Interval {
                value: 1,
                unit: crate::types::IntervalUnit::Hours,
            },
            JobStatus::Scheduled,
            Some(Utc::now() - chrono::Duration::minutes(1)),
        );
        let id = due.id;
        repo.seed(due).await;

        let queue = Arc::new(InMemoryPriorityQueue::new());
        let scheduler = Scheduler::new(repo.clone(), queue.clone(), 50);
        let n = scheduler.tick(Utc::now()).await.unwrap();
        assert_eq!(n, 1);

        let stored = repo.get(id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Scheduled);
        assert_eq!(stored.next_run_at, None);
    }

    #[tokio::test]
    async fn tick_skips_jobs_not_yet_due() {
        let repo = Arc::new(InMemoryJobRepository::new());
        let future = job(
            ScheduleStrategy::Immediate,
            JobStatus::Scheduled,
            Some(Utc::now() + chrono::Duration::hours(1)),
        );
        repo.seed(future).await;

        let queue = Arc::new(InMemoryPriorityQueue::new());
        let scheduler = Scheduler::new(repo, queue, 50);
        let n = scheduler.tick(Utc::now()).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn complete_reschedules_interval_jobs() {
        let repo = Arc::new(InMemoryJobRepository::new());
        let running = job(
            ScheduleStrategy::Interval {
                value: 10,
                unit: crate::types::IntervalUnit::Minutes,
            },
            JobStatus::Running,
            None,
        );
        let id = running.id;
        repo.seed(running).await;

        let queue = Arc::new(InMemoryPriorityQueue::new());
        let scheduler = Scheduler::new(repo.clone(), queue, 50);
        let now = Utc::now();
        scheduler.complete(id, true, now).await.unwrap();

        let stored = repo.get(id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Scheduled);
        assert_eq!(stored.next_run_at, Some(now + chrono::Duration::minutes(10)));
    }

    #[tokio::test]
    async fn complete_finishes_immediate_jobs() {
        let repo = Arc::new(InMemoryJobRepository::new());
        let running = job(ScheduleStrategy::Immediate, JobStatus::Running, None);
        let id = running.id;
        repo.seed(running).await;

        let queue = Arc::new(InMemoryPriorityQueue::new());
        let scheduler = Scheduler::new(repo.clone(), queue, 50);
        scheduler.complete(id, true, Utc::now()).await.unwrap();

        let stored = repo.get(id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
    }

    #[test]
    fn initial_next_run_at_is_deterministic_per_source() {
        let repo = Arc::new(InMemoryJobRepository::new());
        let queue = Arc::new(InMemoryPriorityQueue::new());
        let scheduler = Scheduler::new(repo, queue, 50);
        let base = Utc::now();
        let a = scheduler.initial_next_run_at("source-a", 10, Duration::from_secs(300), base);
        let b = scheduler.initial_next_run_at("source-a", 10, Duration::from_secs(300), base);
        assert_eq!(a, b);
    }
}
