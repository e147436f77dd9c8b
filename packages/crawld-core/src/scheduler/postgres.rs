use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{JobRepository, SchedulerError};
use crate::types::Job;

/// Postgres-backed [`JobRepository`]. `due_jobs` orders by
/// `(priority asc, next_run_at asc)` per spec §4.3 step 1.
pub struct PostgresJobRepository {
    pool: PgPool,
}

impl PostgresJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for PostgresJobRepository {
    async fn due_jobs(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>, SchedulerError> {
        let jobs: Vec<Job> = sqlx::query_as(
            r#"
            SELECT id, source_id, url, status, is_paused, strategy, next_run_at, priority,
                   max_retries, retry_backoff_seconds, auto_managed, scheduler_version,
                   trigger_webhook, trigger_channel, depends_on, created_at, updated_at
            FROM jobs
            WHERE NOT is_paused
              AND status IN ('scheduled', 'pending')
              AND next_run_at <= $1
            ORDER BY priority ASC, next_run_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(crate::queue::QueueError::from)?;
        Ok(jobs)
    }

    async fn get(&self, job_id: Uuid) -> Result<Job, SchedulerError> {
        sqlx::query_as(
            r#"
            SELECT id, source_id, url, status, is_paused, strategy, next_run_at, priority,
                   max_retries, retry_backoff_seconds, auto_managed, scheduler_version,
                   trigger_webhook, trigger_channel, depends_on, created_at, updated_at
            FROM jobs WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(crate::queue::QueueError::from)?
        .ok_or(SchedulerError::NotFound(job_id))
    }

    async fn save(&self, job: Job) -> Result<(), SchedulerError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, source_id, url, status, is_paused, strategy, next_run_at, priority,
                               max_retries, retry_backoff_seconds, auto_managed, scheduler_version,
                               trigger_webhook, trigger_channel, depends_on, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, NOW())
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                is_paused = EXCLUDED.is_paused,
                strategy = EXCLUDED.strategy,
                next_run_at = EXCLUDED.next_run_at,
                priority = EXCLUDED.priority,
                updated_at = NOW()
            "#,
        )
        .bind(job.id)
        .bind(&job.source_id)
        .bind(&job.url)
        .bind(job.status)
        .bind(job.is_paused)
        .bind(sqlx::types::Json(&job.strategy))
        .bind(job.next_run_at)
        .bind(job.priority)
        .bind(job.max_retries)
        .bind(job.retry_backoff_seconds)
        .bind(job.auto_managed)
        .bind(job.scheduler_version)
        .bind(&job.trigger_webhook)
        .bind(&job.trigger_channel)
        .bind(&job.depends_on)
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .map_err(crate::queue::QueueError::from)?;
        Ok(())
    }

    async fn find_by_source_id(&self, source_id: &str) -> Result<Option<Job>, SchedulerError> {
        let job: Option<Job> = sqlx::query_as(
            r#"
            SELECT id, source_id, url, status, is_paused, strategy, next_run_at, priority,
                   max_retries, retry_backoff_seconds, auto_managed, scheduler_version,
                   trigger_webhook, trigger_channel, depends_on, created_at, updated_at
            FROM jobs WHERE source_id = $1
            "#,
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(crate::queue::QueueError::from)?;
        Ok(job)
    }
}
