//! Execution history (spec §3, §4.2, §4.8): one `JobExecution` row per
//! dispatched job run, opened when the worker pool claims it and closed
//! once the handler returns.

use std::borrow::Cow;

use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::error::{Categorizable, ErrorCategory};
use crate::types::JobExecution;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl Categorizable for ExecutionError {
    fn category(&self) -> ErrorCategory {
        match self {
            ExecutionError::Database(e) => e.category(),
        }
    }

    fn reason(&self) -> Cow<'static, str> {
        Cow::Borrowed("execution_store_error")
    }
}

/// Storage seam for execution history, kept narrow like [`crate::scheduler::JobRepository`].
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Open a new execution row for `job_id`, assigning the next monotonic
    /// `execution_number` for that job.
    async fn start(&self, job_id: Uuid) -> Result<JobExecution, ExecutionError>;

    /// Persist a finished (or in-progress) execution's full state.
    async fn save(&self, execution: &JobExecution) -> Result<(), ExecutionError>;
}

pub struct PostgresExecutionStore {
    pool: PgPool,
}

impl PostgresExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExecutionStore for PostgresExecutionStore {
    async fn start(&self, job_id: Uuid) -> Result<JobExecution, ExecutionError> {
        let execution_number: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(execution_number), 0) + 1 FROM job_executions WHERE job_id = $1")
                .bind(job_id)
                .fetch_one(&self.pool)
                .await?;

        let execution = JobExecution::builder().job_id(job_id).execution_number(execution_number).build();

        sqlx::query(
            r#"
            INSERT INTO job_executions (id, job_id, execution_number, status, started_at, status_codes)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(execution.id)
        .bind(execution.job_id)
        .bind(execution.execution_number)
        .bind(execution.status)
        .bind(execution.started_at)
        .bind(&execution.status_codes)
        .execute(&self.pool)
        .await?;

        Ok(execution)
    }

    async fn save(&self, execution: &JobExecution) -> Result<(), ExecutionError> {
        sqlx::query(
            r#"
            UPDATE job_executions
            SET status = $2, completed_at = $3, duration_ms = $4, retry_attempt = $5,
                items_crawled = $6, items_indexed = $7, errors = $8, requests_total = $9,
                requests_failed = $10, bytes_fetched = $11, status_codes = $12
            WHERE id = $1
            "#,
        )
        .bind(execution.id)
        .bind(execution.status)
        .bind(execution.completed_at)
        .bind(execution.duration_ms)
        .bind(execution.retry_attempt)
        .bind(execution.items_crawled)
        .bind(execution.items_indexed)
        .bind(execution.errors)
        .bind(execution.requests_total)
        .bind(execution.requests_failed)
        .bind(execution.bytes_fetched)
        .bind(&execution.status_codes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory test double, used by worker-pool unit tests that exercise the
/// completion path without a database.
#[derive(Default)]
pub struct InMemoryExecutionStore {
    executions: tokio::sync::Mutex<std::collections::HashMap<Uuid, JobExecution>>,
    next_number: tokio::sync::Mutex<std::collections::HashMap<Uuid, i64>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: Uuid) -> Option<JobExecution> {
        self.executions.lock().await.get(&id).cloned()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn start(&self, job_id: Uuid) -> Result<JobExecution, ExecutionError> {
        let mut counters = self.next_number.lock().await;
        let number = counters.entry(job_id).or_insert(0);
        *number += 1;
        let execution = JobExecution::builder().job_id(job_id).execution_number(*number).build();
        self.executions.lock().await.insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn save(&self, execution: &JobExecution) -> Result<(), ExecutionError> {
        self.executions.lock().await.insert(execution.id, execution.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExecutionStatus;

    #[tokio::test]
    async fn start_assigns_increasing_execution_numbers_per_job() {
        let store = InMemoryExecutionStore::new();
        let job_id = Uuid::new_v4();
        let first = store.start(job_id).await.unwrap();
        let second = store.start(job_id).await.unwrap();
        assert_eq!(first.execution_number, 1);
        assert_eq!(second.execution_number, 2);
    }

    #[tokio::test]
    async fn save_persists_finished_state() {
        let store = InMemoryExecutionStore::new();
        let job_id = Uuid::new_v4();
        let mut execution = store.start(job_id).await.unwrap();
        execution.finish(ExecutionStatus::Succeeded, chrono::Utc::now());
        store.save(&execution).await.unwrap();

        let stored = store.get(execution.id).await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Succeeded);
        assert!(stored.duration_ms.is_some());
    }
}
