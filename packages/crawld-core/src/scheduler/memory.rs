use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{JobRepository, SchedulerError};
use crate::types::Job;

/// In-memory [`JobRepository`] used by scheduler tests and by
/// `InMemoryPriorityQueue`-based integration tests elsewhere in the
/// workspace.
#[derive(Default)]
pub struct InMemoryJobRepository {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, job: Job) {
        self.jobs.lock().await.insert(job.id, job);
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn due_jobs(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>, SchedulerError> {
        let jobs = self.jobs.lock().await;
        let mut due: Vec<Job> = jobs.values().filter(|j| j.is_ready(now)).cloned().collect();
        due.sort_by_key(|j| j.priority);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn get(&self, job_id: Uuid) -> Result<Job, SchedulerError> {
        self.jobs
            .lock()
            .await
            .get(&job_id)
            .cloned()
            .ok_or(SchedulerError::NotFound(job_id))
    }

    async fn save(&self, job: Job) -> Result<(), SchedulerError> {
        self.jobs.lock().await.insert(job.id, job);
        Ok(())
    }

    async fn find_by_source_id(&self, source_id: &str) -> Result<Option<Job>, SchedulerError> {
        Ok(self.jobs.lock().await.values().find(|j| j.source_id == source_id).cloned())
    }
}
