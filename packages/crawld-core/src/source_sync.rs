//! Source-to-job sync (spec §4.7): reconciles the enabled-source list
//! against existing jobs, creating, resuming, or skipping as needed.

use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::error::{Categorizable, ErrorCategory};
use crate::scheduler::{stagger_offset, JobRepository, SchedulerError};
use crate::types::{Job, JobStatus, ScheduleStrategy};

#[derive(Debug, Error)]
pub enum SourceSyncError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl Categorizable for SourceSyncError {
    fn category(&self) -> ErrorCategory {
        match self {
            SourceSyncError::Scheduler(e) => e.category(),
        }
    }

    fn reason(&self) -> Cow<'static, str> {
        Cow::Borrowed("source_sync_error")
    }
}

/// A row from the source-of-truth catalog this kernel syncs jobs against.
/// Intentionally narrow — real field ownership (name, credentials, owner)
/// lives elsewhere; the sync only needs what determines a job's existence
/// and schedule.
#[derive(Debug, Clone)]
pub struct EnabledSource {
    pub source_id: String,
    pub url: String,
    pub enabled: bool,
    pub strategy: ScheduleStrategy,
    pub priority: crate::types::JobPriority,
}

/// Implemented by whatever owns the source catalog. One page at a time so
/// a large catalog doesn't have to be materialized in memory by the sync
/// job itself.
#[async_trait]
pub trait EnabledSourceProvider: Send + Sync {
    async fn list_sources(&self) -> anyhow::Result<Vec<EnabledSource>>;
}

/// Outcome of reconciling one source, returned so callers can log/count
/// without the sync needing its own metrics plumbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Created,
    AlreadyHasJob,
    Resumed,
    SkippedDisabled,
}

/// Aggregate result of a full `sync_all` pass (spec §4.7, scenario S1).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub sources_seen: usize,
    pub sources_enabled: usize,
    pub created: usize,
    pub already_has_job: usize,
    pub resumed: usize,
    pub skipped_disabled: usize,
    pub errors: usize,
}

impl SyncReport {
    fn record(&mut self, outcome: SyncOutcome) {
        match outcome {
            SyncOutcome::Created => self.created += 1,
            SyncOutcome::AlreadyHasJob => self.already_has_job += 1,
            SyncOutcome::Resumed => self.resumed += 1,
            SyncOutcome::SkippedDisabled => self.skipped_disabled += 1,
        }
    }
}

/// Reconcile one source against its (possibly absent) existing job. Pure
/// function: no I/O, so it is trivially unit-testable and `sync_all` just
/// threads a repository's reads/writes through it.
///
/// A disabled source is a true no-op regardless of whether a job already
/// exists for it (spec §4.7): it is never created, paused, or otherwise
/// mutated here, only recorded as `skipped_disabled`.
pub fn reconcile(
    source: &EnabledSource,
    existing: Option<&Job>,
    now: DateTime<Utc>,
    source_count: usize,
    stagger_unit: Duration,
) -> (Option<Job>, SyncOutcome) {
    if !source.enabled {
        return (None, SyncOutcome::SkippedDisabled);
    }

    match existing {
        None => {
            let mut job = Job::builder()
                .source_id(source.source_id.clone())
                .url(source.url.clone())
                .build();
            job.strategy = source.strategy.clone();
            job.priority = source.priority;
            job.auto_managed = true;
            job.status = JobStatus::Scheduled;
            let offset = stagger_offset(&source.source_id, source_count, stagger_unit);
            job.next_run_at = Some(now + chrono::Duration::from_std(offset).unwrap_or_default());
            (Some(job), SyncOutcome::Created)
        }
        Some(existing) => {
            let mut job = existing.clone();
            if job.is_paused {
                job.resume(now);
                (Some(job), SyncOutcome::Resumed)
            } else {
                (Some(job), SyncOutcome::AlreadyHasJob)
            }
        }
    }
}

/// Drives a full sync pass: list sources, reconcile each against its
/// existing job (if any), and persist the result (spec §4.7).
pub struct SourceSync<P: EnabledSourceProvider> {
    provider: P,
    repository: std::sync::Arc<dyn JobRepository>,
    stagger_unit: Duration,
}

impl<P: EnabledSourceProvider> SourceSync<P> {
    pub fn new(provider: P, repository: std::sync::Arc<dyn JobRepository>, stagger_unit: Duration) -> Self {
        Self {
            provider,
            repository,
            stagger_unit,
        }
    }

    async fn sync_one(&self, source: &EnabledSource, existing: Option<Job>, now: DateTime<Utc>, source_count: usize) -> Result<SyncOutcome, SourceSyncError> {
        let (job, outcome) = reconcile(source, existing.as_ref(), now, source_count, self.stagger_unit);
        if let Some(job) = job {
            self.repository.save(job).await?;
        }
        info!(source_id = %source.source_id, outcome = ?outcome, "source sync reconciled");
        Ok(outcome)
    }

    /// Full sync pass (spec §4.7, scenario S1): list every source, look up
    /// its existing job by `source_id`, reconcile, and tally the outcome.
    /// One source failing to reconcile does not stop the rest; it is
    /// counted in `errors` and logged.
    pub async fn sync_all(&self, now: DateTime<Utc>) -> anyhow::Result<SyncReport> {
        let sources = self.provider.list_sources().await?;
        let source_count = sources.iter().filter(|s| s.enabled).count();

        let mut report = SyncReport {
            sources_seen: sources.len(),
            sources_enabled: source_count,
            ..Default::default()
        };

        for source in &sources {
            let existing = match self.repository.find_by_source_id(&source.source_id).await {
                Ok(existing) => existing,
                Err(e) => {
                    warn!(source_id = %source.source_id, error = %e, "failed to look up existing job");
                    report.errors += 1;
                    continue;
                }
            };
            match self.sync_one(source, existing, now, source_count).await {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    warn!(source_id = %source.source_id, error = %e, "failed to reconcile source");
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobPriority;

    fn source(enabled: bool) -> EnabledSource {
        EnabledSource {
            source_id: "source-a".into(),
            url: "https://example.com".into(),
            enabled,
            strategy: ScheduleStrategy::Interval {
                value: 1,
                unit: crate::types::IntervalUnit::Hours,
            },
            priority: JobPriority::Normal,
        }
    }

    #[test]
    fn new_enabled_source_creates_scheduled_job() {
        let (job, outcome) = reconcile(&source(true), None, Utc::now(), 1, Duration::from_secs(300));
        let job = job.unwrap();
        assert_eq!(outcome, SyncOutcome::Created);
        assert_eq!(job.status, JobStatus::Scheduled);
        assert!(job.auto_managed);
    }

    #[test]
    fn new_disabled_source_is_skipped_without_creating_a_job() {
        let (job, outcome) = reconcile(&source(false), None, Utc::now(), 1, Duration::from_secs(300));
        assert_eq!(outcome, SyncOutcome::SkippedDisabled);
        assert!(job.is_none());
    }

    #[test]
    fn disabled_source_with_existing_job_is_skipped_without_mutation() {
        let mut existing = Job::builder().source_id("source-a").url("https://example.com").build();
        existing.status = JobStatus::Scheduled;
        let (job, outcome) = reconcile(&source(false), Some(&existing), Utc::now(), 1, Duration::from_secs(300));
        assert_eq!(outcome, SyncOutcome::SkippedDisabled);
        assert!(job.is_none());
    }

    #[test]
    fn re_enabling_paused_source_resumes_its_job() {
        let mut existing = Job::builder().source_id("source-a").url("https://example.com").build();
        existing.status = JobStatus::Paused;
        existing.is_paused = true;
        let (job, outcome) = reconcile(&source(true), Some(&existing), Utc::now(), 1, Duration::from_secs(300));
        assert_eq!(outcome, SyncOutcome::Resumed);
        assert_eq!(job.unwrap().status, JobStatus::Scheduled);
    }

    #[test]
    fn already_has_job_when_enabled_state_already_matches() {
        let mut existing = Job::builder().source_id("source-a").url("https://example.com").build();
        existing.status = JobStatus::Scheduled;
        let (_, outcome) = reconcile(&source(true), Some(&existing), Utc::now(), 1, Duration::from_secs(300));
        assert_eq!(outcome, SyncOutcome::AlreadyHasJob);
    }

    struct FixedProvider(Vec<EnabledSource>);

    #[async_trait]
    impl EnabledSourceProvider for FixedProvider {
        async fn list_sources(&self) -> anyhow::Result<Vec<EnabledSource>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn sync_all_tallies_every_outcome() {
        let repo = std::sync::Arc::new(crate::scheduler::InMemoryJobRepository::new());

        let mut already_scheduled = Job::builder().source_id("source-b").url("https://example.com/b").build();
        already_scheduled.status = JobStatus::Scheduled;
        repo.seed(already_scheduled).await;

        let sources = vec![
            source_with_id("source-a", true),
            source_with_id("source-b", true),
            source_with_id("source-c", false),
        ];
        let sync = SourceSync::new(FixedProvider(sources), repo, Duration::from_secs(300));
        let report = sync.sync_all(Utc::now()).await.unwrap();

        assert_eq!(report.sources_seen, 3);
        assert_eq!(report.sources_enabled, 2);
        assert_eq!(report.created, 1);
        assert_eq!(report.already_has_job, 1);
        assert_eq!(report.skipped_disabled, 1);
        assert_eq!(report.errors, 0);
    }

    fn source_with_id(source_id: &str, enabled: bool) -> EnabledSource {
        let mut s = source(enabled);
        s.source_id = source_id.to_string();
        s
    }
}
