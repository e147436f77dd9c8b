use std::borrow::Cow;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::{Categorizable, ErrorCategory};

pub const DEFAULT_MAX_RETRIES: i32 = 3;
pub const DEFAULT_RETRY_BACKOFF_SECS: i64 = 60;
pub const DEFAULT_SCHEDULER_VERSION: i32 = 1;

/// Status of a scheduled job (spec §3).
///
/// Transitions are monotone except `Paused ↔ Scheduled` and
/// `{Scheduled, Paused, Pending} → Running` via force-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Scheduled,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Statuses from which force-run is allowed (spec §4.3, property 9).
    pub fn allows_force_run(self) -> bool {
        matches!(
            self,
            JobStatus::Scheduled | JobStatus::Paused | JobStatus::Pending
        )
    }

    /// Statuses the leader-gated poll loop considers ready to fire (§4.3).
    pub fn is_poll_eligible(self) -> bool {
        matches!(self, JobStatus::Scheduled | JobStatus::Pending)
    }
}

/// Priority band. Numeric value doubles as the stream-ordering key: lower
/// sorts first, matching "priority asc" in the poll-loop ordering (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "int4")]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum JobPriority {
    High = 1,
    Normal = 2,
    Low = 3,
}

impl JobPriority {
    /// The stream name suffix this priority is delivered on (§4.1, §6).
    pub fn stream_suffix(self) -> &'static str {
        match self {
            JobPriority::High => "high",
            JobPriority::Normal => "normal",
            JobPriority::Low => "low",
        }
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        JobPriority::Normal
    }
}

/// Unit for `ScheduleStrategy::Interval` (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Minutes,
    Hours,
    Days,
}

impl IntervalUnit {
    pub fn to_duration(self, value: i64) -> Duration {
        let secs = match self {
            IntervalUnit::Minutes => value * 60,
            IntervalUnit::Hours => value * 60 * 60,
            IntervalUnit::Days => value * 24 * 60 * 60,
        };
        Duration::from_secs(secs.max(0) as u64)
    }
}

/// Scheduling strategy as a tagged variant rather than a trait object, per
/// the Design Notes' "avoid inheritance" instruction (§9).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "schedule_type", rename_all = "snake_case")]
pub enum ScheduleStrategy {
    Interval { value: i64, unit: IntervalUnit },
    Cron { expression: String },
    Immediate,
    Event,
}

impl ScheduleStrategy {
    pub fn type_name(&self) -> &'static str {
        match self {
            ScheduleStrategy::Interval { .. } => "interval",
            ScheduleStrategy::Cron { .. } => "cron",
            ScheduleStrategy::Immediate => "immediate",
            ScheduleStrategy::Event => "event",
        }
    }

    /// Whether this strategy participates in the leader-gated poll loop at
    /// all (event-triggered jobs never get a `next_run_at`).
    pub fn is_polled(&self) -> bool {
        !matches!(self, ScheduleStrategy::Event)
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {0} is not in a state that allows force-run")]
    InvalidState(Uuid),
    #[error("bad cron expression: {0}")]
    BadCron(String),
}

impl Categorizable for JobError {
    fn category(&self) -> ErrorCategory {
        match self {
            JobError::InvalidState(_) => ErrorCategory::InvalidState,
            JobError::BadCron(_) => ErrorCategory::Validation,
        }
    }

    fn reason(&self) -> Cow<'static, str> {
        match self {
            JobError::InvalidState(_) => Cow::Borrowed("invalid_state"),
            JobError::BadCron(_) => Cow::Borrowed("bad_cron_expression"),
        }
    }
}

/// A scheduled unit bound to one source (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub source_id: String,
    pub url: String,
    #[builder(default = JobStatus::Pending)]
    pub status: JobStatus,
    #[builder(default)]
    pub is_paused: bool,
    #[builder(default = ScheduleStrategy::Immediate, setter(!into))]
    pub strategy: ScheduleStrategy,
    #[builder(default, setter(strip_option))]
    pub next_run_at: Option<DateTime<Utc>>,
    #[builder(default)]
    pub priority: JobPriority,
    #[builder(default = DEFAULT_MAX_RETRIES)]
    pub max_retries: i32,
    #[builder(default = DEFAULT_RETRY_BACKOFF_SECS)]
    pub retry_backoff_seconds: i64,
    #[builder(default)]
    pub auto_managed: bool,
    #[builder(default = DEFAULT_SCHEDULER_VERSION)]
    pub scheduler_version: i32,
    #[builder(default, setter(strip_option))]
    pub trigger_webhook: Option<String>,
    #[builder(default, setter(strip_option))]
    pub trigger_channel: Option<String>,
    #[builder(default)]
    pub depends_on: Vec<Uuid>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Returns true when the leader-gated poll loop (§4.3 step 1) should
    /// pick this job up: schedule-enabled, unpaused, pollable status, and
    /// due.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        !self.is_paused
            && self.status.is_poll_eligible()
            && self.strategy.is_polled()
            && self.next_run_at.map(|t| t <= now).unwrap_or(false)
    }

    /// Force-run guard (§4.3, property 9): only legal from
    /// {scheduled, paused, pending}.
    pub fn force_run(&mut self) -> Result<(), JobError> {
        if !self.status.allows_force_run() {
            return Err(JobError::InvalidState(self.id));
        }
        self.status = JobStatus::Running;
        self.is_paused = false;
        self.next_run_at = None;
        Ok(())
    }

    /// Resume a paused job: clear paused, status=scheduled, next-run-at=now
    /// (§4.7 "resumed" outcome).
    pub fn resume(&mut self, now: DateTime<Utc>) {
        self.is_paused = false;
        self.status = JobStatus::Scheduled;
        self.next_run_at = Some(now);
    }

    /// Compute `next-run-at` for an interval strategy on schedule or on
    /// completion (§4.3): `now + interval.toDuration()`.
    pub fn next_run_at_from_interval(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.strategy {
            ScheduleStrategy::Interval { value, unit } => {
                let dur = chrono::Duration::from_std(unit.to_duration(*value)).ok()?;
                Some(now + dur)
            }
            _ => None,
        }
    }
}

// `ScheduleStrategy` is a tagged enum, stored as a jsonb column — a plain
// `#[derive(sqlx::FromRow)]` can't decode that directly into a field typed
// as the enum itself, so the row mapping is written out by hand.
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for Job {
    fn from_row(row: &sqlx::postgres::PgRow) -> sqlx::Result<Self> {
        use sqlx::Row;

        let strategy: sqlx::types::Json<ScheduleStrategy> = row.try_get("strategy")?;
        Ok(Job {
            id: row.try_get("id")?,
            source_id: row.try_get("source_id")?,
            url: row.try_get("url")?,
            status: row.try_get("status")?,
            is_paused: row.try_get("is_paused")?,
            strategy: strategy.0,
            next_run_at: row.try_get("next_run_at")?,
            priority: row.try_get("priority")?,
            max_retries: row.try_get("max_retries")?,
            retry_backoff_seconds: row.try_get("retry_backoff_seconds")?,
            auto_managed: row.try_get("auto_managed")?,
            scheduler_version: row.try_get("scheduler_version")?,
            trigger_webhook: row.try_get("trigger_webhook")?,
            trigger_channel: row.try_get("trigger_channel")?,
            depends_on: row.try_get("depends_on")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Job {
        Job::builder()
            .source_id("source-a")
            .url("https://example.com")
            .build()
    }

    #[test]
    fn force_run_allowed_from_scheduled() {
        let mut job = sample();
        job.status = JobStatus::Scheduled;
        assert!(job.force_run().is_ok());
        assert_eq!(job.status, JobStatus::Running);
    }

    #[test]
    fn force_run_rejected_when_running() {
        let mut job = sample();
        job.status = JobStatus::Running;
        let err = job.force_run().unwrap_err();
        assert_eq!(err.category(), ErrorCategory::InvalidState);
    }

    #[test]
    fn force_run_rejected_on_terminal_statuses() {
        for status in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            let mut job = sample();
            job.status = status;
            assert!(job.force_run().is_err());
        }
    }

    #[test]
    fn is_ready_requires_due_next_run_at() {
        let mut job = sample();
        job.status = JobStatus::Scheduled;
        job.next_run_at = Some(Utc::now() + chrono::Duration::minutes(5));
        assert!(!job.is_ready(Utc::now()));

        job.next_run_at = Some(Utc::now() - chrono::Duration::minutes(1));
        assert!(job.is_ready(Utc::now()));
    }

    #[test]
    fn is_ready_false_when_paused() {
        let mut job = sample();
        job.status = JobStatus::Scheduled;
        job.is_paused = true;
        job.next_run_at = Some(Utc::now() - chrono::Duration::minutes(1));
        assert!(!job.is_ready(Utc::now()));
    }

    #[test]
    fn event_strategy_never_polled() {
        let mut job = sample();
        job.strategy = ScheduleStrategy::Event;
        job.status = JobStatus::Scheduled;
        job.next_run_at = Some(Utc::now() - chrono::Duration::minutes(1));
        assert!(!job.is_ready(Utc::now()));
    }

    #[test]
    fn interval_next_run_at_adds_duration() {
        let mut job = sample();
        job.strategy = ScheduleStrategy::Interval {
            value: 30,
            unit: IntervalUnit::Minutes,
        };
        let now = Utc::now();
        let next = job.next_run_at_from_interval(now).unwrap();
        assert_eq!(next, now + chrono::Duration::minutes(30));
    }

    #[test]
    fn priority_ordering_high_before_normal_before_low() {
        assert!(JobPriority::High < JobPriority::Normal);
        assert!(JobPriority::Normal < JobPriority::Low);
    }
}
