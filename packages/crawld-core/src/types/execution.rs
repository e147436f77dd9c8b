use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Outcome of one run of a job (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
    DeadLettered,
}

/// Response-code counts collected over one execution, keyed by the HTTP
/// status code. Kept as a plain map rather than a fixed struct because the
/// set of codes seen varies per source.
pub type StatusCodeHistogram = HashMap<u16, u64>;

/// One row in a job's execution history (spec §3, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, sqlx::FromRow)]
#[builder(field_defaults(setter(into)))]
pub struct JobExecution {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub job_id: Uuid,
    pub execution_number: i64,
    #[builder(default = ExecutionStatus::Running)]
    pub status: ExecutionStatus,
    #[builder(default = Utc::now())]
    pub started_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub duration_ms: Option<i64>,
    #[builder(default)]
    pub retry_attempt: i32,

    #[builder(default)]
    pub items_crawled: i64,
    #[builder(default)]
    pub items_indexed: i64,
    #[builder(default)]
    pub errors: i64,
    #[builder(default)]
    pub requests_total: i64,
    #[builder(default)]
    pub requests_failed: i64,
    #[builder(default)]
    pub bytes_fetched: i64,

    #[builder(default, setter(!into))]
    pub status_codes: sqlx::types::Json<StatusCodeHistogram>,
}

impl JobExecution {
    /// Mark this execution complete, filling in duration and status
    /// together so the two never drift apart (spec §4.4 step "finalize").
    pub fn finish(&mut self, status: ExecutionStatus, now: DateTime<Utc>) {
        self.status = status;
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0));
    }

    pub fn record_status_code(&mut self, code: u16) {
        *self.status_codes.entry(code).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_sets_duration_from_started_at() {
        let mut exec = JobExecution::builder()
            .job_id(Uuid::new_v4())
            .execution_number(1i64)
            .build();
        exec.started_at = Utc::now() - chrono::Duration::seconds(5);
        let now = Utc::now();
        exec.finish(ExecutionStatus::Succeeded, now);
        assert_eq!(exec.status, ExecutionStatus::Succeeded);
        assert!(exec.duration_ms.unwrap() >= 5000);
    }

    #[test]
    fn record_status_code_accumulates_counts() {
        let mut exec = JobExecution::builder()
            .job_id(Uuid::new_v4())
            .execution_number(1i64)
            .build();
        exec.record_status_code(200);
        exec.record_status_code(200);
        exec.record_status_code(404);
        assert_eq!(exec.status_codes.get(&200), Some(&2));
        assert_eq!(exec.status_codes.get(&404), Some(&1));
    }
}
