//! The data model shared by the scheduler, queue, worker pool, and log
//! publisher (spec §3).

mod execution;
mod job;
mod lease;
mod log_entry;
mod queue_message;

pub use execution::{ExecutionStatus, JobExecution, StatusCodeHistogram};
pub use job::{
    IntervalUnit, Job, JobPriority, JobStatus, ScheduleStrategy, DEFAULT_MAX_RETRIES,
    DEFAULT_RETRY_BACKOFF_SECS, DEFAULT_SCHEDULER_VERSION,
};
pub use lease::LeaderLease;
pub use log_entry::{LogCategory, LogEntry, LogLevel};
pub use queue_message::QueueMessage;
