//! Scheduling kernel for the crawl pipeline: priority queue, worker pool,
//! scheduler, leader election, source-to-job sync, trigger router, and log
//! buffer/publisher.
//!
//! ```text
//! source_sync ──enqueues──▶ scheduler ──polls──▶ queue ──claims──▶ worker_pool
//!                               │                                      │
//!                               ▼                                      ▼
//!                            leader                                 logs
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod leader;
pub mod logs;
pub mod outbox;
pub mod queue;
pub mod router;
pub mod scheduler;
pub mod source_sync;
pub mod types;
pub mod worker_pool;

pub use config::Config;
pub use error::{Categorizable, ErrorCategory};
