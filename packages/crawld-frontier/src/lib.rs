//! Frontier + fetch worker half of the crawl pipeline (spec §4.4): the
//! claim/complete/fail/dead state machine over discovered URLs, per-host
//! pacing and robots cache, and the worker loop that drains it.

pub mod fetch_worker;
pub mod host_pacing;
pub mod store;
pub mod types;

pub use fetch_worker::{ContentExtractor, ContentIndexer, FetchWorker, FetchWorkerConfig};
pub use host_pacing::HostPacingStore;
pub use store::{FrontierClaimer, LinkSubmitter, PostgresFrontierStore};
