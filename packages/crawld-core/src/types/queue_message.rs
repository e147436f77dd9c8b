use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::job::Job;

/// The envelope placed on a priority-queue stream (spec §3, §4.1).
///
/// Unlike `Job`, this never touches Postgres directly — it only crosses
/// the Redis stream boundary, so it stays a plain serde struct rather than
/// an `sqlx::FromRow`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Redis-assigned stream entry id, e.g. `"1700000000000-0"`. Absent
    /// until the message has actually been read back off a stream.
    pub message_id: Option<String>,
    pub job: Job,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl QueueMessage {
    pub fn new(job: Job) -> Self {
        Self {
            message_id: None,
            job,
            enqueued_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::job::Job;

    #[test]
    fn new_message_has_no_stream_id_until_read_back() {
        let job = Job::builder()
            .source_id("source-a")
            .url("https://example.com")
            .build();
        let msg = QueueMessage::new(job);
        assert!(msg.message_id.is_none());
    }
}
