//! Outbox pattern for publishing events produced in the same transaction
//! as their triggering write (grounded on seesaw's outbox, generalized
//! here with an explicit backoff schedule between publish attempts).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// One row awaiting (or having completed) publication.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, sqlx::FromRow)]
#[builder(field_defaults(setter(into)))]
pub struct OutboxEntry {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub event_type: String,
    pub payload: sqlx::types::Json<serde_json::Value>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub published_at: Option<DateTime<Utc>>,
    #[builder(default)]
    pub attempt_count: i32,
    #[builder(default = Utc::now())]
    pub next_attempt_at: DateTime<Utc>,
}

impl OutboxEntry {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.published_at.is_none() && self.next_attempt_at <= now
    }

    /// Exponential backoff in minutes — 1, 2, 4, 8, 16 — capped at 16
    /// minutes (spec §7).
    pub fn schedule_retry(&mut self, now: DateTime<Utc>) {
        self.attempt_count += 1;
        let backoff_mins = 2i64.saturating_pow((self.attempt_count - 1).max(0) as u32).min(16);
        self.next_attempt_at = now + chrono::Duration::minutes(backoff_mins);
    }

    pub fn mark_published(&mut self, now: DateTime<Utc>) {
        self.published_at = Some(now);
    }
}

/// Tracks how far a given subscriber has consumed the outbox, so a
/// publisher restart resumes instead of re-delivering everything.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, sqlx::FromRow)]
#[builder(field_defaults(setter(into)))]
pub struct PublisherCursor {
    pub subscriber: String,
    pub last_published_id: Uuid,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

/// One delivery attempt, kept for observability (spec §4.8's "publish
/// history" is reused here for the outbox's own delivery log).
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, sqlx::FromRow)]
#[builder(field_defaults(setter(into)))]
pub struct PublishHistory {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub entry_id: Uuid,
    pub succeeded: bool,
    #[builder(default, setter(strip_option))]
    pub error: Option<String>,
    #[builder(default = Utc::now())]
    pub attempted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_retry_follows_1_2_4_8_16_minute_schedule() {
        let mut entry = OutboxEntry::builder()
            .event_type("job.completed")
            .payload(sqlx::types::Json(serde_json::json!({})))
            .build();
        let now = Utc::now();
        let expected_minutes = [1, 2, 4, 8, 16];
        for minutes in expected_minutes {
            entry.schedule_retry(now);
            assert_eq!(entry.next_attempt_at, now + chrono::Duration::minutes(minutes));
        }
        for _ in 0..20 {
            entry.schedule_retry(now);
        }
        assert_eq!(entry.next_attempt_at, now + chrono::Duration::minutes(16));
    }

    #[test]
    fn is_due_false_once_published() {
        let mut entry = OutboxEntry::builder()
            .event_type("job.completed")
            .payload(sqlx::types::Json(serde_json::json!({})))
            .build();
        assert!(entry.is_due(Utc::now()));
        entry.mark_published(Utc::now());
        assert!(!entry.is_due(Utc::now()));
    }
}
