use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

/// A single-row lease backing leader election (spec §3, §4.6).
///
/// One row per `key`; the holder owns the lease until `expires_at`, renewed
/// by a guarded `UPDATE ... WHERE holder_id = $1 OR expires_at < now()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, sqlx::FromRow)]
#[builder(field_defaults(setter(into)))]
pub struct LeaderLease {
    pub key: String,
    pub holder_id: String,
    pub expires_at: DateTime<Utc>,
}

impl LeaderLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_held_by(&self, holder_id: &str, now: DateTime<Utc>) -> bool {
        self.holder_id == holder_id && !self.is_expired(now)
    }
}
