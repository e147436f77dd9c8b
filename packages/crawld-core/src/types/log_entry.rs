use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use typed_builder::TypedBuilder;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// The closed set of log categories (spec §4.8) — any emitter must pick one
/// of these, there is no free-form "other".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogCategory {
    Lifecycle,
    Fetch,
    Extract,
    Error,
    RateLimit,
    Queue,
    Metrics,
}

/// A single structured log line held in the in-memory ring buffer and
/// fanned out over the publisher's broadcast channel (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct LogEntry {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    #[builder(default = Utc::now())]
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub category: LogCategory,
    pub message: String,
    #[builder(default, setter(strip_option))]
    pub job_id: Option<Uuid>,
    #[builder(default, setter(strip_option))]
    pub execution_id: Option<Uuid>,
    #[builder(default)]
    pub fields: HashMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_entry_serializes_category_as_snake_case() {
        let entry = LogEntry::builder()
            .level(LogLevel::Warn)
            .category(LogCategory::RateLimit)
            .message("host throttled")
            .build();
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["category"], "rate_limit");
        assert_eq!(json["level"], "warn");
    }
}
