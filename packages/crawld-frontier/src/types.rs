//! Frontier-side data model (spec §3): URL records, per-host pacing state,
//! and the robots cache entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Closed set of terminal/non-terminal reasons a frontier URL can carry
/// once it's `dead` (spec §4.4).
pub mod dead_reason {
    pub const ROBOTS_BLOCKED: &str = "robots_blocked";
    pub const NOT_FOUND: &str = "not_found";
    pub const TOO_MANY_REDIRECTS: &str = "too_many_redirects";
    pub const MAX_RETRIES_EXCEEDED: &str = "max_retries_exceeded";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FrontierStatus {
    Queued,
    Claimed,
    Fetched,
    Failed,
    Dead,
}

/// Who submitted this URL into the frontier (spec §3 "origin tag").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FrontierOrigin {
    Seed,
    Discovered,
    Requeued,
}

/// A discoverable URL pending fetch (spec §3, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, sqlx::FromRow)]
#[builder(field_defaults(setter(into)))]
pub struct FrontierUrl {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub source_id: String,
    pub url: String,
    #[builder(default, setter(strip_option))]
    pub final_url: Option<String>,
    pub host: String,
    #[builder(default = FrontierStatus::Queued)]
    pub status: FrontierStatus,
    #[builder(default)]
    pub retry_count: i32,
    #[builder(default, setter(strip_option))]
    pub last_error: Option<String>,
    #[builder(default, setter(strip_option))]
    pub etag: Option<String>,
    #[builder(default, setter(strip_option))]
    pub last_modified: Option<String>,
    #[builder(default, setter(strip_option))]
    pub content_hash: Option<String>,
    #[builder(default = FrontierOrigin::Seed)]
    pub origin: FrontierOrigin,
    #[builder(default, setter(strip_option))]
    pub parent_url: Option<String>,
    #[builder(default)]
    pub depth: i32,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl FrontierUrl {
    pub fn mark_dead(&mut self, reason: &str, now: DateTime<Utc>) {
        self.status = FrontierStatus::Dead;
        self.last_error = Some(reason.to_string());
        self.updated_at = now;
    }

    /// Mark a fetch attempt failed, escalating to `dead` once retries are
    /// exhausted (spec §4.4 step 5, invariant "retry-count ≤ max-retries").
    pub fn mark_failed(&mut self, reason: &str, max_retries: i32, now: DateTime<Utc>) {
        self.retry_count += 1;
        self.last_error = Some(reason.to_string());
        self.updated_at = now;
        if self.retry_count >= max_retries {
            self.status = FrontierStatus::Dead;
        } else {
            self.status = FrontierStatus::Failed;
        }
    }

    pub fn mark_fetched(&mut self, content_hash: Option<String>, etag: Option<String>, last_modified: Option<String>, final_url: Option<String>, now: DateTime<Utc>) {
        self.status = FrontierStatus::Fetched;
        if content_hash.is_some() {
            self.content_hash = content_hash;
        }
        if etag.is_some() {
            self.etag = etag;
        }
        if last_modified.is_some() {
            self.last_modified = last_modified;
        }
        if final_url.is_some() {
            self.final_url = final_url;
        }
        self.updated_at = now;
    }
}

/// Per-host "last fetched at" used for politeness pacing (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, sqlx::FromRow)]
#[builder(field_defaults(setter(into)))]
pub struct HostState {
    pub host: String,
    pub last_fetched_at: DateTime<Utc>,
}

/// Cached robots.txt decision for a host (spec §3, §4.4). `allow_all` is
/// set whenever the fetch, parse, or response status made the rules
/// unusable — graceful degradation rather than blocking the crawl.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, sqlx::FromRow)]
#[builder(field_defaults(setter(into)))]
pub struct RobotsEntry {
    pub host: String,
    #[builder(default)]
    pub disallow_rules: Vec<String>,
    #[builder(default = Utc::now())]
    pub fetched_at: DateTime<Utc>,
    #[builder(default)]
    pub allow_all: bool,
}

impl RobotsEntry {
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: std::time::Duration) -> bool {
        now - self.fetched_at > chrono::Duration::from_std(ttl).unwrap_or_default()
    }

    pub fn is_allowed(&self, path: &str) -> bool {
        if self.allow_all {
            return true;
        }
        !self.disallow_rules.iter().any(|rule| path.starts_with(rule.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_failed_escalates_to_dead_at_max_retries() {
        let mut url = FrontierUrl::builder()
            .source_id("source-a")
            .url("https://example.com/a")
            .host("example.com")
            .build();
        url.retry_count = 2;
        url.mark_failed("http status 500", 3, Utc::now());
        assert_eq!(url.status, FrontierStatus::Dead);
        assert_eq!(url.retry_count, 3);
    }

    #[test]
    fn mark_failed_stays_failed_below_max_retries() {
        let mut url = FrontierUrl::builder()
            .source_id("source-a")
            .url("https://example.com/a")
            .host("example.com")
            .build();
        url.mark_failed("http status 500", 3, Utc::now());
        assert_eq!(url.status, FrontierStatus::Failed);
    }

    #[test]
    fn robots_allow_all_overrides_disallow_rules() {
        let entry = RobotsEntry::builder().host("example.com").allow_all(true).build();
        assert!(entry.is_allowed("/private"));
    }

    #[test]
    fn robots_disallow_rule_blocks_matching_prefix() {
        let entry = RobotsEntry::builder()
            .host("example.com")
            .disallow_rules(vec!["/private".to_string()])
            .build();
        assert!(!entry.is_allowed("/private/page"));
        assert!(entry.is_allowed("/public"));
    }
}
