//! Host Pacing Store (spec §3, §4.4): per-host last-fetched-at plus the
//! robots cache. Both are process-wide, explicitly owned by the fetcher
//! rather than hidden behind a global — with a `reset` hook for tests
//! (spec §9 "Global mutable state").

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::types::{HostState, RobotsEntry};

pub struct HostPacingStore {
    last_fetched: RwLock<HashMap<String, DateTime<Utc>>>,
    robots: RwLock<HashMap<String, RobotsEntry>>,
    robots_ttl: Duration,
}

impl HostPacingStore {
    pub fn new(robots_ttl: Duration) -> Self {
        Self {
            last_fetched: RwLock::new(HashMap::new()),
            robots: RwLock::new(HashMap::new()),
            robots_ttl,
        }
    }

    /// Record a fetch attempt for `host`, regardless of outcome (spec
    /// §4.4 step 4).
    pub async fn record_fetch(&self, host: &str, now: DateTime<Utc>) {
        self.last_fetched.write().await.insert(host.to_string(), now);
    }

    pub async fn last_fetched(&self, host: &str) -> Option<HostState> {
        self.last_fetched
            .read()
            .await
            .get(host)
            .map(|&last_fetched_at| HostState {
                host: host.to_string(),
                last_fetched_at,
            })
    }

    /// Look up a cached robots decision, treating an expired or missing
    /// entry as "no cache" so the caller re-fetches.
    pub async fn cached_robots(&self, host: &str, now: DateTime<Utc>) -> Option<RobotsEntry> {
        let robots = self.robots.read().await;
        robots
            .get(host)
            .filter(|entry| !entry.is_expired(now, self.robots_ttl))
            .cloned()
    }

    pub async fn cache_robots(&self, entry: RobotsEntry) {
        self.robots.write().await.insert(entry.host.clone(), entry);
    }

    /// Reset both caches. Exists purely so tests don't leak state across
    /// cases when a store is reused.
    pub async fn reset(&self) {
        self.last_fetched.write().await.clear();
        self.robots.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cached_robots_expires_after_ttl() {
        let store = HostPacingStore::new(Duration::from_secs(60));
        let entry = RobotsEntry::builder().host("example.com").allow_all(true).build();
        store.cache_robots(entry).await;

        let fresh = store.cached_robots("example.com", Utc::now()).await;
        assert!(fresh.is_some());

        let later = Utc::now() + chrono::Duration::seconds(120);
        let stale = store.cached_robots("example.com", later).await;
        assert!(stale.is_none());
    }

    #[tokio::test]
    async fn record_fetch_updates_last_fetched_at() {
        let store = HostPacingStore::new(Duration::from_secs(60));
        assert!(store.last_fetched("example.com").await.is_none());
        let now = Utc::now();
        store.record_fetch("example.com", now).await;
        let state = store.last_fetched("example.com").await.unwrap();
        assert_eq!(state.last_fetched_at, now);
    }

    #[tokio::test]
    async fn reset_clears_both_caches() {
        let store = HostPacingStore::new(Duration::from_secs(60));
        store.record_fetch("example.com", Utc::now()).await;
        store
            .cache_robots(RobotsEntry::builder().host("example.com").allow_all(true).build())
            .await;
        store.reset().await;
        assert!(store.last_fetched("example.com").await.is_none());
        assert!(store.cached_robots("example.com", Utc::now()).await.is_none());
    }
}
