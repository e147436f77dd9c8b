//! Leader election via a single Postgres lease row (spec §4.6).
//!
//! Kept in the same store as jobs rather than a second system (e.g. a
//! Redis lock): the spec's Non-goal against cross-engine transactions
//! rules out acquiring the lease in one engine and dispatching work in
//! another without a distributed-transaction story.

use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{Categorizable, ErrorCategory};
use crate::types::LeaderLease;

#[derive(Debug, Error)]
pub enum LeaderError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl Categorizable for LeaderError {
    fn category(&self) -> ErrorCategory {
        match self {
            LeaderError::Database(e) => e.category(),
        }
    }

    fn reason(&self) -> Cow<'static, str> {
        Cow::Borrowed("leader_lease_error")
    }
}

/// Narrow seam over the lease row so the election logic can be tested
/// without a database.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Attempt to acquire or renew the lease for `holder_id`. Succeeds if
    /// the row doesn't exist yet, is already held by `holder_id`, or has
    /// expired. Returns the lease as it stands after the attempt.
    async fn acquire_or_renew(&self, key: &str, holder_id: &str, ttl: Duration) -> Result<LeaderLease, LeaderError>;

    async fn current(&self, key: &str) -> Result<Option<LeaderLease>, LeaderError>;

    async fn release(&self, key: &str, holder_id: &str) -> Result<(), LeaderError>;
}

pub struct PostgresLeaseStore {
    pool: PgPool,
}

impl PostgresLeaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseStore for PostgresLeaseStore {
    async fn acquire_or_renew(&self, key: &str, holder_id: &str, ttl: Duration) -> Result<LeaderLease, LeaderError> {
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();

        // Single guarded UPSERT: wins the row if it's new, already ours, or
        // expired. Anyone else currently holding an unexpired lease causes
        // the WHERE clause to exclude the row and the RETURNING set is
        // empty — we then re-read to report the actual holder.
        let row: Option<(String, String, chrono::DateTime<Utc>)> = sqlx::query_as(
            r#"
            INSERT INTO leader_leases (key, holder_id, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE
                SET holder_id = EXCLUDED.holder_id, expires_at = EXCLUDED.expires_at
                WHERE leader_leases.holder_id = EXCLUDED.holder_id
                   OR leader_leases.expires_at < NOW()
            RETURNING key, holder_id, expires_at
            "#,
        )
        .bind(key)
        .bind(holder_id)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((key, holder_id, expires_at)) => {
                debug!(%key, %holder_id, "lease acquired or renewed");
                Ok(LeaderLease { key, holder_id, expires_at })
            }
            None => {
                let current = self.current(key).await?;
                Ok(current.unwrap_or(LeaderLease {
                    key: key.to_string(),
                    holder_id: "unknown".to_string(),
                    expires_at: Utc::now(),
                }))
            }
        }
    }

    async fn current(&self, key: &str) -> Result<Option<LeaderLease>, LeaderError> {
        let row: Option<LeaderLease> = sqlx::query_as("SELECT key, holder_id, expires_at FROM leader_leases WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn release(&self, key: &str, holder_id: &str) -> Result<(), LeaderError> {
        sqlx::query("DELETE FROM leader_leases WHERE key = $1 AND holder_id = $2")
            .bind(key)
            .bind(holder_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Drives the renew loop for one process and exposes whether it currently
/// believes itself to be leader.
pub struct LeaderElector<S: LeaseStore> {
    store: S,
    key: String,
    holder_id: String,
    ttl: Duration,
}

impl<S: LeaseStore> LeaderElector<S> {
    pub fn new(store: S, key: impl Into<String>, holder_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            key: key.into(),
            holder_id: holder_id.into(),
            ttl,
        }
    }

    /// Attempt to become or remain leader. Call this on a timer shorter
    /// than `ttl` (spec §4.6 recommends well under half the TTL) so a
    /// transient failure to renew doesn't immediately cost leadership.
    pub async fn tick(&self) -> Result<bool, LeaderError> {
        let lease = self.store.acquire_or_renew(&self.key, &self.holder_id, self.ttl).await?;
        let is_leader = lease.is_held_by(&self.holder_id, Utc::now());
        if is_leader {
            debug!(holder_id = %self.holder_id, "holding leader lease");
        } else {
            warn!(holder_id = %self.holder_id, current_holder = %lease.holder_id, "lost or did not win leader lease");
        }
        Ok(is_leader)
    }

    pub async fn step_down(&self) -> Result<(), LeaderError> {
        info!(holder_id = %self.holder_id, "releasing leader lease");
        self.store.release(&self.key, &self.holder_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct InMemoryLeaseStore {
        lease: StdMutex<Option<LeaderLease>>,
    }

    #[async_trait]
    impl LeaseStore for InMemoryLeaseStore {
        async fn acquire_or_renew(&self, key: &str, holder_id: &str, ttl: Duration) -> Result<LeaderLease, LeaderError> {
            let mut guard = self.lease.lock().unwrap();
            let now = Utc::now();
            let expires_at = now + chrono::Duration::from_std(ttl).unwrap();
            let winnable = match &*guard {
                None => true,
                Some(existing) => existing.holder_id == holder_id || existing.is_expired(now),
            };
            if winnable {
                let lease = LeaderLease {
                    key: key.to_string(),
                    holder_id: holder_id.to_string(),
                    expires_at,
                };
                *guard = Some(lease.clone());
                Ok(lease)
            } else {
                Ok(guard.clone().unwrap())
            }
        }

        async fn current(&self, _key: &str) -> Result<Option<LeaderLease>, LeaderError> {
            Ok(self.lease.lock().unwrap().clone())
        }

        async fn release(&self, _key: &str, holder_id: &str) -> Result<(), LeaderError> {
            let mut guard = self.lease.lock().unwrap();
            if guard.as_ref().map(|l| l.holder_id.as_str()) == Some(holder_id) {
                *guard = None;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn first_tick_wins_leadership() {
        let store = InMemoryLeaseStore::default();
        let elector = LeaderElector::new(store, "crawld:scheduler", "worker-a", Duration::from_secs(30));
        assert!(elector.tick().await.unwrap());
    }

    #[tokio::test]
    async fn second_holder_cannot_win_active_lease() {
        let store = std::sync::Arc::new(InMemoryLeaseStore::default());
        let a_lease = store
            .acquire_or_renew("crawld:scheduler", "worker-a", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(a_lease.is_held_by("worker-a", Utc::now()));

        let b_lease = store
            .acquire_or_renew("crawld:scheduler", "worker-b", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(!b_lease.is_held_by("worker-b", Utc::now()));
        assert_eq!(b_lease.holder_id, "worker-a");
    }

    #[tokio::test]
    async fn step_down_releases_the_lease_for_others() {
        let store = InMemoryLeaseStore::default();
        store
            .acquire_or_renew("crawld:scheduler", "worker-a", Duration::from_secs(30))
            .await
            .unwrap();
        let elector = LeaderElector::new(store, "crawld:scheduler", "worker-a", Duration::from_secs(30));
        elector.step_down().await.unwrap();
        assert!(elector.store.current("crawld:scheduler").await.unwrap().is_none());
    }
}
