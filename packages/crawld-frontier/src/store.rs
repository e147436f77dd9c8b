//! Frontier Store (spec §3, §4.4): claim/complete/fail/dead transitions
//! over URL rows, using `FOR UPDATE SKIP LOCKED` so concurrent fetch
//! workers never contend on the same row.

use std::borrow::Cow;

use async_trait::async_trait;
use chrono::Utc;
use crawld_core::error::{Categorizable, ErrorCategory};
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{FrontierOrigin, FrontierStatus, FrontierUrl};

#[derive(Debug, Error)]
pub enum FrontierError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("frontier url {0} not found")]
    NotFound(Uuid),
}

impl Categorizable for FrontierError {
    fn category(&self) -> ErrorCategory {
        match self {
            FrontierError::Database(e) => e.category(),
            FrontierError::NotFound(_) => ErrorCategory::NotFound,
        }
    }

    fn reason(&self) -> Cow<'static, str> {
        match self {
            FrontierError::Database(_) => Cow::Borrowed("database_error"),
            FrontierError::NotFound(_) => Cow::Borrowed("frontier_url_not_found"),
        }
    }
}

/// Interface the fetch worker depends on (spec §9's `FrontierClaimer`).
/// Kept separate from `LinkSubmitter` so the crawler and the worker never
/// reference each other directly — both are implemented by the same
/// store, breaking the cycle.
#[async_trait]
pub trait FrontierClaimer: Send + Sync {
    async fn claim_one(&self) -> Result<Option<FrontierUrl>, FrontierError>;
    async fn mark_dead(&self, id: Uuid, reason: &str) -> Result<(), FrontierError>;
    async fn mark_failed(&self, id: Uuid, reason: &str, max_retries: i32) -> Result<(), FrontierError>;
    async fn mark_fetched(
        &self,
        id: Uuid,
        content_hash: Option<String>,
        etag: Option<String>,
        last_modified: Option<String>,
        final_url: Option<String>,
    ) -> Result<(), FrontierError>;
}

/// Interface the crawler depends on (spec §9's `LinkSubmitter`): pushing
/// newly discovered links into the frontier without knowing how claiming
/// works.
#[async_trait]
pub trait LinkSubmitter: Send + Sync {
    async fn submit(&self, url: FrontierUrl) -> Result<(), FrontierError>;
}

pub struct PostgresFrontierStore {
    pool: PgPool,
}

impl PostgresFrontierStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: Uuid) -> Result<FrontierUrl, FrontierError> {
        sqlx::query_as(
            r#"SELECT id, source_id, url, final_url, host, status, retry_count, last_error,
                      etag, last_modified, content_hash, origin, parent_url, depth, created_at, updated_at
               FROM frontier_urls WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(FrontierError::NotFound(id))
    }
}

#[async_trait]
impl FrontierClaimer for PostgresFrontierStore {
    async fn claim_one(&self) -> Result<Option<FrontierUrl>, FrontierError> {
        let row: Option<FrontierUrl> = sqlx::query_as(
            r#"
            UPDATE frontier_urls
            SET status = 'claimed', updated_at = NOW()
            WHERE id = (
                SELECT id FROM frontier_urls
                WHERE status = 'queued'
                ORDER BY created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, source_id, url, final_url, host, status, retry_count, last_error,
                      etag, last_modified, content_hash, origin, parent_url, depth, created_at, updated_at
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn mark_dead(&self, id: Uuid, reason: &str) -> Result<(), FrontierError> {
        sqlx::query("UPDATE frontier_urls SET status = 'dead', last_error = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(reason)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, reason: &str, max_retries: i32) -> Result<(), FrontierError> {
        sqlx::query(
            r#"
            UPDATE frontier_urls
            SET retry_count = retry_count + 1,
                last_error = $2,
                status = CASE WHEN retry_count + 1 >= $3 THEN 'dead' ELSE 'failed' END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(max_retries)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_fetched(
        &self,
        id: Uuid,
        content_hash: Option<String>,
        etag: Option<String>,
        last_modified: Option<String>,
        final_url: Option<String>,
    ) -> Result<(), FrontierError> {
        sqlx::query(
            r#"
            UPDATE frontier_urls
            SET status = 'fetched',
                content_hash = COALESCE($2, content_hash),
                etag = COALESCE($3, etag),
                last_modified = COALESCE($4, last_modified),
                final_url = COALESCE($5, final_url),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(content_hash)
        .bind(etag)
        .bind(last_modified)
        .bind(final_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LinkSubmitter for PostgresFrontierStore {
    async fn submit(&self, url: FrontierUrl) -> Result<(), FrontierError> {
        sqlx::query(
            r#"
            INSERT INTO frontier_urls
                (id, source_id, url, host, status, origin, parent_url, depth, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'queued', $5, $6, $7, $8, $9)
            ON CONFLICT (source_id, url) DO NOTHING
            "#,
        )
        .bind(url.id)
        .bind(&url.source_id)
        .bind(&url.url)
        .bind(&url.host)
        .bind(origin_str(url.origin))
        .bind(&url.parent_url)
        .bind(url.depth)
        .bind(url.created_at)
        .bind(url.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn origin_str(origin: FrontierOrigin) -> &'static str {
    match origin {
        FrontierOrigin::Seed => "seed",
        FrontierOrigin::Discovered => "discovered",
        FrontierOrigin::Requeued => "requeued",
    }
}

/// In-memory test double covering the same claim/complete/fail/dead state
/// machine without a database, used by fetch-worker unit tests.
pub struct InMemoryFrontierStore {
    urls: tokio::sync::Mutex<std::collections::HashMap<Uuid, FrontierUrl>>,
}

impl InMemoryFrontierStore {
    pub fn new() -> Self {
        Self {
            urls: tokio::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub async fn seed(&self, url: FrontierUrl) {
        self.urls.lock().await.insert(url.id, url);
    }

    pub async fn get(&self, id: Uuid) -> Option<FrontierUrl> {
        self.urls.lock().await.get(&id).cloned()
    }
}

impl Default for InMemoryFrontierStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FrontierClaimer for InMemoryFrontierStore {
    async fn claim_one(&self) -> Result<Option<FrontierUrl>, FrontierError> {
        let mut urls = self.urls.lock().await;
        let next = urls
            .values()
            .find(|u| u.status == FrontierStatus::Queued)
            .map(|u| u.id);
        match next {
            Some(id) => {
                let url = urls.get_mut(&id).unwrap();
                url.status = FrontierStatus::Claimed;
                Ok(Some(url.clone()))
            }
            None => Ok(None),
        }
    }

    async fn mark_dead(&self, id: Uuid, reason: &str) -> Result<(), FrontierError> {
        let mut urls = self.urls.lock().await;
        let url = urls.get_mut(&id).ok_or(FrontierError::NotFound(id))?;
        url.mark_dead(reason, Utc::now());
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, reason: &str, max_retries: i32) -> Result<(), FrontierError> {
        let mut urls = self.urls.lock().await;
        let url = urls.get_mut(&id).ok_or(FrontierError::NotFound(id))?;
        url.mark_failed(reason, max_retries, Utc::now());
        Ok(())
    }

    async fn mark_fetched(
        &self,
        id: Uuid,
        content_hash: Option<String>,
        etag: Option<String>,
        last_modified: Option<String>,
        final_url: Option<String>,
    ) -> Result<(), FrontierError> {
        let mut urls = self.urls.lock().await;
        let url = urls.get_mut(&id).ok_or(FrontierError::NotFound(id))?;
        url.mark_fetched(content_hash, etag, last_modified, final_url, Utc::now());
        Ok(())
    }
}

#[async_trait]
impl LinkSubmitter for InMemoryFrontierStore {
    async fn submit(&self, url: FrontierUrl) -> Result<(), FrontierError> {
        self.seed(url).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> FrontierUrl {
        FrontierUrl::builder()
            .source_id("source-a")
            .url("https://example.com/a")
            .host("example.com")
            .build()
    }

    #[tokio::test]
    async fn claim_one_transitions_queued_to_claimed() {
        let store = InMemoryFrontierStore::new();
        let seeded = url();
        let id = seeded.id;
        store.seed(seeded).await;

        let claimed = store.claim_one().await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, FrontierStatus::Claimed);

        // only one worker may hold a url in claimed: a second claim sees nothing.
        assert!(store.claim_one().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mark_failed_then_dead_after_max_retries() {
        let store = InMemoryFrontierStore::new();
        let mut seeded = url();
        seeded.retry_count = 2;
        let id = seeded.id;
        store.seed(seeded).await;

        store.mark_failed(id, "http status 500", 3).await.unwrap();
        let after = store.get(id).await.unwrap();
        assert_eq!(after.status, FrontierStatus::Dead);
    }

    #[tokio::test]
    async fn mark_fetched_updates_only_provided_fields() {
        let store = InMemoryFrontierStore::new();
        let seeded = url();
        let id = seeded.id;
        store.seed(seeded).await;

        store
            .mark_fetched(id, Some("hash1".into()), None, None, None)
            .await
            .unwrap();
        let after = store.get(id).await.unwrap();
        assert_eq!(after.status, FrontierStatus::Fetched);
        assert_eq!(after.content_hash.as_deref(), Some("hash1"));
    }
}
