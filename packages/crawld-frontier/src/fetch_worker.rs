//! Fetch Worker (spec §4.4): claim → robots check → conditional GET →
//! redirect policy → extract → index → state update.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use crawld_core::error::{Categorizable, ErrorCategory};
use reqwest::{header, Client, StatusCode};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::host_pacing::HostPacingStore;
use crate::store::{FrontierClaimer, FrontierError};
use crate::types::{dead_reason, FrontierUrl, RobotsEntry};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Frontier(#[from] FrontierError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl Categorizable for FetchError {
    fn category(&self) -> ErrorCategory {
        match self {
            FetchError::Frontier(e) => e.category(),
            FetchError::Http(e) => e.category(),
        }
    }

    fn reason(&self) -> Cow<'static, str> {
        match self {
            FetchError::Frontier(_) => Cow::Borrowed("frontier_error"),
            FetchError::Http(_) => Cow::Borrowed("http_error"),
        }
    }
}

/// Content extraction is explicitly out of scope (spec §1); this narrow
/// seam is all the fetch worker needs to call into it.
#[async_trait]
pub trait ContentExtractor: Send + Sync {
    async fn extract(&self, body: &[u8]) -> anyhow::Result<String>;
}

/// Indexing backend (e.g. Elasticsearch) is out of scope (spec §1).
#[async_trait]
pub trait ContentIndexer: Send + Sync {
    async fn index(&self, url: &str, extracted: &str) -> anyhow::Result<()>;
}

/// Test doubles that panic if actually invoked — useful when a test wants
/// to assert no indexing happened (e.g. the 304/robots-blocked paths)
/// without silently accepting a bug that calls them anyway.
pub struct NullExtractor;

#[async_trait]
impl ContentExtractor for NullExtractor {
    async fn extract(&self, _body: &[u8]) -> anyhow::Result<String> {
        unimplemented!("NullExtractor should never be called in this test")
    }
}

pub struct NullIndexer;

#[async_trait]
impl ContentIndexer for NullIndexer {
    async fn index(&self, _url: &str, _extracted: &str) -> anyhow::Result<()> {
        unimplemented!("NullIndexer should never be called in this test")
    }
}

pub struct FetchWorkerConfig {
    pub user_agent: String,
    pub max_redirects: u8,
    pub response_body_cap_bytes: usize,
    pub robots_body_cap_bytes: usize,
    pub claim_retry_delay: Duration,
    pub max_retries: i32,
}

pub struct FetchWorker<F: FrontierClaimer> {
    frontier: Arc<F>,
    pacing: Arc<HostPacingStore>,
    client: Client,
    extractor: Arc<dyn ContentExtractor>,
    indexer: Arc<dyn ContentIndexer>,
    config: FetchWorkerConfig,
}

impl<F: FrontierClaimer> FetchWorker<F> {
    pub fn new(
        frontier: Arc<F>,
        pacing: Arc<HostPacingStore>,
        extractor: Arc<dyn ContentExtractor>,
        indexer: Arc<dyn ContentIndexer>,
        config: FetchWorkerConfig,
    ) -> Self {
        // Redirects are followed manually (classify step needs the exact
        // hop count and the final URL), so the client itself never redirects.
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(config.user_agent.clone())
            .build()
            .expect("fetch client config is valid");
        Self {
            frontier,
            pacing,
            client,
            extractor,
            indexer,
            config,
        }
    }

    async fn is_allowed(&self, host: &str, path: &str) -> bool {
        let now = Utc::now();
        if let Some(entry) = self.pacing.cached_robots(host, now).await {
            return entry.is_allowed(path);
        }

        let robots_url = format!("https://{host}/robots.txt");
        let entry = match self.client.get(&robots_url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let body = resp
                    .bytes()
                    .await
                    .map(|b| b.slice(0..b.len().min(self.config.robots_body_cap_bytes)))
                    .unwrap_or_default();
                match std::str::from_utf8(&body) {
                    Ok(text) => RobotsEntry::builder()
                        .host(host)
                        .disallow_rules(parse_disallow_rules(text))
                        .fetched_at(now)
                        .build(),
                    Err(_) => RobotsEntry::builder().host(host).allow_all(true).fetched_at(now).build(),
                }
            }
            // non-2xx, parse failure, or network error all degrade to allow-all (spec §4.4).
            _ => RobotsEntry::builder().host(host).allow_all(true).fetched_at(now).build(),
        };
        let allowed = entry.is_allowed(path);
        self.pacing.cache_robots(entry).await;
        allowed
    }

    /// One claim-and-process cycle. Returns `false` when nothing was
    /// available to claim, so the caller can sleep `claim_retry_delay`.
    pub async fn tick(&self, shutdown: &CancellationToken) -> Result<bool, FetchError> {
        let Some(mut url) = self.frontier.claim_one().await? else {
            return Ok(false);
        };

        if shutdown.is_cancelled() {
            return Ok(true);
        }

        let path = reqwest::Url::parse(&url.url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| "/".to_string());

        if !self.is_allowed(&url.host, &path).await {
            self.frontier.mark_dead(url.id, dead_reason::ROBOTS_BLOCKED).await?;
            info!(url = %url.url, "robots disallowed, marked dead");
            return Ok(true);
        }

        let outcome = self.fetch_and_classify(&mut url).await;
        self.pacing.record_fetch(&url.host, Utc::now()).await;

        match outcome {
            Ok(Some((content_hash, etag, last_modified, final_url))) => {
                self.frontier
                    .mark_fetched(url.id, content_hash, etag, last_modified, final_url)
                    .await?;
            }
            Ok(None) => {
                // 304: success with no new content, no new hash/etag/last-modified to store.
                self.frontier.mark_fetched(url.id, None, None, None, None).await?;
            }
            Err(Classification::Dead(reason)) => {
                self.frontier.mark_dead(url.id, &reason).await?;
            }
            Err(Classification::Failed(reason)) => {
                self.frontier.mark_failed(url.id, &reason, self.config.max_retries).await?;
            }
        }
        Ok(true)
    }

    async fn fetch_and_classify(
        &self,
        url: &mut FrontierUrl,
    ) -> Result<Option<(Option<String>, Option<String>, Option<String>, Option<String>)>, Classification> {
        let mut current = url.url.clone();
        let mut hops = 0u8;

        loop {
            let mut req = self.client.get(&current);
            if let Some(etag) = &url.etag {
                req = req.header(header::IF_NONE_MATCH, etag.clone());
            }
            if let Some(last_modified) = &url.last_modified {
                req = req.header(header::IF_MODIFIED_SINCE, last_modified.clone());
            }

            let resp = req.send().await.map_err(|e| Classification::Failed(e.to_string()))?;
            let status = resp.status();

            if status.is_redirection() {
                hops += 1;
                if hops > self.config.max_redirects {
                    return Err(Classification::Failed(dead_reason::TOO_MANY_REDIRECTS.to_string()));
                }
                let Some(location) = resp.headers().get(header::LOCATION).and_then(|v| v.to_str().ok()) else {
                    return Err(Classification::Failed("redirect without location header".to_string()));
                };
                current = location.to_string();
                continue;
            }

            let final_url = if current != url.url { Some(current.clone()) } else { None };

            return match status {
                StatusCode::OK => {
                    let etag = resp.headers().get(header::ETAG).and_then(|v| v.to_str().ok()).map(str::to_string);
                    let last_modified = resp
                        .headers()
                        .get(header::LAST_MODIFIED)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    let body = resp.bytes().await.map_err(|e| Classification::Failed(e.to_string()))?;
                    let body = body.slice(0..body.len().min(self.config.response_body_cap_bytes));

                    let mut hasher = Sha256::new();
                    hasher.update(&body);
                    let content_hash = format!("{:x}", hasher.finalize());

                    let extracted = self
                        .extractor
                        .extract(&body)
                        .await
                        .map_err(|e| Classification::Failed(e.to_string()))?;
                    self.indexer
                        .index(&current, &extracted)
                        .await
                        .map_err(|e| Classification::Failed(e.to_string()))?;

                    Ok(Some((Some(content_hash), etag, last_modified, final_url)))
                }
                StatusCode::NOT_MODIFIED => Ok(None),
                StatusCode::NOT_FOUND => Err(Classification::Dead(dead_reason::NOT_FOUND.to_string())),
                s if s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error() => {
                    Err(Classification::Failed(format!("http status {}", s.as_u16())))
                }
                s => Err(Classification::Failed(format!("http status {}", s.as_u16()))),
            };
        }
    }
}

enum Classification {
    Dead(String),
    Failed(String),
}

fn parse_disallow_rules(robots_txt: &str) -> Vec<String> {
    let mut applies = false;
    let mut rules = Vec::new();
    for line in robots_txt.lines() {
        let line = line.trim();
        if let Some(agent) = line.strip_prefix("User-agent:") {
            applies = agent.trim() == "*";
        } else if applies {
            if let Some(path) = line.strip_prefix("Disallow:") {
                let path = path.trim();
                if !path.is_empty() {
                    rules.push(path.to_string());
                }
            }
        }
    }
    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_disallow_rules_scoped_to_wildcard_agent() {
        let txt = "User-agent: *\nDisallow: /private\nUser-agent: Googlebot\nDisallow: /only-google";
        let rules = parse_disallow_rules(txt);
        assert_eq!(rules, vec!["/private".to_string()]);
    }
}
