//! Environment-variable configuration for the scheduling kernel.
//!
//! Every tunable named throughout §4 of the spec (poll interval, lease TTL,
//! stagger, batch sizes, …) has a default matching the spec's stated
//! default and can be overridden through the environment.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_duration_secs(key: &str, default_secs: u64) -> Result<Duration> {
    let raw = env_or(key, &default_secs.to_string());
    let secs: u64 = raw
        .parse()
        .with_context(|| format!("{key} must be an integer number of seconds"))?;
    Ok(Duration::from_secs(secs))
}

/// Process-wide configuration loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub stream_prefix: String,
    pub consumer_group: String,
    pub max_stream_len: u64,
    pub claim_min_idle: Duration,

    pub worker_pool_size: usize,
    pub task_timeout: Duration,
    pub drain_timeout: Duration,

    pub scheduler_poll_interval: Duration,
    pub scheduler_batch_size: i64,
    pub stagger: Duration,
    pub default_rate_limit: u32,

    pub leader_lease_key: String,
    pub leader_lease_ttl: Duration,

    pub claim_retry_delay: Duration,
    pub robots_cache_ttl: Duration,
    pub fetch_user_agent: String,
    pub max_redirects: u8,
    pub response_body_cap_bytes: usize,
    pub robots_body_cap_bytes: usize,

    pub webhook_secret: String,
    pub webhook_timestamp_freshness: Duration,
    pub webhook_body_cap_bytes: usize,

    pub log_buffer_cap: usize,
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// spec's stated defaults for every tunable not set explicitly.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            redis_url: env_or("REDIS_URL", "redis://localhost:6379"),
            stream_prefix: env_or("CRAWLD_STREAM_PREFIX", "crawld"),
            consumer_group: env_or("CRAWLD_CONSUMER_GROUP", "scheduler"),
            max_stream_len: env_or("CRAWLD_MAX_STREAM_LEN", "10000")
                .parse()
                .context("CRAWLD_MAX_STREAM_LEN must be an integer")?,
            claim_min_idle: env_duration_secs("CRAWLD_CLAIM_MIN_IDLE_SECS", 5 * 60)?,

            worker_pool_size: env_or("CRAWLD_WORKER_POOL_SIZE", "10")
                .parse()
                .context("CRAWLD_WORKER_POOL_SIZE must be an integer")?,
            task_timeout: env_duration_secs("CRAWLD_TASK_TIMEOUT_SECS", 60 * 60)?,
            drain_timeout: env_duration_secs("CRAWLD_DRAIN_TIMEOUT_SECS", 30)?,

            scheduler_poll_interval: env_duration_secs("CRAWLD_SCHEDULER_POLL_INTERVAL_SECS", 10)?,
            scheduler_batch_size: env_or("CRAWLD_SCHEDULER_BATCH_SIZE", "50")
                .parse()
                .context("CRAWLD_SCHEDULER_BATCH_SIZE must be an integer")?,
            stagger: env_duration_secs("CRAWLD_STAGGER_SECS", 5 * 60)?,
            default_rate_limit: env_or("CRAWLD_DEFAULT_RATE_LIMIT", "10")
                .parse()
                .unwrap_or(10),

            leader_lease_key: env_or("CRAWLD_LEADER_LEASE_KEY", "crawld:scheduler"),
            leader_lease_ttl: env_duration_secs("CRAWLD_LEADER_LEASE_TTL_SECS", 30)?,

            claim_retry_delay: env_duration_secs("CRAWLD_CLAIM_RETRY_DELAY_SECS", 5)?,
            robots_cache_ttl: env_duration_secs("CRAWLD_ROBOTS_CACHE_TTL_SECS", 24 * 60 * 60)?,
            fetch_user_agent: env_or("CRAWLD_USER_AGENT", "crawld/0.1"),
            max_redirects: env_or("CRAWLD_MAX_REDIRECTS", "10")
                .parse()
                .context("CRAWLD_MAX_REDIRECTS must be an integer")?,
            response_body_cap_bytes: env_or("CRAWLD_RESPONSE_BODY_CAP_BYTES", &(10 * 1024 * 1024).to_string())
                .parse()
                .context("CRAWLD_RESPONSE_BODY_CAP_BYTES must be an integer")?,
            robots_body_cap_bytes: env_or("CRAWLD_ROBOTS_BODY_CAP_BYTES", &(512 * 1024).to_string())
                .parse()
                .context("CRAWLD_ROBOTS_BODY_CAP_BYTES must be an integer")?,

            webhook_secret: env::var("CRAWLD_WEBHOOK_SECRET").unwrap_or_default(),
            webhook_timestamp_freshness: env_duration_secs(
                "CRAWLD_WEBHOOK_TIMESTAMP_FRESHNESS_SECS",
                5 * 60,
            )?,
            webhook_body_cap_bytes: env_or("CRAWLD_WEBHOOK_BODY_CAP_BYTES", &(1024 * 1024).to_string())
                .parse()
                .context("CRAWLD_WEBHOOK_BODY_CAP_BYTES must be an integer")?,

            log_buffer_cap: env_or("CRAWLD_LOG_BUFFER_CAP", "1000")
                .parse()
                .context("CRAWLD_LOG_BUFFER_CAP must be an integer")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_duration_secs_uses_default_when_unset() {
        std::env::remove_var("CRAWLD_TEST_DURATION");
        let d = env_duration_secs("CRAWLD_TEST_DURATION", 42).unwrap();
        assert_eq!(d, Duration::from_secs(42));
    }

    #[test]
    fn env_or_falls_back_to_default() {
        std::env::remove_var("CRAWLD_TEST_STRING");
        assert_eq!(env_or("CRAWLD_TEST_STRING", "fallback"), "fallback");
    }
}
