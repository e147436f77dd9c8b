//! Trigger router (spec §4.5): verifies inbound webhook signatures and
//! fans out crawl events to subscribers over a broadcast channel, mirroring
//! the SSE hub's `Lagged` handling used elsewhere in this workspace.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::StreamExt;
use tracing::warn;
use uuid::Uuid;

use crate::error::{Categorizable, ErrorCategory};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("webhook body exceeds the {0} byte cap")]
    BodyTooLarge(usize),
    #[error("webhook signature does not match")]
    BadSignature,
    #[error("webhook timestamp is outside the freshness window")]
    StaleTimestamp,
    #[error("malformed signature header")]
    MalformedHeader,
}

impl Categorizable for RouterError {
    fn category(&self) -> ErrorCategory {
        match self {
            RouterError::BodyTooLarge(_) => ErrorCategory::Validation,
            RouterError::BadSignature => ErrorCategory::Auth,
            RouterError::StaleTimestamp => ErrorCategory::Auth,
            RouterError::MalformedHeader => ErrorCategory::Validation,
        }
    }

    fn reason(&self) -> Cow<'static, str> {
        match self {
            RouterError::BodyTooLarge(_) => Cow::Borrowed("webhook_body_too_large"),
            RouterError::BadSignature => Cow::Borrowed("bad_webhook_signature"),
            RouterError::StaleTimestamp => Cow::Borrowed("stale_webhook_timestamp"),
            RouterError::MalformedHeader => Cow::Borrowed("malformed_signature_header"),
        }
    }
}

/// One emitted crawl event (spec §4.8's SSE envelope, reused here for the
/// router's own fan-out topics such as `job.completed`).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RouterEvent {
    pub topic: String,
    pub payload: serde_json::Value,
    pub emitted_at: DateTime<Utc>,
}

/// Verifies webhook authenticity and fans events out to subscribers.
///
/// HMAC verification is the crate boundary: there is no axum layer here,
/// since the HTTP surface itself is out of scope — a caller-supplied
/// header map and raw body are all `verify_webhook` needs.
pub struct TriggerRouter {
    secret: String,
    timestamp_freshness: Duration,
    body_cap: usize,
    channels: Mutex<HashMap<String, broadcast::Sender<RouterEvent>>>,
    webhook_registrations: Mutex<HashMap<Uuid, String>>,
    channel_registrations: Mutex<HashMap<Uuid, String>>,
}

impl TriggerRouter {
    pub fn new(secret: impl Into<String>, timestamp_freshness: Duration, body_cap: usize) -> Self {
        Self {
            secret: secret.into(),
            timestamp_freshness,
            body_cap,
            channels: Mutex::new(HashMap::new()),
            webhook_registrations: Mutex::new(HashMap::new()),
            channel_registrations: Mutex::new(HashMap::new()),
        }
    }

    /// Bind a job to the webhook path pattern that should trigger it
    /// (spec §4.5). A pattern ending in `*` matches any path sharing its
    /// prefix; otherwise the path must match exactly.
    pub fn register_webhook(&self, job_id: Uuid, pattern: impl Into<String>) {
        self.webhook_registrations.lock().unwrap().insert(job_id, pattern.into());
    }

    /// Bind a job to the pub/sub channel that should trigger it (§4.5).
    pub fn register_channel(&self, job_id: Uuid, channel: impl Into<String>) {
        self.channel_registrations.lock().unwrap().insert(job_id, channel.into());
    }

    /// Remove any webhook/channel registration for a job, e.g. once it's
    /// deleted or its trigger is reconfigured.
    pub fn unregister(&self, job_id: Uuid) {
        self.webhook_registrations.lock().unwrap().remove(&job_id);
        self.channel_registrations.lock().unwrap().remove(&job_id);
    }

    /// Jobs whose registered webhook pattern matches an inbound path
    /// (spec §4.5, scenario S4).
    pub fn match_webhook(&self, path: &str) -> Vec<Uuid> {
        self.webhook_registrations
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, pattern)| pattern_matches(pattern, path))
            .map(|(job_id, _)| *job_id)
            .collect()
    }

    /// Jobs registered against a given channel name.
    pub fn match_channel(&self, channel: &str) -> Vec<Uuid> {
        self.channel_registrations
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, c)| c.as_str() == channel)
            .map(|(job_id, _)| *job_id)
            .collect()
    }

    /// Verify an inbound webhook's `X-Signature: sha256=<hex>` header and
    /// `X-Timestamp` freshness against the raw body bytes (spec §4.5).
    pub fn verify_webhook(&self, signature_header: &str, timestamp: DateTime<Utc>, body: &[u8]) -> Result<(), RouterError> {
        if body.len() > self.body_cap {
            return Err(RouterError::BodyTooLarge(self.body_cap));
        }
        if (Utc::now() - timestamp).abs() > chrono::Duration::from_std(self.timestamp_freshness).unwrap_or_default() {
            return Err(RouterError::StaleTimestamp);
        }

        let hex_sig = signature_header
            .strip_prefix("sha256=")
            .ok_or(RouterError::MalformedHeader)?;
        let expected = hex::decode(hex_sig).map_err(|_| RouterError::MalformedHeader)?;

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).map_err(|_| RouterError::MalformedHeader)?;
        mac.update(body);
        mac.verify_slice(&expected).map_err(|_| RouterError::BadSignature)
    }

    fn channel(&self, topic: &str) -> broadcast::Sender<RouterEvent> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }

    pub fn publish(&self, topic: &str, payload: serde_json::Value) {
        let event = RouterEvent {
            topic: topic.to_string(),
            payload,
            emitted_at: Utc::now(),
        };
        // No subscribers is not an error: broadcast::send only fails when
        // the channel has zero receivers, which is the common case between
        // events.
        let _ = self.channel(topic).send(event);
    }

    /// Subscribe to a topic. Lag is surfaced to the caller as a synthetic
    /// `"lagged"` event rather than silently dropped.
    pub fn subscribe(&self, topic: &str) -> impl tokio_stream::Stream<Item = RouterEvent> {
        let rx = self.channel(topic).subscribe();
        BroadcastStream::new(rx).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "trigger router subscriber lagged, events dropped");
                Some(RouterEvent {
                    topic: "lagged".to_string(),
                    payload: serde_json::json!({ "skipped": skipped }),
                    emitted_at: Utc::now(),
                })
            }
        })
    }
}

/// Exact match, or a trailing `*` matching any path sharing the prefix
/// before it (e.g. `/hooks/github/*` matches `/hooks/github/push`).
fn pattern_matches(pattern: &str, path: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => path.starts_with(prefix),
        None => pattern == path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_body(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_is_accepted() {
        let router = TriggerRouter::new("topsecret", Duration::from_secs(300), 1024);
        let body = b"{\"event\":\"push\"}";
        let sig = signed_body("topsecret", body);
        assert!(router.verify_webhook(&sig, Utc::now(), body).is_ok());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let router = TriggerRouter::new("topsecret", Duration::from_secs(300), 1024);
        let body = b"{\"event\":\"push\"}";
        let sig = signed_body("wrongsecret", body);
        let err = router.verify_webhook(&sig, Utc::now(), body).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Auth);
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let router = TriggerRouter::new("topsecret", Duration::from_secs(60), 1024);
        let body = b"{\"event\":\"push\"}";
        let sig = signed_body("topsecret", body);
        let old = Utc::now() - chrono::Duration::minutes(10);
        let err = router.verify_webhook(&sig, old, body).unwrap_err();
        assert!(matches!(err, RouterError::StaleTimestamp));
    }

    #[test]
    fn oversized_body_is_rejected_before_hashing() {
        let router = TriggerRouter::new("topsecret", Duration::from_secs(300), 4);
        let body = b"this body is too big";
        let sig = signed_body("topsecret", body);
        let err = router.verify_webhook(&sig, Utc::now(), body).unwrap_err();
        assert!(matches!(err, RouterError::BodyTooLarge(4)));
    }

    #[tokio::test]
    async fn publish_delivers_to_subscriber() {
        let router = TriggerRouter::new("topsecret", Duration::from_secs(300), 1024);
        let mut stream = Box::pin(router.subscribe("job.completed"));
        router.publish("job.completed", serde_json::json!({ "job_id": "abc" }));
        let event = stream.next().await.unwrap();
        assert_eq!(event.topic, "job.completed");
    }

    #[test]
    fn register_webhook_matches_exact_path() {
        let router = TriggerRouter::new("topsecret", Duration::from_secs(300), 1024);
        let job_id = Uuid::new_v4();
        router.register_webhook(job_id, "/hooks/github");
        assert_eq!(router.match_webhook("/hooks/github"), vec![job_id]);
        assert!(router.match_webhook("/hooks/gitlab").is_empty());
    }

    #[test]
    fn register_webhook_matches_trailing_wildcard() {
        let router = TriggerRouter::new("topsecret", Duration::from_secs(300), 1024);
        let job_id = Uuid::new_v4();
        router.register_webhook(job_id, "/hooks/github/*");
        assert_eq!(router.match_webhook("/hooks/github/push"), vec![job_id]);
        assert!(router.match_webhook("/hooks/gitlab/push").is_empty());
    }

    #[test]
    fn register_channel_matches_by_name() {
        let router = TriggerRouter::new("topsecret", Duration::from_secs(300), 1024);
        let job_id = Uuid::new_v4();
        router.register_channel(job_id, "crawl-updates");
        assert_eq!(router.match_channel("crawl-updates"), vec![job_id]);
        assert!(router.match_channel("other-channel").is_empty());
    }

    #[test]
    fn unregister_removes_both_webhook_and_channel() {
        let router = TriggerRouter::new("topsecret", Duration::from_secs(300), 1024);
        let job_id = Uuid::new_v4();
        router.register_webhook(job_id, "/hooks/github");
        router.register_channel(job_id, "crawl-updates");
        router.unregister(job_id);
        assert!(router.match_webhook("/hooks/github").is_empty());
        assert!(router.match_channel("crawl-updates").is_empty());
    }
}
