use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, warn};

use super::{Claimed, PendingEntry, PriorityQueue, QueueError};
use crate::types::{JobPriority, QueueMessage};

const PRIORITIES: [JobPriority; 3] = [JobPriority::High, JobPriority::Normal, JobPriority::Low];
const FIELD: &str = "payload";

/// Redis Streams-backed priority queue: one stream per priority band,
/// sharing a single consumer group name across all three so a claim only
/// ever needs one group-membership per worker (spec §4.1).
pub struct RedisPriorityQueue {
    pool: Pool,
    stream_prefix: String,
    consumer_group: String,
    max_stream_len: u64,
}

impl RedisPriorityQueue {
    pub fn new(pool: Pool, stream_prefix: impl Into<String>, consumer_group: impl Into<String>, max_stream_len: u64) -> Self {
        Self {
            pool,
            stream_prefix: stream_prefix.into(),
            consumer_group: consumer_group.into(),
            max_stream_len,
        }
    }

    fn stream_name(&self, priority: JobPriority) -> String {
        format!("{}:{}", self.stream_prefix, priority.stream_suffix())
    }

    /// Ensures the consumer group exists on a stream, creating the stream
    /// itself if needed. Idempotent: `BUSYGROUP` from a concurrent creator
    /// is swallowed.
    async fn ensure_group(&self, conn: &mut deadpool_redis::Connection, stream: &str) -> Result<(), QueueError> {
        let created: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(stream, &self.consumer_group, "0")
            .await;
        if let Err(e) = created {
            if !e.to_string().contains("BUSYGROUP") {
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn parse_message(raw: &str) -> Option<QueueMessage> {
        serde_json::from_str(raw).ok()
    }
}

#[async_trait]
impl PriorityQueue for RedisPriorityQueue {
    async fn enqueue(&self, mut msg: QueueMessage) -> Result<String, QueueError> {
        let mut conn = self.pool.get().await.map_err(|e| {
            QueueError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "pool",
                e.to_string(),
            )))
        })?;
        let stream = self.stream_name(msg.job.priority);
        self.ensure_group(&mut conn, &stream).await?;

        let payload = serde_json::to_string(&msg).unwrap_or_default();
        let id: String = conn
            .xadd_maxlen(
                &stream,
                redis::streams::StreamMaxlen::Approx(self.max_stream_len as usize),
                "*",
                &[(FIELD, payload)],
            )
            .await?;
        msg.message_id = Some(id.clone());
        debug!(stream = %stream, id = %id, "enqueued job");
        Ok(id)
    }

    async fn claim(&self, consumer: &str, batch_size: usize) -> Result<Vec<Claimed>, QueueError> {
        let mut conn = self.pool.get().await.map_err(|e| {
            QueueError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "pool",
                e.to_string(),
            )))
        })?;

        let mut claimed = Vec::new();
        // Priority bands are drained high, then normal, then low (property 1):
        // a later stream is only read once the earlier one yields nothing.
        for priority in PRIORITIES {
            if claimed.len() >= batch_size {
                break;
            }
            let stream = self.stream_name(priority);
            self.ensure_group(&mut conn, &stream).await?;

            let remaining = batch_size - claimed.len();
            let opts = StreamReadOptions::default()
                .group(&self.consumer_group, consumer)
                .count(remaining);
            let reply: StreamReadReply = conn.xread_options(&[&stream], &[">"], &opts).await?;

            for key in reply.keys {
                for id in key.ids {
                    let Some(raw) = id.map.get(FIELD).and_then(|v| {
                        if let redis::Value::Data(bytes) = v {
                            String::from_utf8(bytes.clone()).ok()
                        } else {
                            None
                        }
                    }) else {
                        continue;
                    };
                    let Some(mut msg) = Self::parse_message(&raw) else {
                        warn!(stream = %key.key, id = %id.id, "dropping unparseable queue message");
                        continue;
                    };
                    msg.message_id = Some(id.id.clone());
                    claimed.push(Claimed {
                        stream: key.key.clone(),
                        message: msg,
                    });
                }
            }
        }
        Ok(claimed)
    }

    async fn ack(&self, stream: &str, message_id: &str) -> Result<(), QueueError> {
        let mut conn = self.pool.get().await.map_err(|e| {
            QueueError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "pool",
                e.to_string(),
            )))
        })?;
        let _: i64 = conn.xack(stream, &self.consumer_group, &[message_id]).await?;
        Ok(())
    }

    async fn reclaim_stale(&self, consumer: &str, min_idle: Duration) -> Result<Vec<Claimed>, QueueError> {
        let mut conn = self.pool.get().await.map_err(|e| {
            QueueError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "pool",
                e.to_string(),
            )))
        })?;

        let mut reclaimed = Vec::new();
        for priority in PRIORITIES {
            let stream = self.stream_name(priority);
            let (_cursor, entries, _deleted): (String, Vec<redis::streams::StreamId>, Vec<String>) = conn
                .xautoclaim_options(
                    &stream,
                    &self.consumer_group,
                    consumer,
                    min_idle.as_millis() as u64,
                    "0",
                    redis::streams::StreamAutoClaimOptions::default(),
                )
                .await?;

            for id in entries {
                let Some(raw) = id.map.get(FIELD).and_then(|v| {
                    if let redis::Value::Data(bytes) = v {
                        String::from_utf8(bytes.clone()).ok()
                    } else {
                        None
                    }
                }) else {
                    continue;
                };
                let Some(mut msg) = Self::parse_message(&raw) else {
                    continue;
                };
                msg.message_id = Some(id.id.clone());
                reclaimed.push(Claimed {
                    stream: stream.clone(),
                    message: msg,
                });
            }
        }
        Ok(reclaimed)
    }

    async fn pending(&self, priority: JobPriority) -> Result<u64, QueueError> {
        let mut conn = self.pool.get().await.map_err(|e| {
            QueueError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "pool",
                e.to_string(),
            )))
        })?;
        let stream = self.stream_name(priority);
        let reply: redis::streams::StreamPendingReply = conn.xpending(&stream, &self.consumer_group).await?;
        Ok(match reply {
            redis::streams::StreamPendingReply::Empty => 0,
            redis::streams::StreamPendingReply::Data(data) => data.count as u64,
        })
    }

    async fn pending_detail(&self, priority: JobPriority) -> Result<Vec<PendingEntry>, QueueError> {
        let mut conn = self.pool.get().await.map_err(|e| {
            QueueError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "pool",
                e.to_string(),
            )))
        })?;
        let stream = self.stream_name(priority);
        let reply: redis::streams::StreamPendingCountReply = conn
            .xpending_count(&stream, &self.consumer_group, "-", "+", 1000)
            .await?;
        Ok(reply
            .ids
            .into_iter()
            .map(|id| PendingEntry {
                message_id: id.id,
                consumer: id.consumer,
                idle: Duration::from_millis(id.time_since_delivered as u64),
                delivery_count: id.times_delivered as u64,
            })
            .collect())
    }
}
