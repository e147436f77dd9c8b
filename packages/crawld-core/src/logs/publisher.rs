use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::warn;
use uuid::Uuid;

use super::archive::{archive_entries, BlobStore};
use super::ring_buffer::LogRingBuffer;
use crate::types::LogEntry;

/// The named events a log subscriber sees over its stream (spec §4.8):
/// a one-time replay of the buffered backlog, then live lines, then an
/// archived marker once the backing buffer is flushed to blob storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LogEvent {
    #[serde(rename = "log:replay")]
    Replay { entries: Vec<LogEntry>, count: usize },
    #[serde(rename = "log:line")]
    Line(LogEntry),
    #[serde(rename = "log:archived")]
    Archived { key: String },
}

struct ExecutionChannel {
    buffer: LogRingBuffer,
    sender: broadcast::Sender<LogEvent>,
}

impl ExecutionChannel {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(16));
        Self {
            buffer: LogRingBuffer::new(capacity),
            sender,
        }
    }
}

/// Per-execution log buffer and publisher registry, keyed by
/// `(job_id, execution_number)` (spec §4.8). Mirrors a topic-keyed
/// broadcast hub: a channel is created lazily on first publish or
/// subscribe and torn down by `cleanup`.
pub struct LogHub {
    channels: Mutex<HashMap<(Uuid, i64), Arc<ExecutionChannel>>>,
    buffer_capacity: usize,
}

impl LogHub {
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            buffer_capacity,
        }
    }

    async fn channel_for(&self, job_id: Uuid, execution_number: i64) -> Arc<ExecutionChannel> {
        let mut channels = self.channels.lock().await;
        channels
            .entry((job_id, execution_number))
            .or_insert_with(|| Arc::new(ExecutionChannel::new(self.buffer_capacity)))
            .clone()
    }

    /// Record an entry into the execution's buffer and fan it out live.
    /// The push and the broadcast send happen under the same buffer lock,
    /// so a concurrent `subscribe` can never land between them (testable
    /// property 8): it either replays the entry in its snapshot or
    /// receives it live, never both or neither.
    pub async fn publish(&self, job_id: Uuid, execution_number: i64, entry: LogEntry) -> Option<LogEntry> {
        let channel = self.channel_for(job_id, execution_number).await;
        let (evicted, _) = channel.buffer.push_and(entry.clone(), |e| {
            let _ = channel.sender.send(LogEvent::Line(e.clone()));
        });
        evicted
    }

    pub async fn tail(&self, job_id: Uuid, execution_number: i64) -> Vec<LogEntry> {
        self.channel_for(job_id, execution_number).await.buffer.snapshot()
    }

    pub async fn read_last(&self, job_id: Uuid, execution_number: i64, n: usize) -> Vec<LogEntry> {
        self.channel_for(job_id, execution_number).await.buffer.read_last(n)
    }

    pub async fn read_since(
        &self,
        job_id: Uuid,
        execution_number: i64,
        since: chrono::DateTime<chrono::Utc>,
    ) -> Vec<LogEntry> {
        self.channel_for(job_id, execution_number).await.buffer.read_since(since)
    }

    /// Subscribe to an execution's log, replaying the current backlog as
    /// one `log:replay` event before live `log:line` events. The replay
    /// snapshot and the broadcast subscription are taken under the same
    /// lock as `publish`'s push+send, so no line can be dropped or
    /// duplicated across the seam.
    pub async fn subscribe(&self, job_id: Uuid, execution_number: i64) -> impl Stream<Item = LogEvent> {
        let channel = self.channel_for(job_id, execution_number).await;
        let (snapshot, rx) = channel.buffer.snapshot_and(|| channel.sender.subscribe());

        let replay = tokio_stream::once(LogEvent::Replay {
            count: snapshot.len(),
            entries: snapshot,
        });
        let live = BroadcastStream::new(rx).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "log subscriber lagged, entries dropped");
                None
            }
        });
        replay.chain(live)
    }

    /// Flush the execution's buffer to blob storage and emit `log:archived`
    /// to any live subscribers, then clear the buffer (spec §6, scenario S5).
    pub async fn archive(
        &self,
        store: &dyn BlobStore,
        job_id: Uuid,
        execution_number: i64,
    ) -> anyhow::Result<String> {
        let channel = self.channel_for(job_id, execution_number).await;
        let entries = channel.buffer.snapshot();
        let key = archive_entries(store, job_id, execution_number, &entries).await?;
        let _ = channel.sender.send(LogEvent::Archived { key: key.clone() });
        channel.buffer.clear();
        Ok(key)
    }

    /// Drop channels with no live subscribers and an empty buffer, so
    /// long-running processes don't accumulate one entry per historical
    /// execution forever.
    pub async fn cleanup(&self) {
        self.channels
            .lock()
            .await
            .retain(|_, c| c.sender.receiver_count() > 0 || !c.buffer.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LogCategory, LogLevel};

    fn entry(msg: &str) -> LogEntry {
        LogEntry::builder()
            .level(LogLevel::Info)
            .category(LogCategory::Lifecycle)
            .message(msg)
            .build()
    }

    #[tokio::test]
    async fn subscribe_replays_backlog_then_live_lines() {
        let hub = LogHub::new(16);
        let job_id = Uuid::new_v4();
        hub.publish(job_id, 1, entry("a")).await;

        let mut stream = Box::pin(hub.subscribe(job_id, 1).await);
        let replay = stream.next().await.unwrap();
        match replay {
            LogEvent::Replay { entries, count } => {
                assert_eq!(count, 1);
                assert_eq!(entries[0].message, "a");
            }
            _ => panic!("expected replay event first"),
        }

        hub.publish(job_id, 1, entry("b")).await;
        let live = stream.next().await.unwrap();
        match live {
            LogEvent::Line(e) => assert_eq!(e.message, "b"),
            _ => panic!("expected line event"),
        }
    }

    #[tokio::test]
    async fn archive_emits_archived_event_and_clears_buffer() {
        let hub = LogHub::new(16);
        let job_id = Uuid::new_v4();
        hub.publish(job_id, 1, entry("a")).await;

        let mut stream = Box::pin(hub.subscribe(job_id, 1).await);
        stream.next().await.unwrap(); // replay

        let store = super::super::archive::InMemoryBlobStore::new();
        let key = hub.archive(&store, job_id, 1).await.unwrap();
        assert_eq!(key, format!("logs/{job_id}/1.ndjson.gz"));
        assert!(hub.tail(job_id, 1).await.is_empty());

        let archived = stream.next().await.unwrap();
        match archived {
            LogEvent::Archived { key: k } => assert_eq!(k, key),
            _ => panic!("expected archived event"),
        }
    }

    #[tokio::test]
    async fn distinct_executions_have_independent_buffers() {
        let hub = LogHub::new(16);
        let job_id = Uuid::new_v4();
        hub.publish(job_id, 1, entry("run-1")).await;
        hub.publish(job_id, 2, entry("run-2")).await;

        assert_eq!(hub.tail(job_id, 1).await.len(), 1);
        assert_eq!(hub.tail(job_id, 2).await[0].message, "run-2");
    }
}
