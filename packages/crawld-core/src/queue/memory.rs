use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Claimed, PendingEntry, PriorityQueue, QueueError};
use crate::types::{JobPriority, QueueMessage};

struct Pending {
    message: QueueMessage,
    stream: String,
    consumer: String,
    claimed_at: Instant,
}

/// In-memory stand-in for [`RedisPriorityQueue`](super::RedisPriorityQueue),
/// used by scheduler and worker-pool tests. Mirrors the priority-draining
/// order but has no reclaim timer: `reclaim_stale` returns everything
/// currently pending, regardless of `min_idle`.
#[derive(Default)]
pub struct InMemoryPriorityQueue {
    high: Mutex<VecDeque<QueueMessage>>,
    normal: Mutex<VecDeque<QueueMessage>>,
    low: Mutex<VecDeque<QueueMessage>>,
    pending: Mutex<HashMap<String, Pending>>,
    next_id: AtomicU64,
}

impl InMemoryPriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue_for(&self, priority: JobPriority) -> &Mutex<VecDeque<QueueMessage>> {
        match priority {
            JobPriority::High => &self.high,
            JobPriority::Normal => &self.normal,
            JobPriority::Low => &self.low,
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[async_trait]
impl PriorityQueue for InMemoryPriorityQueue {
    async fn enqueue(&self, mut msg: QueueMessage) -> Result<String, QueueError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        msg.message_id = Some(id.clone());
        self.queue_for(msg.job.priority).lock().await.push_back(msg);
        Ok(id)
    }

    async fn claim(&self, consumer: &str, batch_size: usize) -> Result<Vec<Claimed>, QueueError> {
        let mut claimed = Vec::new();
        for priority in [JobPriority::High, JobPriority::Normal, JobPriority::Low] {
            let mut q = self.queue_for(priority).lock().await;
            while claimed.len() < batch_size {
                let Some(msg) = q.pop_front() else { break };
                let stream = format!("memory:{}", priority.stream_suffix());
                let id = msg.message_id.clone().unwrap_or_default();
                self.pending.lock().await.insert(
                    id,
                    Pending {
                        message: msg.clone(),
                        stream: stream.clone(),
                        consumer: consumer.to_string(),
                        claimed_at: Instant::now(),
                    },
                );
                claimed.push(Claimed { stream, message: msg });
            }
        }
        Ok(claimed)
    }

    async fn ack(&self, _stream: &str, message_id: &str) -> Result<(), QueueError> {
        self.pending.lock().await.remove(message_id);
        Ok(())
    }

    async fn reclaim_stale(&self, _consumer: &str, _min_idle: Duration) -> Result<Vec<Claimed>, QueueError> {
        let pending = self.pending.lock().await;
        Ok(pending
            .values()
            .map(|p| Claimed {
                stream: p.stream.clone(),
                message: p.message.clone(),
            })
            .collect())
    }

    async fn pending(&self, priority: JobPriority) -> Result<u64, QueueError> {
        let stream = format!("memory:{}", priority.stream_suffix());
        Ok(self.pending.lock().await.values().filter(|p| p.stream == stream).count() as u64)
    }

    async fn pending_detail(&self, priority: JobPriority) -> Result<Vec<PendingEntry>, QueueError> {
        let stream = format!("memory:{}", priority.stream_suffix());
        Ok(self
            .pending
            .lock()
            .await
            .iter()
            .filter(|(_, p)| p.stream == stream)
            .map(|(id, p)| PendingEntry {
                message_id: id.clone(),
                consumer: p.consumer.clone(),
                idle: p.claimed_at.elapsed(),
                delivery_count: 1,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Job;

    fn job(priority: JobPriority) -> QueueMessage {
        let mut job = Job::builder()
            .source_id("source-a")
            .url("https://example.com")
            .build();
        job.priority = priority;
        QueueMessage::new(job)
    }

    #[tokio::test]
    async fn claim_drains_high_before_normal_before_low() {
        let q = InMemoryPriorityQueue::new();
        q.enqueue(job(JobPriority::Low)).await.unwrap();
        q.enqueue(job(JobPriority::Normal)).await.unwrap();
        q.enqueue(job(JobPriority::High)).await.unwrap();

        let claimed = q.claim("worker-a", 3).await.unwrap();
        let priorities: Vec<JobPriority> = claimed.iter().map(|c| c.message.job.priority).collect();
        assert_eq!(
            priorities,
            vec![JobPriority::High, JobPriority::Normal, JobPriority::Low]
        );
    }

    #[tokio::test]
    async fn ack_removes_from_pending() {
        let q = InMemoryPriorityQueue::new();
        q.enqueue(job(JobPriority::High)).await.unwrap();
        let claimed = q.claim("worker-a", 10).await.unwrap();
        assert_eq!(q.pending_count().await, 1);
        q.ack(&claimed[0].stream, claimed[0].message.message_id.as_ref().unwrap())
            .await
            .unwrap();
        assert_eq!(q.pending_count().await, 0);
    }

    #[tokio::test]
    async fn unacked_message_is_reclaimable() {
        let q = InMemoryPriorityQueue::new();
        q.enqueue(job(JobPriority::High)).await.unwrap();
        q.claim("worker-a", 10).await.unwrap();
        let reclaimed = q.reclaim_stale("worker-b", Duration::from_secs(0)).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
    }
}
