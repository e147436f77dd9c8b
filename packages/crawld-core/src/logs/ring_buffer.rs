use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::types::LogEntry;

/// Fixed-capacity buffer of the most recent log entries. Oldest entries
/// are evicted (and handed to the caller) once capacity is exceeded, so
/// the archiver can pick them up without a separate scan (spec §4.8).
pub struct LogRingBuffer {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl LogRingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Push an entry, returning any entry evicted to make room.
    pub fn push(&self, entry: LogEntry) -> Option<LogEntry> {
        self.push_and(entry, |_| ()).0
    }

    /// Push an entry and run `f` while still holding the buffer lock,
    /// so a concurrent `snapshot_and` can never observe the buffer
    /// between the push and `f`'s effect (used to keep a broadcast send
    /// atomic with the push it reports, for `LogHub::publish`).
    pub fn push_and<F, R>(&self, entry: LogEntry, f: F) -> (Option<LogEntry>, R)
    where
        F: FnOnce(&LogEntry) -> R,
    {
        let mut entries = self.entries.lock().unwrap();
        let evicted = if entries.len() >= self.capacity {
            entries.pop_front()
        } else {
            None
        };
        entries.push_back(entry.clone());
        let r = f(&entry);
        (evicted, r)
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }

    /// Snapshot the buffer and run `f` while still holding the lock, so a
    /// concurrent `push_and` can't land between the snapshot and `f`
    /// (used to subscribe to the broadcast channel atomically with the
    /// replay snapshot in `LogHub::subscribe`).
    pub fn snapshot_and<F, R>(&self, f: F) -> (Vec<LogEntry>, R)
    where
        F: FnOnce() -> R,
    {
        let entries = self.entries.lock().unwrap();
        let snapshot = entries.iter().cloned().collect();
        let r = f();
        (snapshot, r)
    }

    /// The most recent `n` entries, oldest first.
    pub fn read_last(&self, n: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock().unwrap();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    /// All entries with `timestamp >= since`, oldest first.
    pub fn read_since(&self, since: DateTime<Utc>) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.timestamp >= since)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate serialized size of the buffer, used to decide when a
    /// publisher should archive early rather than wait for eviction.
    pub fn bytes(&self) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|e| serde_json::to_vec(e).map(|v| v.len()).unwrap_or(0))
            .sum()
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

    #[test]
    fn push_evicts_oldest_once_full() {
        let buf = LogRingBuffer::new(2);
        assert!(buf.push(entry("a")).is_none());
        assert!(buf.push(entry("b")).is_none());
        let evicted = buf.push(entry("c")).unwrap();
        assert_eq!(evicted.message, "a");
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn snapshot_preserves_insertion_order() {
        let buf = LogRingBuffer::new(5);
        buf.push(entry("a"));
        buf.push(entry("b"));
        let snap = buf.snapshot();
        assert_eq!(snap[0].message, "a");
        assert_eq!(snap[1].message, "b");
    }

    #[test]
    fn read_last_returns_most_recent_n_in_order() {
        let buf = LogRingBuffer::new(10);
        for msg in ["a", "b", "c", "d"] {
            buf.push(entry(msg));
        }
        let last = buf.read_last(2);
        assert_eq!(last.iter().map(|e| e.message.as_str()).collect::<Vec<_>>(), vec!["c", "d"]);
    }

    #[test]
    fn read_since_filters_by_timestamp() {
        let buf = LogRingBuffer::new(10);
        let mut old = entry("old");
        old.timestamp = Utc::now() - chrono::Duration::hours(1);
        buf.push(old);
        let cutoff = Utc::now() - chrono::Duration::minutes(1);
        buf.push(entry("new"));

        let recent = buf.read_since(cutoff);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].message, "new");
    }

    #[test]
    fn clear_empties_the_buffer() {
        let buf = LogRingBuffer::new(10);
        buf.push(entry("a"));
        buf.clear();
        assert!(buf.is_empty());
    }
}
