use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use uuid::Uuid;

use crate::types::LogEntry;

/// Where archived ndjson.gz blobs land. A real deployment backs this with
/// object storage; the archival step here only needs put/get, so the trait
/// stays narrow.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> anyhow::Result<()>;
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
}

#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> anyhow::Result<()> {
        self.blobs.lock().unwrap().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().unwrap().get(key).cloned())
    }
}

/// Gzip a batch of entries as newline-delimited JSON and write it under
/// the execution's object key (spec §4.8: archival is best-effort and
/// never blocks the publish path — failures here are logged and the
/// entries are otherwise lost, not retried indefinitely).
pub async fn archive_entries(
    store: &dyn BlobStore,
    job_id: Uuid,
    execution_number: i64,
    entries: &[LogEntry],
) -> anyhow::Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for entry in entries {
        let line = serde_json::to_string(entry)?;
        encoder.write_all(line.as_bytes())?;
        encoder.write_all(b"\n")?;
    }
    let bytes = encoder.finish()?;
    let key = format!("logs/{job_id}/{execution_number}.ndjson.gz");
    store.put(&key, bytes).await?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LogCategory, LogLevel};
    use std::io::Read;

    fn entry(msg: &str) -> LogEntry {
        LogEntry::builder()
            .level(LogLevel::Info)
            .category(LogCategory::Lifecycle)
            .message(msg)
            .build()
    }

    #[tokio::test]
    async fn archive_round_trips_through_gzip() {
        let store = InMemoryBlobStore::new();
        let job_id = Uuid::new_v4();
        let entries = vec![entry("a"), entry("b")];
        let key = archive_entries(&store, job_id, 3, &entries).await.unwrap();
        assert_eq!(key, format!("logs/{job_id}/3.ndjson.gz"));

        let bytes = store.get(&key).await.unwrap().unwrap();
        let mut decoder = flate2::read::GzDecoder::new(&bytes[..]);
        let mut out = String::new();
        decoder.read_to_string(&mut out).unwrap();
        assert_eq!(out.lines().count(), 2);
        assert!(out.contains("\"message\":\"a\""));
    }
}
