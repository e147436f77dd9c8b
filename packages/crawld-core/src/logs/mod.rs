//! Log buffer and publisher (spec §4.8): an in-memory ring buffer fans
//! live entries out over SSE-style broadcast, with periodic gzip archival
//! for anything that ages out.

mod archive;
mod publisher;
mod ring_buffer;

pub use archive::{archive_entries, BlobStore, InMemoryBlobStore};
pub use publisher::{LogEvent, LogHub};
pub use ring_buffer::LogRingBuffer;
