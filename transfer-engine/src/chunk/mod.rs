//! Chunked upload/download of large archives over request-sized pieces.

pub mod producers;
pub mod store;
pub mod transfer;

pub use producers::{ArchiveFileProducer, FullSiteProducer};
pub use store::{JobStore, SweepReport};
pub use transfer::{ChunkTransfer, DownloadProducer};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const MIN_CHUNK_SIZE: u64 = 256 * 1024;
pub const MAX_CHUNK_SIZE: u64 = 5 * 1024 * 1024;
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Unfinished jobs older than this are swept.
pub const JOB_TTL_HOURS: i64 = 24;

/// Clamp a requested chunk size into the supported range.
pub fn clamp_chunk_size(requested: Option<u64>, default: u64) -> u64 {
    requested
        .unwrap_or(default)
        .clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkMode {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Processing,
    Ready,
    Error,
}

/// Persistent record of one chunk job (`<id>.json` next to `<id>.bin`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkJob {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub mode: ChunkMode,
    pub chunk_size: u64,
    pub total_chunks: Option<u64>,
    pub received_chunks: u64,
    pub completed: bool,
    #[serde(default)]
    pub checksum: Option<String>,
    pub size: u64,
    pub status: JobStatus,
    #[serde(default)]
    pub error: Option<String>,
    /// Indices already written; a retried chunk is not counted twice
    #[serde(default)]
    pub received: BTreeSet<u64>,
}

impl ChunkJob {
    pub fn new(id: String, mode: ChunkMode, chunk_size: u64) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            mode,
            chunk_size,
            total_chunks: None,
            received_chunks: 0,
            completed: false,
            checksum: None,
            size: 0,
            status: JobStatus::Processing,
            error: None,
            received: BTreeSet::new(),
        }
    }

    /// Lowest index not yet received, or `total_chunks` when all arrived.
    pub fn next_index(&self) -> u64 {
        let total = self.total_chunks.unwrap_or(0);
        (0..total)
            .find(|i| !self.received.contains(i))
            .unwrap_or(total)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadInit {
    pub job_id: String,
    pub chunk_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadProgress {
    pub next_index: u64,
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadChunk {
    /// base64 of the chunk bytes
    pub chunk: String,
    pub completed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_chunk_size() {
        assert_eq!(clamp_chunk_size(None, DEFAULT_CHUNK_SIZE), DEFAULT_CHUNK_SIZE);
        assert_eq!(clamp_chunk_size(Some(1), DEFAULT_CHUNK_SIZE), MIN_CHUNK_SIZE);
        assert_eq!(clamp_chunk_size(Some(u64::MAX), DEFAULT_CHUNK_SIZE), MAX_CHUNK_SIZE);
        assert_eq!(clamp_chunk_size(Some(300_000), DEFAULT_CHUNK_SIZE), 300_000);
    }

    #[test]
    fn test_next_index_skips_received() {
        let mut job = ChunkJob::new("a".into(), ChunkMode::Upload, MIN_CHUNK_SIZE);
        job.total_chunks = Some(4);
        job.received.extend([0, 2]);
        assert_eq!(job.next_index(), 1);
        job.received.extend([1, 3]);
        assert_eq!(job.next_index(), 4);
    }
}
