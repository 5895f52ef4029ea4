//! On-disk job store: one `<id>.json` side-file and one `<id>.bin` blob per job.

use super::ChunkJob;
use crate::{Result, TransferError};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub expired: usize,
    pub orphans: usize,
}

pub struct JobStore {
    dir: PathBuf,
    ttl: Duration,
}

impl JobStore {
    /// Open (creating if needed) the store and sweep stale jobs.
    pub fn open(dir: &Path, ttl_hours: i64) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let store = Self {
            dir: dir.to_path_buf(),
            ttl: Duration::hours(ttl_hours.max(1)),
        };
        let report = store.sweep()?;
        if report.expired > 0 || report.orphans > 0 {
            tracing::info!(expired = report.expired, orphans = report.orphans, "Swept chunk jobs");
        }
        Ok(store)
    }

    pub fn new_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    /// Ids come from clients; only accept what [`JobStore::new_id`] produces.
    pub fn is_valid_id(id: &str) -> bool {
        !id.is_empty() && id.len() <= 64 && id.bytes().all(|b| b.is_ascii_alphanumeric())
    }

    fn check_id(id: &str) -> Result<()> {
        if Self::is_valid_id(id) {
            Ok(())
        } else {
            Err(TransferError::NotFound(format!("chunk job '{}'", id)))
        }
    }

    pub fn meta_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    pub fn blob_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.bin", id))
    }

    /// Scratch output of a download worker, renamed to the blob when done.
    pub fn partial_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.partial", id))
    }

    /// Persist a new job. Fails if the id was ever used by a live job.
    pub fn create(&self, job: &ChunkJob, with_blob: bool) -> Result<()> {
        Self::check_id(&job.id)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.meta_path(&job.id))
            .map_err(|e| TransferError::Write(format!("chunk job {}: {}", job.id, e)))?;
        file.write_all(&serde_json::to_vec_pretty(job)?)?;
        file.sync_all()?;

        if with_blob {
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(self.blob_path(&job.id))
                .map_err(|e| TransferError::Write(format!("chunk blob {}: {}", job.id, e)))?;
        }
        Ok(())
    }

    pub fn exists(&self, id: &str) -> bool {
        Self::is_valid_id(id) && self.meta_path(id).exists()
    }

    pub fn load(&self, id: &str) -> Result<Option<ChunkJob>> {
        Self::check_id(id)?;
        match fs::read(self.meta_path(id)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically replace the side-file (write to tmp, then rename).
    pub fn save(&self, job: &ChunkJob) -> Result<()> {
        Self::check_id(&job.id)?;
        let tmp = self.dir.join(format!("{}.json.tmp", job.id));
        fs::write(&tmp, serde_json::to_vec_pretty(job)?)?;
        fs::rename(&tmp, self.meta_path(&job.id))?;
        Ok(())
    }

    /// Save only while the job still exists; returns false if it was deleted.
    pub fn save_if_exists(&self, job: &ChunkJob) -> Result<bool> {
        if !self.exists(&job.id) {
            return Ok(false);
        }
        self.save(job)?;
        Ok(true)
    }

    pub fn write_at(&self, id: &str, offset: u64, bytes: &[u8]) -> Result<()> {
        Self::check_id(id)?;
        let write = || -> std::io::Result<()> {
            let mut file = OpenOptions::new().write(true).open(self.blob_path(id))?;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(bytes)?;
            file.flush()
        };
        write().map_err(|e| TransferError::Write(format!("chunk job {}: {}", id, e)))
    }

    pub fn read_at(&self, id: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
        Self::check_id(id)?;
        let mut file = File::open(self.blob_path(id))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(len as usize);
        file.take(len).read_to_end(&mut buf)?;
        Ok(buf)
    }

    pub fn truncate(&self, id: &str, size: u64) -> Result<()> {
        Self::check_id(id)?;
        let file = OpenOptions::new().write(true).open(self.blob_path(id))?;
        file.set_len(size)?;
        Ok(())
    }

    /// Remove the side-file, blob and any partial output. Returns whether a
    /// side-file existed.
    pub fn delete(&self, id: &str) -> bool {
        if !Self::is_valid_id(id) {
            return false;
        }
        let existed = fs::remove_file(self.meta_path(id)).is_ok();
        let _ = fs::remove_file(self.blob_path(id));
        let _ = fs::remove_file(self.partial_path(id));
        existed
    }

    /// Delete unfinished jobs older than the TTL and files without a side-file.
    pub fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let cutoff = Utc::now() - self.ttl;

        let mut side_files = Vec::new();
        let mut others = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((id, ext)) = name.split_once('.') else {
                continue;
            };
            if ext == "json" {
                side_files.push(id.to_string());
            } else {
                others.push((id.to_string(), path.clone()));
            }
        }

        for id in side_files {
            let expired = match self.load(&id) {
                Ok(Some(job)) => !job.completed && job.created_at < cutoff,
                Ok(None) => false,
                Err(e) => {
                    tracing::warn!(job_id = %id, error = %e, "Removing unreadable chunk job");
                    true
                }
            };
            if expired {
                self.delete(&id);
                report.expired += 1;
            }
        }

        // Blobs of expired jobs are already gone; what is left without a side-file is orphaned
        for (id, path) in others {
            if path.exists() && !self.meta_path(&id).exists() {
                let _ = fs::remove_file(&path);
                report.orphans += 1;
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkMode, MIN_CHUNK_SIZE};
    use tempfile::TempDir;

    #[test]
    fn test_create_refuses_reused_id() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path(), 24).unwrap();
        let job = ChunkJob::new(JobStore::new_id(), ChunkMode::Upload, MIN_CHUNK_SIZE);

        store.create(&job, true).unwrap();
        assert!(matches!(store.create(&job, true), Err(TransferError::Write(_))));
    }

    #[test]
    fn test_offset_writes() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path(), 24).unwrap();
        let job = ChunkJob::new(JobStore::new_id(), ChunkMode::Upload, MIN_CHUNK_SIZE);
        store.create(&job, true).unwrap();

        store.write_at(&job.id, 4, b"5678").unwrap();
        store.write_at(&job.id, 0, b"1234").unwrap();
        assert_eq!(store.read_at(&job.id, 0, 8).unwrap(), b"12345678");
        assert_eq!(store.read_at(&job.id, 6, 100).unwrap(), b"78");
    }

    #[test]
    fn test_rejects_path_like_ids() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path(), 24).unwrap();
        assert!(matches!(store.load("../etc"), Err(TransferError::NotFound(_))));
        assert!(!store.delete("../etc"));
    }

    #[test]
    fn test_sweep_expired_and_orphans() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path(), 24).unwrap();

        let mut stale = ChunkJob::new(JobStore::new_id(), ChunkMode::Upload, MIN_CHUNK_SIZE);
        stale.created_at = Utc::now() - Duration::hours(25);
        store.create(&stale, true).unwrap();

        let mut finished = ChunkJob::new(JobStore::new_id(), ChunkMode::Upload, MIN_CHUNK_SIZE);
        finished.created_at = Utc::now() - Duration::hours(25);
        finished.completed = true;
        store.create(&finished, true).unwrap();

        let fresh = ChunkJob::new(JobStore::new_id(), ChunkMode::Upload, MIN_CHUNK_SIZE);
        store.create(&fresh, true).unwrap();

        fs::write(dir.path().join("deadbeef.bin"), b"orphan").unwrap();

        let report = store.sweep().unwrap();
        assert_eq!(report, SweepReport { expired: 1, orphans: 1 });
        assert!(!store.exists(&stale.id));
        assert!(!store.blob_path(&stale.id).exists());
        assert!(store.exists(&finished.id));
        assert!(store.exists(&fresh.id));
    }
}
