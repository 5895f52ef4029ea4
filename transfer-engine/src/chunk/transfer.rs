//! Chunk transfer protocol over a [`JobStore`].
//!
//! Uploads are written by absolute offset, so chunks may arrive out of order
//! or be retried. Downloads are produced by a background worker; the client
//! polls [`ChunkTransfer::status`] until the job is ready and then pulls
//! chunks by index.

use super::store::{JobStore, SweepReport};
use super::{
    clamp_chunk_size, ChunkJob, ChunkMode, DownloadChunk, JobStatus, UploadInit, UploadProgress,
};
use crate::archive::checksum::{digests_match, sha256_file};
use crate::{Result, TransferError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Produces the blob of a download job.
pub trait DownloadProducer: Send + 'static {
    fn describe(&self) -> String;
    /// Write the blob to `dest` (which does not exist yet). Must poll
    /// `cancelled` regularly and stop early when it returns true.
    fn produce(&self, dest: &Path, cancelled: &dyn Fn() -> bool) -> Result<()>;
}

pub struct ChunkTransfer {
    store: Arc<JobStore>,
    default_chunk_size: u64,
    tokens: Arc<DashMap<String, CancellationToken>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ChunkTransfer {
    pub fn new(store: JobStore, default_chunk_size: u64) -> Self {
        Self {
            store: Arc::new(store),
            default_chunk_size,
            tokens: Arc::new(DashMap::new()),
            locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Per-job mutex; only jobs present in the store get one.
    fn job_lock(&self, id: &str) -> Result<Arc<Mutex<()>>> {
        if !self.store.exists(id) {
            return Err(TransferError::NotFound(format!("chunk job '{}'", id)));
        }
        Ok(self
            .locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    fn forget(&self, id: &str) {
        self.locks.remove(id);
        self.tokens.remove(id);
    }

    fn load(&self, id: &str) -> Result<ChunkJob> {
        self.store
            .load(id)?
            .ok_or_else(|| TransferError::NotFound(format!("chunk job '{}'", id)))
    }

    pub fn init_upload(
        &self,
        total_chunks: u64,
        checksum: Option<String>,
        chunk_size: Option<u64>,
    ) -> Result<UploadInit> {
        if total_chunks == 0 {
            return Err(TransferError::Chunk("total_chunks must be at least 1".into()));
        }
        let checksum = checksum.filter(|c| !c.trim().is_empty());
        if let Some(checksum) = &checksum {
            if checksum.len() != 64 || hex::decode(checksum).is_err() {
                return Err(TransferError::Chunk(format!("invalid checksum '{}'", checksum)));
            }
        }

        let chunk_size = clamp_chunk_size(chunk_size, self.default_chunk_size);
        let mut job = ChunkJob::new(JobStore::new_id(), ChunkMode::Upload, chunk_size);
        job.total_chunks = Some(total_chunks);
        job.checksum = checksum;
        self.store.create(&job, true)?;

        tracing::info!(job_id = %job.id, total_chunks, chunk_size, "Upload job created");
        Ok(UploadInit {
            job_id: job.id,
            chunk_size,
        })
    }

    pub fn upload_chunk(&self, id: &str, index: u64, data: &str) -> Result<UploadProgress> {
        let lock = self.job_lock(id)?;
        let _guard = lock
            .lock()
            .map_err(|_| TransferError::Internal("chunk job mutex poisoned".into()))?;

        let mut job = self.load(id)?;
        if job.mode != ChunkMode::Upload {
            return Err(TransferError::Chunk(format!("job {} is not an upload", id)));
        }
        if job.status == JobStatus::Error {
            return Err(TransferError::Chunk(
                job.error.unwrap_or_else(|| format!("job {} failed", id)),
            ));
        }
        let total = job.total_chunks.unwrap_or(0);
        if index >= total {
            return Err(TransferError::Chunk(format!(
                "chunk index {} out of range (total {})",
                index, total
            )));
        }

        let bytes = STANDARD
            .decode(data.trim())
            .map_err(|e| TransferError::InvalidChunk(e.to_string()))?;
        if bytes.is_empty() {
            return Err(TransferError::InvalidChunk("empty chunk".into()));
        }
        let len = bytes.len() as u64;
        if len > job.chunk_size {
            return Err(TransferError::Chunk(format!(
                "chunk {} is {} bytes, limit is {}",
                index, len, job.chunk_size
            )));
        }
        let is_last = index == total - 1;
        if !is_last && len != job.chunk_size {
            return Err(TransferError::Chunk(format!(
                "chunk {} is {} bytes, expected {}",
                index, len, job.chunk_size
            )));
        }

        self.store.write_at(id, index * job.chunk_size, &bytes)?;
        if is_last {
            job.size = index * job.chunk_size + len;
        }
        job.received.insert(index);
        job.received_chunks = job.received.len() as u64;

        if job.received_chunks == total && !job.completed {
            self.finish_upload(&mut job)?;
        }
        self.store.save(&job)?;

        if job.status == JobStatus::Error {
            return Err(TransferError::Integrity(
                job.error.clone().unwrap_or_default(),
            ));
        }

        tracing::debug!(job_id = %id, index, received = job.received_chunks, total, "Chunk stored");
        Ok(UploadProgress {
            next_index: job.next_index(),
            completed: job.completed,
        })
    }

    fn finish_upload(&self, job: &mut ChunkJob) -> Result<()> {
        self.store.truncate(&job.id, job.size)?;
        job.completed = true;

        if let Some(expected) = &job.checksum {
            let actual = sha256_file(&self.store.blob_path(&job.id))?;
            if !digests_match(expected, &actual) {
                tracing::warn!(job_id = %job.id, expected = %expected, actual = %actual, "Upload checksum mismatch");
                job.status = JobStatus::Error;
                job.error = Some(format!(
                    "checksum mismatch (expected {}, got {})",
                    expected, actual
                ));
                return Ok(());
            }
        }

        job.status = JobStatus::Ready;
        tracing::info!(job_id = %job.id, size = job.size, "Upload completed");
        Ok(())
    }

    /// Move a completed upload to `dest` and delete the job.
    pub fn take_upload(&self, id: &str, dest: &Path) -> Result<PathBuf> {
        let lock = self.job_lock(id)?;
        let _guard = lock
            .lock()
            .map_err(|_| TransferError::Internal("chunk job mutex poisoned".into()))?;

        let job = self.load(id)?;
        if job.mode != ChunkMode::Upload || !job.completed || job.status != JobStatus::Ready {
            return Err(TransferError::Chunk(format!("upload {} is not complete", id)));
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let blob = self.store.blob_path(id);
        if std::fs::rename(&blob, dest).is_err() {
            // Different filesystem
            std::fs::copy(&blob, dest)?;
        }
        self.store.delete(id);
        drop(_guard);
        self.forget(id);

        tracing::info!(job_id = %id, dest = %dest.display(), "Upload taken");
        Ok(dest.to_path_buf())
    }

    /// Create a download job and start producing its blob in the background.
    pub fn init_download(
        &self,
        producer: Box<dyn DownloadProducer>,
        chunk_size: Option<u64>,
    ) -> Result<ChunkJob> {
        let chunk_size = clamp_chunk_size(chunk_size, self.default_chunk_size);
        let job = ChunkJob::new(JobStore::new_id(), ChunkMode::Download, chunk_size);
        self.store.create(&job, false)?;

        let token = CancellationToken::new();
        self.tokens.insert(job.id.clone(), token.clone());

        tracing::info!(job_id = %job.id, source = %producer.describe(), "Download job created");

        let store = self.store.clone();
        let tokens = self.tokens.clone();
        let id = job.id.clone();
        let worker = move || {
            run_download(&store, &id, &token, producer.as_ref());
            tokens.remove(&id);
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(worker);
            }
            Err(_) => {
                std::thread::spawn(worker);
            }
        }

        Ok(job)
    }

    pub fn download_chunk(&self, id: &str, index: u64) -> Result<DownloadChunk> {
        let job = self
            .store
            .load(id)?
            .ok_or_else(|| TransferError::Cancelled("job cancelled".into()))?;
        if job.mode != ChunkMode::Download {
            return Err(TransferError::Chunk(format!("job {} is not a download", id)));
        }
        match job.status {
            JobStatus::Ready => {}
            JobStatus::Processing => {
                return Err(TransferError::Chunk(format!("job {} is not ready yet", id)))
            }
            JobStatus::Error => {
                return Err(TransferError::Chunk(
                    job.error.unwrap_or_else(|| format!("job {} failed", id)),
                ))
            }
        }

        let total = job.total_chunks.unwrap_or(0);
        if index >= total {
            return Err(TransferError::Chunk(format!(
                "chunk index {} out of range (total {})",
                index, total
            )));
        }

        let offset = index * job.chunk_size;
        let len = job.chunk_size.min(job.size.saturating_sub(offset));
        let bytes = self.store.read_at(id, offset, len)?;
        let completed = index == total - 1;

        if completed {
            self.store.delete(id);
            self.forget(id);
            tracing::info!(job_id = %id, size = job.size, "Download completed");
        }

        Ok(DownloadChunk {
            chunk: STANDARD.encode(bytes),
            completed,
        })
    }

    /// Cancel a job of either mode. Returns whether a job was deleted.
    pub fn cancel(&self, id: &str) -> Result<bool> {
        if !JobStore::is_valid_id(id) {
            return Err(TransferError::NotFound(format!("chunk job '{}'", id)));
        }
        if let Some(token) = self.tokens.get(id) {
            token.cancel();
        }
        let deleted = self.store.delete(id);
        self.forget(id);
        if deleted {
            tracing::info!(job_id = %id, "Chunk job cancelled");
        }
        Ok(deleted)
    }

    pub fn status(&self, id: &str) -> Result<ChunkJob> {
        self.load(id)
    }

    pub fn sweep(&self) -> Result<SweepReport> {
        let report = self.store.sweep()?;
        self.locks.retain(|id, _| self.store.exists(id));
        Ok(report)
    }
}

fn run_download(store: &JobStore, id: &str, token: &CancellationToken, producer: &dyn DownloadProducer) {
    let partial = store.partial_path(id);
    let cancelled = || token.is_cancelled() || !store.exists(id);

    let result = producer.produce(&partial, &cancelled).and_then(|_| {
        if cancelled() {
            return Err(TransferError::Cancelled("job cancelled".into()));
        }
        std::fs::rename(&partial, store.blob_path(id))?;
        let size = std::fs::metadata(store.blob_path(id))?.len();
        let checksum = sha256_file(&store.blob_path(id))?;
        Ok((size, checksum))
    });

    if cancelled() {
        tracing::info!(job_id = %id, "Download cancelled, removing partial output");
        store.delete(id);
        return;
    }

    let Ok(Some(mut job)) = store.load(id) else {
        store.delete(id);
        return;
    };

    match result {
        Ok((size, checksum)) => {
            job.size = size;
            job.checksum = Some(checksum);
            job.total_chunks = Some(size.div_ceil(job.chunk_size).max(1));
            job.status = JobStatus::Ready;
            tracing::info!(job_id = %id, size, total_chunks = ?job.total_chunks, "Download ready");
        }
        Err(e) => {
            let _ = std::fs::remove_file(&partial);
            tracing::error!(job_id = %id, error = %e, "Download export failed");
            job.status = JobStatus::Error;
            job.error = Some(e.to_string());
        }
    }

    match store.save_if_exists(&job) {
        Ok(true) => {}
        // Cancelled between the check above and the save
        Ok(false) => {
            store.delete(id);
        }
        Err(e) => tracing::error!(job_id = %id, error = %e, "Failed to record download result"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::checksum::sha256_hex;
    use crate::chunk::MIN_CHUNK_SIZE;
    use tempfile::TempDir;

    fn transfer(dir: &TempDir) -> ChunkTransfer {
        ChunkTransfer::new(JobStore::open(dir.path(), 24).unwrap(), MIN_CHUNK_SIZE)
    }

    #[test]
    fn test_init_upload_rejects_zero_chunks() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            transfer(&dir).init_upload(0, None, None),
            Err(TransferError::Chunk(_))
        ));
    }

    #[test]
    fn test_unknown_jobs_leave_no_mutex_behind() {
        let dir = TempDir::new().unwrap();
        let transfer = transfer(&dir);
        for _ in 0..50 {
            let id = JobStore::new_id();
            assert!(matches!(
                transfer.upload_chunk(&id, 0, "aGVsbG8="),
                Err(TransferError::NotFound(_))
            ));
        }
        assert!(transfer.locks.is_empty());

        // A job removed behind our back is pruned on the next sweep
        let init = transfer.init_upload(2, None, Some(MIN_CHUNK_SIZE)).unwrap();
        let _ = transfer.upload_chunk(&init.job_id, 0, &STANDARD.encode(b"short"));
        assert_eq!(transfer.locks.len(), 1);
        transfer.store().delete(&init.job_id);
        transfer.sweep().unwrap();
        assert!(transfer.locks.is_empty());
    }

    #[test]
    fn test_upload_rejects_bad_chunks() {
        let dir = TempDir::new().unwrap();
        let transfer = transfer(&dir);
        let init = transfer.init_upload(2, None, Some(MIN_CHUNK_SIZE)).unwrap();

        assert!(matches!(
            transfer.upload_chunk(&init.job_id, 0, "***not base64***"),
            Err(TransferError::InvalidChunk(_))
        ));
        assert!(matches!(
            transfer.upload_chunk(&init.job_id, 2, &STANDARD.encode(b"x")),
            Err(TransferError::Chunk(_))
        ));
        let oversized = STANDARD.encode(vec![0u8; MIN_CHUNK_SIZE as usize + 1]);
        assert!(matches!(
            transfer.upload_chunk(&init.job_id, 1, &oversized),
            Err(TransferError::Chunk(_))
        ));
    }

    #[test]
    fn test_upload_checksum_mismatch_marks_error() {
        let dir = TempDir::new().unwrap();
        let transfer = transfer(&dir);
        let init = transfer
            .init_upload(1, Some(sha256_hex(b"expected")), None)
            .unwrap();

        let err = transfer
            .upload_chunk(&init.job_id, 0, &STANDARD.encode(b"something else"))
            .unwrap_err();
        assert!(matches!(err, TransferError::Integrity(_)));
        assert_eq!(transfer.status(&init.job_id).unwrap().status, JobStatus::Error);
    }

    #[test]
    fn test_take_upload_moves_blob() {
        let dir = TempDir::new().unwrap();
        let transfer = transfer(&dir);
        let init = transfer.init_upload(1, Some(sha256_hex(b"archive")), None).unwrap();
        let progress = transfer
            .upload_chunk(&init.job_id, 0, &STANDARD.encode(b"archive"))
            .unwrap();
        assert!(progress.completed);
        assert_eq!(progress.next_index, 1);

        let dest = dir.path().join("archives/upload.zip");
        transfer.take_upload(&init.job_id, &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"archive");
        assert!(matches!(transfer.status(&init.job_id), Err(TransferError::NotFound(_))));
    }

    #[test]
    fn test_download_chunk_of_missing_job_is_cancelled() {
        let dir = TempDir::new().unwrap();
        let err = transfer(&dir).download_chunk("abc123", 0).unwrap_err();
        assert!(matches!(err, TransferError::Cancelled(ref m) if m == "job cancelled"));
    }
}
