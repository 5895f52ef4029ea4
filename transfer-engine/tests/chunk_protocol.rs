use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use transfer_engine::archive::checksum::sha256_hex;
use transfer_engine::chunk::{
    ArchiveFileProducer, ChunkTransfer, DownloadProducer, JobStatus, JobStore, MIN_CHUNK_SIZE,
};
use transfer_engine::TransferError;

const CHUNK: usize = MIN_CHUNK_SIZE as usize;

fn transfer(dir: &TempDir) -> ChunkTransfer {
    ChunkTransfer::new(JobStore::open(&dir.path().join("chunks"), 24).unwrap(), MIN_CHUNK_SIZE)
}

/// Two full chunks plus a short tail.
fn sample() -> Vec<u8> {
    (0..CHUNK * 2 + 1000).map(|i| (i % 251) as u8).collect()
}

fn chunk_b64(bytes: &[u8], index: usize) -> String {
    let end = ((index + 1) * CHUNK).min(bytes.len());
    STANDARD.encode(&bytes[index * CHUNK..end])
}

#[test]
fn test_reordered_upload_reassembles() {
    let dir = TempDir::new().unwrap();
    let transfer = transfer(&dir);
    let bytes = sample();

    let init = transfer
        .init_upload(3, Some(sha256_hex(&bytes)), Some(MIN_CHUNK_SIZE))
        .unwrap();
    let progress = transfer.upload_chunk(&init.job_id, 2, &chunk_b64(&bytes, 2)).unwrap();
    assert_eq!(progress.next_index, 0);
    assert!(!progress.completed);
    let progress = transfer.upload_chunk(&init.job_id, 0, &chunk_b64(&bytes, 0)).unwrap();
    assert_eq!(progress.next_index, 1);
    let progress = transfer.upload_chunk(&init.job_id, 1, &chunk_b64(&bytes, 1)).unwrap();
    assert!(progress.completed);
    assert_eq!(progress.next_index, 3);

    let dest = dir.path().join("received.zip");
    transfer.take_upload(&init.job_id, &dest).unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), bytes);
}

#[test]
fn test_repeated_chunk_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let transfer = transfer(&dir);
    let bytes = sample();
    let init = transfer.init_upload(3, None, Some(MIN_CHUNK_SIZE)).unwrap();

    transfer.upload_chunk(&init.job_id, 0, &chunk_b64(&bytes, 0)).unwrap();
    transfer.upload_chunk(&init.job_id, 0, &chunk_b64(&bytes, 0)).unwrap();
    let job = transfer.status(&init.job_id).unwrap();
    assert_eq!(job.received_chunks, 1);

    transfer.upload_chunk(&init.job_id, 1, &chunk_b64(&bytes, 1)).unwrap();
    let done = transfer.upload_chunk(&init.job_id, 2, &chunk_b64(&bytes, 2)).unwrap();
    assert!(done.completed);
    let again = transfer.upload_chunk(&init.job_id, 2, &chunk_b64(&bytes, 2)).unwrap();
    assert!(again.completed);

    let job = transfer.status(&init.job_id).unwrap();
    assert_eq!(job.received_chunks, 3);
    assert_eq!(job.size, bytes.len() as u64);
    assert_eq!(job.status, JobStatus::Ready);
}

#[test]
fn test_out_of_range_chunk_is_rejected() {
    let dir = TempDir::new().unwrap();
    let transfer = transfer(&dir);
    let init = transfer.init_upload(2, None, None).unwrap();

    let err = transfer.upload_chunk(&init.job_id, 2, &STANDARD.encode(b"x")).unwrap_err();
    assert!(matches!(err, TransferError::Chunk(_)));
    assert!(err.is_retryable());
    let err = transfer.upload_chunk(&init.job_id, 0, "***").unwrap_err();
    assert!(matches!(err, TransferError::InvalidChunk(_)));
}

async fn wait_ready(transfer: &ChunkTransfer, id: &str) -> transfer_engine::chunk::ChunkJob {
    for _ in 0..200 {
        let job = transfer.status(id).unwrap();
        if job.status != JobStatus::Processing {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("download job {} never left processing", id);
}

#[tokio::test]
async fn test_download_streams_archive_and_cleans_up() {
    let dir = TempDir::new().unwrap();
    let transfer = transfer(&dir);
    let bytes = sample();
    let source = dir.path().join("site.zip");
    std::fs::write(&source, &bytes).unwrap();

    let job = transfer
        .init_download(Box::new(ArchiveFileProducer { source }), Some(MIN_CHUNK_SIZE))
        .unwrap();
    assert_eq!(job.status, JobStatus::Processing);

    let ready = wait_ready(&transfer, &job.id).await;
    assert_eq!(ready.status, JobStatus::Ready);
    assert_eq!(ready.total_chunks, Some(3));
    assert_eq!(ready.checksum.as_deref(), Some(sha256_hex(&bytes).as_str()));

    let mut received = Vec::new();
    for index in 0..3 {
        let chunk = transfer.download_chunk(&job.id, index).unwrap();
        assert_eq!(chunk.completed, index == 2);
        received.extend(STANDARD.decode(chunk.chunk).unwrap());
    }
    assert_eq!(received, bytes);

    // The job is gone after its last chunk
    assert!(matches!(
        transfer.download_chunk(&job.id, 0),
        Err(TransferError::Cancelled(_))
    ));
    assert!(!transfer.store().blob_path(&job.id).exists());
}

/// Writes slowly until cancelled.
struct SlowProducer;

impl DownloadProducer for SlowProducer {
    fn describe(&self) -> String {
        "slow".into()
    }

    fn produce(&self, dest: &Path, cancelled: &dyn Fn() -> bool) -> transfer_engine::Result<()> {
        std::fs::write(dest, b"partial")?;
        for _ in 0..500 {
            if cancelled() {
                return Err(TransferError::Cancelled("job cancelled".into()));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_cancel_stops_producer_and_removes_files() {
    let dir = TempDir::new().unwrap();
    let transfer = transfer(&dir);

    let job = transfer.init_download(Box::new(SlowProducer), None).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(transfer.cancel(&job.id).unwrap());
    assert!(matches!(
        transfer.download_chunk(&job.id, 0),
        Err(TransferError::Cancelled(_))
    ));

    let partial = transfer.store().partial_path(&job.id);
    for _ in 0..100 {
        if !partial.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!partial.exists());
    assert!(!transfer.store().meta_path(&job.id).exists());
    assert!(!transfer.cancel(&job.id).unwrap());
}
