//! Everything a transfer operation needs, opened once per process.

use crate::archive::{BackendKind, Packer};
use crate::chunk::{ChunkTransfer, JobStore};
use crate::config::{Config, StorageLayout};
use crate::recovery::{JobLock, SnapshotManager};
use crate::site::Site;
use crate::Result;
use std::sync::Arc;

pub struct TransferContext {
    pub config: Config,
    pub layout: StorageLayout,
    pub site: Site,
    pub packer: Packer,
    pub lock: Arc<JobLock>,
    pub snapshots: SnapshotManager,
    pub chunks: ChunkTransfer,
}

impl TransferContext {
    /// Open the SQLite-backed site described by `config`.
    pub fn open(config: Config) -> Result<Arc<Self>> {
        let site = Site::sqlite(&config)?;
        Self::with_site(config, site)
    }

    /// Build a context around an already opened site.
    pub fn with_site(config: Config, site: Site) -> Result<Arc<Self>> {
        let layout = config.layout();
        layout.ensure()?;

        let kind = BackendKind::resolve(config.archive.backend, &layout.scratch_root());
        let packer = Packer::new(&layout.archives_dir(), kind);
        let lock = Arc::new(JobLock::new(&layout.lock_path(), config.lock.ttl_secs));
        let snapshots = SnapshotManager::new(
            &layout.snapshots_dir(),
            config.snapshots.retention,
            site.clone(),
            packer.clone(),
        );
        let chunks = ChunkTransfer::new(
            JobStore::open(&layout.chunks_dir(), config.chunks.ttl_hours)?,
            config.chunks.chunk_size,
        );

        tracing::info!(
            data_dir = %layout.data_dir.display(),
            backend = kind.extension(),
            "Transfer context ready"
        );

        Ok(Arc::new(Self {
            config,
            layout,
            site,
            packer,
            lock,
            snapshots,
            chunks,
        }))
    }

    /// Sweep expired chunk jobs and abandoned scratch directories.
    pub fn sweep(&self) -> Result<SweepSummary> {
        let chunks = self.chunks.sweep()?;

        let cutoff = std::time::SystemTime::now()
            - std::time::Duration::from_secs(self.config.chunks.ttl_hours.max(1) as u64 * 3600);
        let mut scratch_dirs = 0;
        if let Ok(entries) = std::fs::read_dir(self.layout.scratch_root()) {
            for entry in entries.flatten() {
                let path = entry.path();
                let stale = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .map(|modified| modified < cutoff)
                    .unwrap_or(false);
                if path.is_dir() && stale && std::fs::remove_dir_all(&path).is_ok() {
                    scratch_dirs += 1;
                }
            }
        }

        let summary = SweepSummary {
            expired_jobs: chunks.expired,
            orphan_files: chunks.orphans,
            scratch_dirs,
        };
        tracing::info!(
            expired_jobs = summary.expired_jobs,
            orphan_files = summary.orphan_files,
            scratch_dirs = summary.scratch_dirs,
            "Sweep finished"
        );
        Ok(summary)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SweepSummary {
    pub expired_jobs: usize,
    pub orphan_files: usize,
    pub scratch_dirs: usize,
}
