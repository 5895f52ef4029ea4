//! Download sources: an existing archive, or a fresh full-site export.

use super::transfer::DownloadProducer;
use crate::archive::backend::CancellableReader;
use crate::archive::site_bundle::build_site_archive_from_dump;
use crate::archive::{ArchiveType, Packer};
use crate::database;
use crate::recovery::JobLock;
use crate::site::{Component, Site};
use crate::{Result, TransferError};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Serves a file that already exists in the archives directory.
pub struct ArchiveFileProducer {
    pub source: PathBuf,
}

impl DownloadProducer for ArchiveFileProducer {
    fn describe(&self) -> String {
        format!("archive {}", self.source.display())
    }

    fn produce(&self, dest: &Path, cancelled: &dyn Fn() -> bool) -> Result<()> {
        let source = File::open(&self.source)
            .map_err(|e| TransferError::NotFound(format!("{}: {}", self.source.display(), e)))?;
        let mut reader = CancellableReader::new(source, cancelled);
        let mut out = BufWriter::new(File::create(dest)?);
        if let Err(e) = std::io::copy(&mut reader, &mut out) {
            if cancelled() {
                return Err(TransferError::Cancelled("job cancelled".into()));
            }
            return Err(e.into());
        }
        out.flush()?;
        Ok(())
    }
}

/// Exports the whole site into a full-site container. The job lock is held
/// while the database is dumped.
pub struct FullSiteProducer {
    pub site: Site,
    pub packer: Packer,
    pub lock: Arc<JobLock>,
}

impl DownloadProducer for FullSiteProducer {
    fn describe(&self) -> String {
        "full-site export".to_string()
    }

    fn produce(&self, dest: &Path, cancelled: &dyn Fn() -> bool) -> Result<()> {
        let lock_id = self.lock.acquire("download", None, None)?;
        let dump = database::export(self.site.store.as_ref(), &self.site.info);
        self.lock.release(&lock_id)?;
        let dump = dump?;

        if cancelled() {
            return Err(TransferError::Cancelled("job cancelled".into()));
        }

        let label = format!("Full site {}", chrono::Utc::now().format("%Y-%m-%d %H:%M"));
        build_site_archive_from_dump(
            &self.site,
            &self.packer,
            dest,
            ArchiveType::FullSite,
            &label,
            &dump,
            &Component::ALL,
            cancelled,
        )?;
        Ok(())
    }
}
