//! Pre-import snapshots with count-based retention.

use super::lock::JobLock;
use super::restore::{restore_component, restore_database, DatabaseRestore};
use crate::archive::site_bundle::build_site_archive;
use crate::archive::{self, ArchiveType, Packer};
use crate::site::{Component, Site};
use crate::{Result, TransferError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub path: PathBuf,
    pub size: u64,
    pub includes: Vec<String>,
    #[serde(default)]
    pub meta: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestoreOutcome {
    pub snapshot_id: String,
    pub database: DatabaseRestore,
    pub files: usize,
}

pub struct SnapshotManager {
    dir: PathBuf,
    retention: usize,
    site: Site,
    packer: Packer,
}

impl SnapshotManager {
    pub fn new(dir: &Path, retention: usize, site: Site, packer: Packer) -> Self {
        Self {
            dir: dir.to_path_buf(),
            retention: retention.max(1),
            site,
            packer,
        }
    }

    fn is_valid_id(id: &str) -> bool {
        !id.is_empty() && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Snapshot the database and uploads, plus plugins/themes on request.
    /// Oldest snapshots beyond the retention count are deleted afterwards.
    pub fn create(&self, label: &str, include_plugins: bool, include_themes: bool) -> Result<Snapshot> {
        fs::create_dir_all(&self.dir)?;
        let now = Utc::now();
        let id = format!("{}-{}", now.format("%Y%m%dT%H%M%SZ"), uuid::Uuid::new_v4().simple());
        let path = self
            .dir
            .join(format!("{}.{}", id, self.packer.kind().extension()));

        let mut components = vec![Component::Uploads];
        if include_plugins {
            components.extend([Component::Plugins, Component::MuPlugins]);
        }
        if include_themes {
            components.push(Component::Themes);
        }

        let label = if label.trim().is_empty() {
            format!("Snapshot {}", now.format("%Y-%m-%d %H:%M"))
        } else {
            label.to_string()
        };
        let manifest = build_site_archive(
            &self.site,
            &self.packer,
            &path,
            ArchiveType::Snapshot,
            &label,
            &components,
            &|| false,
        )?;

        let snapshot = Snapshot {
            id: id.clone(),
            label,
            created_at: now,
            size: fs::metadata(&path)?.len(),
            path,
            includes: components.iter().map(|c| c.as_str().to_string()).collect(),
            meta: json!({
                "format_version": manifest.format_version,
                "backend": self.packer.kind(),
                "checksum": manifest.checksum,
                "site_url": self.site.info.site_url,
            }),
        };
        fs::write(self.record_path(&id), serde_json::to_vec_pretty(&snapshot)?)?;
        tracing::info!(snapshot_id = %id, size = snapshot.size, "Snapshot created");

        let pruned = self.prune()?;
        if pruned > 0 {
            tracing::info!(pruned, retention = self.retention, "Pruned old snapshots");
        }
        Ok(snapshot)
    }

    /// All snapshots, newest first.
    pub fn all(&self) -> Result<Vec<Snapshot>> {
        let mut snapshots = Vec::new();
        if !self.dir.exists() {
            return Ok(snapshots);
        }

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path).map(|b| serde_json::from_slice::<Snapshot>(&b)) {
                Ok(Ok(snapshot)) => snapshots.push(snapshot),
                Ok(Err(e)) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable snapshot record"),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable snapshot record"),
            }
        }

        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(snapshots)
    }

    pub fn get(&self, id: &str) -> Result<Option<Snapshot>> {
        if !Self::is_valid_id(id) {
            return Ok(None);
        }
        match fs::read(self.record_path(id)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let Some(snapshot) = self.get(id)? else {
            return Ok(false);
        };
        if snapshot.path.starts_with(&self.dir) {
            let _ = fs::remove_file(&snapshot.path);
        }
        fs::remove_file(self.record_path(id))?;
        tracing::info!(snapshot_id = %id, "Snapshot deleted");
        Ok(true)
    }

    fn prune(&self) -> Result<usize> {
        let mut pruned = 0;
        for snapshot in self.all()?.into_iter().skip(self.retention) {
            if self.delete(&snapshot.id)? {
                pruned += 1;
            }
        }
        Ok(pruned)
    }

    /// Put the site back to the state captured by snapshot `id`, under the job lock.
    pub fn restore(&self, id: &str, lock: &JobLock) -> Result<RestoreOutcome> {
        let snapshot = self
            .get(id)?
            .ok_or_else(|| TransferError::NotFound(format!("snapshot '{}'", id)))?;

        let lock_id = lock.acquire("restore", None, None)?;
        let result = self.restore_locked(&snapshot);
        lock.release(&lock_id)?;
        result
    }

    fn restore_locked(&self, snapshot: &Snapshot) -> Result<RestoreOutcome> {
        let extracted = archive::extract(&snapshot.path)?;
        let database = restore_database(&self.site, &snapshot.path, &extracted.payload)?;

        let mut files = 0;
        for component in extracted.manifest.includes.iter().filter_map(|c| Component::parse(c)) {
            files += restore_component(&self.site, &snapshot.path, component)?;
        }

        tracing::info!(snapshot_id = %snapshot.id, files, "Snapshot restored");
        Ok(RestoreOutcome {
            snapshot_id: snapshot.id.clone(),
            database,
            files,
        })
    }
}
