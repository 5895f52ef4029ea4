//! Process-wide migration lock, persisted as a file in the data directory.
//!
//! At most one unexpired lock exists. Every read-check-write sequence runs
//! under an exclusive advisory lock on a `.guard` sibling file, so processes
//! sharing a data directory see each other's changes in order. Records are
//! written to a temp file and renamed into place; a half-written lock file is
//! never visible.

use crate::{Result, TransferError};
use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const DEFAULT_LOCK_TTL_SECS: i64 = 900;
pub const MIN_LOCK_TTL_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub id: String,
    pub context: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub user_id: Option<i64>,
}

impl LockRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

pub struct JobLock {
    path: PathBuf,
    default_ttl_secs: i64,
}

impl JobLock {
    pub fn new(path: &Path, default_ttl_secs: i64) -> Self {
        Self {
            path: path.to_path_buf(),
            default_ttl_secs: default_ttl_secs.max(MIN_LOCK_TTL_SECS),
        }
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Exclusive advisory lock, released when the returned file is dropped.
    fn guard(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.sibling(".guard"))?;
        file.lock_exclusive()
            .map_err(|e| TransferError::Internal(format!("job lock guard: {}", e)))?;
        Ok(file)
    }

    fn ttl(&self, ttl_secs: Option<i64>) -> Duration {
        Duration::seconds(ttl_secs.unwrap_or(self.default_ttl_secs).max(MIN_LOCK_TTL_SECS))
    }

    /// An unreadable lock file counts as held by an unknown job until the
    /// default TTL has passed since it was last modified.
    fn read(&self) -> Result<Option<LockRecord>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Unreadable lock file, treating it as held");
                let modified = fs::metadata(&self.path)
                    .and_then(|m| m.modified())
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                Ok(Some(LockRecord {
                    id: String::new(),
                    context: "unknown job".to_string(),
                    created_at: modified,
                    expires_at: modified + self.ttl(None),
                    user_id: None,
                }))
            }
        }
    }

    fn write(&self, record: &LockRecord) -> Result<()> {
        let tmp = self.sibling(&format!(".{}.tmp", record.id));
        let mut file = File::create(&tmp)?;
        file.write_all(&serde_json::to_vec_pretty(record)?)?;
        file.sync_all()?;
        drop(file);
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    /// Acquire the lock for `context`. Fails with [`TransferError::Conflict`]
    /// naming the busy context while another unexpired lock exists.
    pub fn acquire(&self, context: &str, ttl_secs: Option<i64>, user_id: Option<i64>) -> Result<String> {
        self.acquire_at(context, ttl_secs, user_id, Utc::now())
    }

    fn acquire_at(
        &self,
        context: &str,
        ttl_secs: Option<i64>,
        user_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let _guard = self.guard()?;

        if let Some(existing) = self.read()? {
            if !existing.is_expired_at(now) {
                return Err(TransferError::Conflict(format!(
                    "{} is running (expires {})",
                    existing.context,
                    existing.expires_at.to_rfc3339()
                )));
            }
            tracing::info!(context = %existing.context, lock_id = %existing.id, "Replacing expired job lock");
        }

        let record = LockRecord {
            id: uuid::Uuid::new_v4().to_string(),
            context: context.to_string(),
            created_at: now,
            expires_at: now + self.ttl(ttl_secs),
            user_id,
        };
        self.write(&record)?;

        tracing::info!(context, lock_id = %record.id, "Job lock acquired");
        Ok(record.id)
    }

    /// Release the lock if `lock_id` holds it. Returns whether it was released.
    pub fn release(&self, lock_id: &str) -> Result<bool> {
        let _guard = self.guard()?;
        match self.read()? {
            Some(record) if !record.id.is_empty() && record.id == lock_id => {
                fs::remove_file(&self.path)?;
                tracing::info!(context = %record.context, lock_id, "Job lock released");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// The live lock, if any.
    pub fn current(&self) -> Result<Option<LockRecord>> {
        let _guard = self.guard()?;
        let now = Utc::now();
        Ok(self.read()?.filter(|r| !r.is_expired_at(now)))
    }

    pub fn is_held(&self, lock_id: &str) -> Result<bool> {
        Ok(self.current()?.is_some_and(|r| r.id == lock_id))
    }

    /// Push the expiry of a held lock forward. Returns false if `lock_id`
    /// does not hold the lock (anymore).
    pub fn refresh(&self, lock_id: &str, ttl_secs: Option<i64>) -> Result<bool> {
        let _guard = self.guard()?;
        let now = Utc::now();
        let Some(mut record) = self.read()? else {
            return Ok(false);
        };
        if record.id.is_empty() || record.id != lock_id || record.is_expired_at(now) {
            return Ok(false);
        }

        record.expires_at = now + self.ttl(ttl_secs);
        self.write(&record)?;
        Ok(true)
    }
}
