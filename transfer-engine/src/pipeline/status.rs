//! Checkpoints and status records of pipeline runs.
//!
//! Each run owns `<pipelines>/<storage>/` holding `params.json` (the
//! checkpoint a resume starts from) and `status.json` (what pollers see).
//! Both outlive the scratch directory so terminal states stay visible.

use super::params::PipelineParams;
use crate::{Result, TransferError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineKind {
    Export,
    Import,
}

impl PipelineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineKind::Export => "export",
            PipelineKind::Import => "import",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Confirm,
    Done,
    Error,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::Confirm => "confirm",
            RunState::Done => "done",
            RunState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub storage: String,
    pub kind: PipelineKind,
    pub priority: i64,
    pub state: RunState,
    pub title: String,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

pub struct RunStore {
    dir: PathBuf,
}

impl RunStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn is_valid_storage(storage: &str) -> bool {
        !storage.is_empty()
            && storage.len() <= 64
            && storage.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    }

    fn run_dir(&self, storage: &str) -> Result<PathBuf> {
        if !Self::is_valid_storage(storage) {
            return Err(TransferError::NotFound(format!("pipeline '{}'", storage)));
        }
        Ok(self.dir.join(storage))
    }

    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn save_params(&self, storage: &str, params: &PipelineParams) -> Result<()> {
        let path = self.run_dir(storage)?.join("params.json");
        Self::write_atomic(&path, &serde_json::to_vec_pretty(params)?)
    }

    pub fn load_params(&self, storage: &str) -> Result<PipelineParams> {
        let path = self.run_dir(storage)?.join("params.json");
        match fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(TransferError::NotFound(format!("pipeline '{}'", storage)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_status(&self, status: &PipelineStatus) -> Result<()> {
        let path = self.run_dir(&status.storage)?.join("status.json");
        Self::write_atomic(&path, &serde_json::to_vec_pretty(status)?)
    }

    pub fn read_status(&self, storage: &str) -> Result<Option<PipelineStatus>> {
        let path = self.run_dir(storage)?.join("status.json");
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_checkpoint_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let runs = RunStore::new(dir.path());
        let mut params = PipelineParams::new();
        params.set_priority(40);
        params.set("storage", "abc123");

        runs.save_params("abc123", &params).unwrap();
        assert_eq!(runs.load_params("abc123").unwrap(), params);
        assert!(matches!(runs.load_params("other"), Err(TransferError::NotFound(_))));
        assert!(matches!(runs.load_params("../x"), Err(TransferError::NotFound(_))));
    }
}
