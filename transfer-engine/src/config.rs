//! Configuration management for the transfer engine.
//!
//! Loads configuration from a TOML file; every section falls back to defaults
//! so a partial file is enough.

use crate::archive::backend::BackendPreference;
use crate::site::SitePaths;
use crate::{Result, TransferError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunks: ChunkConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub snapshots: SnapshotConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Site document root
    #[serde(default = "default_site_root")]
    pub root: PathBuf,

    /// Content directory; uploads/plugins/themes default to children of it
    #[serde(default)]
    pub content_dir: Option<PathBuf>,
    #[serde(default)]
    pub uploads_dir: Option<PathBuf>,
    #[serde(default)]
    pub plugins_dir: Option<PathBuf>,
    #[serde(default)]
    pub mu_plugins_dir: Option<PathBuf>,
    #[serde(default)]
    pub themes_dir: Option<PathBuf>,

    /// SQLite database holding the site tables
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,

    #[serde(default = "default_site_url")]
    pub site_url: String,

    #[serde(default)]
    pub home_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Working directory: scratch dirs, archives, chunk jobs, snapshots, lock file
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Default chunk size in bytes (clamped to 256 KiB – 5 MiB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Unfinished jobs older than this are purged
    #[serde(default = "default_chunk_ttl_hours")]
    pub ttl_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_ttl_secs")]
    pub ttl_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Number of snapshots kept; oldest are pruned first
    #[serde(default = "default_retention")]
    pub retention: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub backend: BackendPreference,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_site_root() -> PathBuf {
    PathBuf::from("/var/www/site")
}

fn default_table_prefix() -> String {
    "wp_".to_string()
}

fn default_site_url() -> String {
    "http://localhost".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/site-transfer")
}

fn default_chunk_size() -> u64 {
    1024 * 1024 // 1MB
}

fn default_chunk_ttl_hours() -> i64 {
    24
}

fn default_lock_ttl_secs() -> i64 {
    900
}

fn default_retention() -> usize {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            root: default_site_root(),
            content_dir: None,
            uploads_dir: None,
            plugins_dir: None,
            mu_plugins_dir: None,
            themes_dir: None,
            db_path: None,
            table_prefix: default_table_prefix(),
            site_url: default_site_url(),
            home_url: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            ttl_hours: default_chunk_ttl_hours(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_lock_ttl_secs(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            retention: default_retention(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            site: SiteConfig::default(),
            storage: StorageConfig::default(),
            chunks: ChunkConfig::default(),
            lock: LockConfig::default(),
            snapshots: SnapshotConfig::default(),
            archive: ArchiveConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| TransferError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Configuration for a site rooted at `site_root` with its working data in `data_dir`.
    pub fn for_site(site_root: &Path, data_dir: &Path) -> Self {
        let mut config = Config::default();
        config.site.root = site_root.to_path_buf();
        config.storage.data_dir = data_dir.to_path_buf();
        config
    }

    pub fn site_paths(&self) -> SitePaths {
        let root = self.site.root.clone();
        let content = self
            .site
            .content_dir
            .clone()
            .unwrap_or_else(|| root.join("content"));
        SitePaths {
            uploads: self
                .site
                .uploads_dir
                .clone()
                .unwrap_or_else(|| content.join("uploads")),
            plugins: self
                .site
                .plugins_dir
                .clone()
                .unwrap_or_else(|| content.join("plugins")),
            mu_plugins: self
                .site
                .mu_plugins_dir
                .clone()
                .unwrap_or_else(|| content.join("mu-plugins")),
            themes: self
                .site
                .themes_dir
                .clone()
                .unwrap_or_else(|| content.join("themes")),
            root,
            content,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.site
            .db_path
            .clone()
            .unwrap_or_else(|| self.storage.data_dir.join("site.db"))
    }

    pub fn home_url(&self) -> String {
        self.site
            .home_url
            .clone()
            .unwrap_or_else(|| self.site.site_url.clone())
    }

    pub fn layout(&self) -> StorageLayout {
        StorageLayout::new(&self.storage.data_dir)
    }
}

/// Directory layout under the data dir.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub data_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
        }
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.data_dir.join("storage")
    }

    /// Scratch directory of one pipeline run.
    pub fn scratch_dir(&self, storage: &str) -> PathBuf {
        self.scratch_root().join(storage)
    }

    pub fn archives_dir(&self) -> PathBuf {
        self.data_dir.join("archives")
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.data_dir.join("chunks")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    /// Checkpoints and status records of pipeline runs.
    pub fn pipelines_dir(&self) -> PathBuf {
        self.data_dir.join("pipelines")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join("transfer.lock")
    }

    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.scratch_root(),
            self.archives_dir(),
            self.chunks_dir(),
            self.snapshots_dir(),
            self.pipelines_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [site]
            root = "/srv/site"
            table_prefix = "site_"

            [chunks]
            chunk_size = 524288
            "#,
        )
        .unwrap();

        assert_eq!(config.site.table_prefix, "site_");
        assert_eq!(config.chunks.chunk_size, 524288);
        assert_eq!(config.chunks.ttl_hours, 24);
        assert_eq!(config.lock.ttl_secs, 900);
        assert_eq!(config.snapshots.retention, 5);
        assert_eq!(config.archive.backend, BackendPreference::Auto);
    }

    #[test]
    fn test_site_paths_derive_from_content_dir() {
        let mut config = Config::for_site(Path::new("/srv/site"), Path::new("/tmp/data"));
        config.site.content_dir = Some(PathBuf::from("/srv/site/wp-content"));

        let paths = config.site_paths();
        assert_eq!(paths.uploads, PathBuf::from("/srv/site/wp-content/uploads"));
        assert_eq!(paths.mu_plugins, PathBuf::from("/srv/site/wp-content/mu-plugins"));
        assert_eq!(config.db_path(), PathBuf::from("/tmp/data/site.db"));
    }
}
