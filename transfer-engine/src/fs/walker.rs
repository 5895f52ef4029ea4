//! Directory traversal for site components.
//!
//! Collects the files of one component (uploads, plugins, themes, ...) with
//! archive-ready relative paths. Nested component directories can be pruned
//! so the content walk does not pick up uploads or plugins twice.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Name fragments that exclude an entry (and its subtree)
    pub exclude_patterns: Vec<String>,

    /// Absolute directories whose subtrees are skipped entirely
    pub prune_dirs: Vec<PathBuf>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            follow_links: false,
            exclude_patterns: vec![
                ".git".to_string(),
                "node_modules".to_string(),
                ".DS_Store".to_string(),
            ],
            prune_dirs: Vec::new(),
        }
    }
}

/// A file discovered during walking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteFile {
    /// Full path to the file
    pub path: PathBuf,

    /// Path relative to the walk root, always `/`-separated
    pub relative: String,

    /// File size in bytes
    pub size: u64,
}

impl SiteFile {
    /// Build from a DirEntry. Symlinks resolve to their target; links to
    /// directories and broken links yield None.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let path = entry.path().to_path_buf();
        let metadata = if entry.path_is_symlink() {
            match std::fs::metadata(&path) {
                Ok(resolved) if resolved.is_file() => resolved,
                _ => return Ok(None),
            }
        } else {
            entry.metadata()?
        };

        if !metadata.is_file() {
            return Ok(None);
        }

        let relative = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");

        Ok(Some(Self {
            path,
            relative,
            size: metadata.len(),
        }))
    }
}

/// Walk a directory tree and collect all files, sorted by relative path.
///
/// A missing root yields an empty list: a site without a themes directory
/// simply has nothing to export for it.
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<SiteFile>> {
    let mut files = Vec::new();
    if !root.exists() {
        return Ok(files);
    }

    let walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .into_iter()
        .filter_entry(|entry| !should_skip(entry, options));

    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;

        if entry.file_type().is_dir() {
            continue;
        }

        if let Some(file) = SiteFile::from_entry(&entry, root)? {
            files.push(file);
        }
    }

    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(files)
}

/// Calculate total size of a file list
pub fn total_size(files: &[SiteFile]) -> u64 {
    files.iter().map(|f| f.size).sum()
}

fn should_skip(entry: &DirEntry, options: &WalkOptions) -> bool {
    if entry.depth() > 0
        && entry.file_type().is_dir()
        && options.prune_dirs.iter().any(|dir| entry.path() == dir.as_path())
    {
        return true;
    }

    let file_name = entry.file_name().to_string_lossy();
    options
        .exclude_patterns
        .iter()
        .any(|pattern| file_name.contains(pattern.as_str()))
}
