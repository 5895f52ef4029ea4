//! Archive container: packing, extraction and integrity verification.
//!
//! Layout of every container:
//!
//! ```text
//! manifest            JSON, written first
//! payload/content     JSON payload, sha256 recorded in the manifest
//! media/<id>-<name>   optional media assets
//! files/<component>/  site files (full-site and snapshot only)
//! ```

pub mod backend;
pub mod checksum;
pub mod manifest;
pub mod site_bundle;
mod tar_backend;
mod zip_backend;

pub use backend::{BackendKind, BackendPreference, EntryInfo};
pub use manifest::{ArchiveType, AttachmentManifestEntry, Manifest, FORMAT_VERSION};

use crate::{Result, TransferError};
use backend::{normalize_entry_path, open_reader, CancellableReader};
use chrono::Utc;
use serde_json::Value;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Component as PathComponent, Path, PathBuf};

pub const MANIFEST_PATH: &str = "manifest";
pub const PAYLOAD_PATH: &str = "payload/content";

/// Descriptive fields of a new archive.
#[derive(Debug, Clone)]
pub struct ArchiveMeta {
    pub archive_type: ArchiveType,
    pub label: String,
    pub media: Vec<AttachmentManifestEntry>,
    pub includes: Vec<String>,
}

impl ArchiveMeta {
    pub fn new(archive_type: ArchiveType, label: &str) -> Self {
        Self {
            archive_type,
            label: label.to_string(),
            media: Vec::new(),
            includes: Vec::new(),
        }
    }
}

/// A file to copy into the container unmodified.
#[derive(Debug, Clone)]
pub struct Asset {
    pub source: PathBuf,
    pub target: String,
}

pub fn is_valid_archive_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
        && !name.contains("..")
}

/// Verified contents of a container.
#[derive(Debug, Clone)]
pub struct Extracted {
    pub archive_type: ArchiveType,
    pub payload: Value,
    pub media: Vec<AttachmentManifestEntry>,
    pub manifest: Manifest,
}

/// Creates containers in one archives directory with a fixed backend.
#[derive(Debug, Clone)]
pub struct Packer {
    archives_dir: PathBuf,
    kind: BackendKind,
}

impl Packer {
    pub fn new(archives_dir: &Path, kind: BackendKind) -> Self {
        Self {
            archives_dir: archives_dir.to_path_buf(),
            kind,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn archives_dir(&self) -> &Path {
        &self.archives_dir
    }

    /// File name for a new archive, unique per call.
    pub fn archive_name(&self, archive_type: ArchiveType) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!(
            "{}-{}-{}.{}",
            archive_type,
            Utc::now().format("%Y%m%d-%H%M%S"),
            &id[..8],
            self.kind.extension()
        )
    }

    /// Path of the archive called `name`. Only bare file names inside the
    /// archives directory are accepted.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        if !is_valid_archive_name(name) {
            return Err(TransferError::Format(format!("invalid archive name '{}'", name)));
        }
        Ok(self.archives_dir.join(name))
    }

    /// Create a container in the archives directory and return its path.
    pub fn create_archive(&self, payload: &Value, meta: ArchiveMeta, assets: &[Asset]) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.archives_dir)
            .map_err(|e| TransferError::Write(format!("{}: {}", self.archives_dir.display(), e)))?;
        let dest = self.archives_dir.join(self.archive_name(meta.archive_type));
        self.create_archive_at(&dest, payload, meta, assets, &|| false)?;
        Ok(dest)
    }

    /// Create a container at `dest`. Unreadable assets are skipped and
    /// dropped from the manifest; `cancelled` is polled between files and
    /// every 64 KiB inside them.
    pub fn create_archive_at(
        &self,
        dest: &Path,
        payload: &Value,
        meta: ArchiveMeta,
        assets: &[Asset],
        cancelled: &dyn Fn() -> bool,
    ) -> Result<()> {
        let result = self.write_container(dest, payload, meta, assets, cancelled);
        if result.is_err() {
            let _ = std::fs::remove_file(dest);
        }
        result
    }

    fn write_container(
        &self,
        dest: &Path,
        payload: &Value,
        mut meta: ArchiveMeta,
        assets: &[Asset],
        cancelled: &dyn Fn() -> bool,
    ) -> Result<()> {
        let payload_bytes = serde_json::to_vec_pretty(payload)
            .map_err(|e| TransferError::Encoding(e.to_string()))?;

        // Open every asset up front so the manifest only lists streams that exist
        let mut opened = Vec::with_capacity(assets.len());
        for asset in assets {
            let Some(target) = normalize_entry_path(&asset.target) else {
                tracing::warn!(target = %asset.target, "Skipping asset with invalid archive path");
                continue;
            };
            match File::open(&asset.source).and_then(|f| f.metadata().map(|m| (f, m))) {
                Ok((file, metadata)) if metadata.is_file() => {
                    opened.push((target, file, metadata.len()))
                }
                Ok(_) => {
                    tracing::warn!(source = %asset.source.display(), "Skipping asset that is not a regular file");
                }
                Err(e) => {
                    tracing::warn!(source = %asset.source.display(), error = %e, "Skipping unreadable asset");
                }
            }
        }
        meta.media.retain(|m| {
            let path = normalize_entry_path(&m.archive_path);
            opened
                .iter()
                .any(|(target, _, _)| path.as_deref() == Some(target.as_str()))
        });

        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            producer_version: manifest::PRODUCER_VERSION.to_string(),
            archive_type: meta.archive_type,
            label: meta.label,
            created_at: Utc::now(),
            checksum: checksum::sha256_hex(&payload_bytes),
            media: meta.media,
            includes: meta.includes,
        };
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| TransferError::Encoding(e.to_string()))?;

        let mut writer = self.kind.create(dest)?;
        writer.add_bytes(MANIFEST_PATH, &manifest_bytes)?;
        writer.add_bytes(PAYLOAD_PATH, &payload_bytes)?;

        for (target, file, size) in opened {
            if cancelled() {
                return Err(TransferError::Cancelled(format!("archive {}", dest.display())));
            }
            let mut reader = CancellableReader::new(file, cancelled);
            if let Err(e) = writer.add_reader(&target, size, &mut reader) {
                if cancelled() {
                    return Err(TransferError::Cancelled(format!("archive {}", dest.display())));
                }
                return Err(e);
            }
        }

        writer.finish()?;
        tracing::debug!(
            archive = %dest.display(),
            archive_type = %manifest.archive_type,
            backend = self.kind.extension(),
            "Archive written"
        );
        Ok(())
    }
}

fn read_json_entry(reader: &mut dyn backend::ArchiveReader, name: &str) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    if !reader.copy_entry(name, &mut bytes)? {
        return Err(TransferError::Format(format!("missing '{}' entry", name)));
    }
    Ok(bytes)
}

fn parse_manifest(bytes: &[u8]) -> Result<Manifest> {
    serde_json::from_slice(bytes).map_err(|e| TransferError::Format(format!("manifest: {}", e)))
}

/// Read and verify a container: the payload checksum must match the manifest.
pub fn extract(archive_path: &Path) -> Result<Extracted> {
    let mut reader = open_reader(archive_path)?;
    let manifest = parse_manifest(&read_json_entry(reader.as_mut(), MANIFEST_PATH)?)?;
    let payload_bytes = read_json_entry(reader.as_mut(), PAYLOAD_PATH)?;

    let actual = checksum::sha256_hex(&payload_bytes);
    if !checksum::digests_match(&manifest.checksum, &actual) {
        return Err(TransferError::Integrity(format!(
            "payload checksum mismatch in {} (expected {}, got {})",
            archive_path.display(),
            manifest.checksum,
            actual
        )));
    }

    let payload: Value = serde_json::from_slice(&payload_bytes)
        .map_err(|e| TransferError::Format(format!("payload: {}", e)))?;

    Ok(Extracted {
        archive_type: manifest.archive_type,
        payload,
        media: manifest.media.clone(),
        manifest,
    })
}

/// Manifest only, without payload verification.
pub fn read_manifest(archive_path: &Path) -> Result<Manifest> {
    let mut reader = open_reader(archive_path)?;
    parse_manifest(&read_json_entry(reader.as_mut(), MANIFEST_PATH)?)
}

/// Raw bytes of one entry, or None when the container has no such entry.
pub fn read_entry(archive_path: &Path, name: &str) -> Result<Option<Vec<u8>>> {
    let mut reader = open_reader(archive_path)?;
    let mut bytes = Vec::new();
    if reader.copy_entry(name, &mut bytes)? {
        Ok(Some(bytes))
    } else {
        Ok(None)
    }
}

pub fn list_entries(archive_path: &Path) -> Result<Vec<EntryInfo>> {
    open_reader(archive_path)?.entries()
}

/// Stream one asset into a fresh temporary file and return its path. The
/// caller owns the file and removes it when done.
pub fn extract_media_file(archive_relative_path: &str, archive_path: &Path) -> Result<PathBuf> {
    let name = normalize_entry_path(archive_relative_path)
        .ok_or_else(|| TransferError::Format(format!("invalid entry path '{}'", archive_relative_path)))?;

    let mut reader = open_reader(archive_path)?;
    let temp = tempfile::Builder::new().prefix("transfer-media-").tempfile()?;
    let found = {
        let mut out = BufWriter::new(temp.as_file());
        let found = reader.copy_entry(&name, &mut out)?;
        std::io::Write::flush(&mut out)?;
        found
    };
    if !found {
        return Err(TransferError::NotFound(format!(
            "entry '{}' in {}",
            name,
            archive_path.display()
        )));
    }

    let (_, path) = temp.keep().map_err(|e| TransferError::Io(e.error))?;
    Ok(path)
}

/// Extract every entry under `prefix` into `dest_dir`, keeping the path
/// below the prefix. Returns the number of files written.
pub fn extract_prefix(archive_path: &Path, prefix: &str, dest_dir: &Path) -> Result<usize> {
    let mut reader = open_reader(archive_path)?;
    let mut written = 0;

    reader.visit(&mut |name, data| {
        let Some(relative) = name.strip_prefix(prefix) else {
            return Ok(());
        };
        let target = safe_join(dest_dir, relative)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = BufWriter::new(File::create(&target)?);
        std::io::copy(data, &mut out)?;
        std::io::Write::flush(&mut out)?;
        written += 1;
        Ok(())
    })?;

    Ok(written)
}

fn safe_join(dest_dir: &Path, relative: &str) -> Result<PathBuf> {
    let rel = Path::new(relative);
    let escapes = rel.is_absolute()
        || relative.starts_with('/')
        || rel.components().any(|c| {
            matches!(
                c,
                PathComponent::ParentDir | PathComponent::RootDir | PathComponent::Prefix(_)
            )
        });
    if escapes || relative.is_empty() {
        return Err(TransferError::Format(format!(
            "entry '{}' escapes the destination directory",
            relative
        )));
    }
    Ok(dest_dir.join(rel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn packer(dir: &TempDir, kind: BackendKind) -> Packer {
        Packer::new(&dir.path().join("archives"), kind)
    }

    #[test]
    fn test_archive_names_stay_in_archives_dir() {
        let dir = TempDir::new().unwrap();
        let packer = packer(&dir, BackendKind::Zip);
        assert!(packer.resolve("full-site-20240101-000000-abcd1234.zip").is_ok());
        assert!(!is_valid_archive_name("../etc/passwd"));
        assert!(!is_valid_archive_name("a/b.zip"));
        assert!(!is_valid_archive_name(".hidden"));
        assert!(matches!(packer.resolve(""), Err(TransferError::Format(_))));
    }

    #[test]
    fn test_missing_asset_dropped_from_manifest() {
        let dir = TempDir::new().unwrap();
        let present = dir.path().join("present.png");
        std::fs::write(&present, b"png").unwrap();

        let entry = |id: i64, path: &str| AttachmentManifestEntry {
            original_id: id,
            parent_id: 1,
            filename: "x.png".into(),
            mime_type: "image/png".into(),
            filesize: 3,
            checksum: checksum::sha256_hex(b"png"),
            source_url: String::new(),
            title: String::new(),
            alt: String::new(),
            caption: String::new(),
            description: String::new(),
            archive_path: path.into(),
        };
        let mut meta = ArchiveMeta::new(ArchiveType::Page, "Home");
        meta.media = vec![entry(2, "media/2-x.png"), entry(3, "media/3-x.png")];

        let path = packer(&dir, BackendKind::Zip)
            .create_archive(
                &json!({"title": "Home"}),
                meta,
                &[
                    Asset { source: present, target: "media/2-x.png".into() },
                    Asset { source: dir.path().join("gone.png"), target: "media/3-x.png".into() },
                ],
            )
            .unwrap();

        let extracted = extract(&path).unwrap();
        assert_eq!(extracted.media.len(), 1);
        assert_eq!(extracted.media[0].original_id, 2);
        let names: Vec<_> = list_entries(&path).unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["manifest", "payload/content", "media/2-x.png"]);
    }

    #[test]
    fn test_extract_prefix_rejects_escape() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("evil.zip");
        let mut writer = BackendKind::Zip.create(&dest).unwrap();
        writer.add_bytes("files/uploads/../../../etc/x", b"boom").unwrap();
        writer.finish().unwrap();

        let out = dir.path().join("out");
        assert!(matches!(
            extract_prefix(&dest, "files/uploads/", &out),
            Err(TransferError::Format(_))
        ));
        assert!(!dir.path().join("etc").exists());
    }

    #[test]
    fn test_extract_media_file_missing_entry() {
        let dir = TempDir::new().unwrap();
        let path = packer(&dir, BackendKind::Tar)
            .create_archive(&json!({}), ArchiveMeta::new(ArchiveType::Form, "f"), &[])
            .unwrap();
        assert!(matches!(
            extract_media_file("media/1-a.png", &path),
            Err(TransferError::NotFound(_))
        ));
    }

    #[test]
    fn test_cancelled_archive_removes_output() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("big.bin");
        std::fs::write(&source, vec![1u8; 512 * 1024]).unwrap();
        let dest = dir.path().join("out.zip");

        let result = packer(&dir, BackendKind::Zip).create_archive_at(
            &dest,
            &json!({}),
            ArchiveMeta::new(ArchiveType::FullSite, "x"),
            &[Asset { source, target: "files/uploads/big.bin".into() }],
            &|| true,
        );
        assert!(matches!(result, Err(TransferError::Cancelled(_))));
        assert!(!dest.exists());
    }
}
