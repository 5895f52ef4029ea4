//! Container backends.
//!
//! Zip is the primary format. Tar is the fallback for hosts where zip writing
//! does not work; it stores every entry uncompressed. Readers pick the backend
//! from the file's magic bytes, so either host can read what the other wrote.

use super::{tar_backend, zip_backend};
use crate::{Result, TransferError};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// Extensions that are already compressed; deflating them only burns CPU.
const COMPRESSION_EXEMPT: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "mp3", "mp4", "m4a", "mov", "avi", "ogg", "webm", "zip",
    "gz", "bz2", "xz", "7z", "rar", "pdf", "woff", "woff2",
];

/// How often (in bytes) streaming copies check for cancellation.
pub const CANCEL_POLL_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Stored,
    Deflated,
}

/// Compression policy for an entry, independent of backend.
pub fn compression_for(path: &str) -> Compression {
    let ext = path
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase());
    match ext {
        Some(ext) if COMPRESSION_EXEMPT.contains(&ext.as_str()) => Compression::Stored,
        _ => Compression::Deflated,
    }
}

/// Normalize an entry path: forward slashes, no leading slash, no `.`
/// components. Paths containing `..` or nothing at all are rejected.
pub fn normalize_entry_path(path: &str) -> Option<String> {
    let mut parts = Vec::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => return None,
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Size and name of one container entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    pub name: String,
    pub size: u64,
}

pub trait ArchiveWriter {
    fn add_bytes(&mut self, name: &str, bytes: &[u8]) -> Result<()>;
    /// Stream `size` bytes from `reader` into a new entry.
    fn add_reader(&mut self, name: &str, size: u64, reader: &mut dyn Read) -> Result<()>;
    fn finish(self: Box<Self>) -> Result<()>;
}

pub trait ArchiveReader {
    fn entries(&mut self) -> Result<Vec<EntryInfo>>;
    /// Copy one entry into `out`. Returns false when the entry does not exist.
    fn copy_entry(&mut self, name: &str, out: &mut dyn Write) -> Result<bool>;
    /// Visit every file entry in container order.
    fn visit(&mut self, visitor: &mut dyn FnMut(&str, &mut dyn Read) -> Result<()>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Zip,
    Tar,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    #[default]
    Auto,
    Zip,
    Tar,
}

impl BackendKind {
    pub fn extension(&self) -> &'static str {
        match self {
            BackendKind::Zip => "zip",
            BackendKind::Tar => "tar",
        }
    }

    /// Compression actually applied by this backend.
    pub fn compression_for(&self, path: &str) -> Compression {
        match self {
            BackendKind::Zip => compression_for(path),
            BackendKind::Tar => Compression::Stored,
        }
    }

    /// Resolve a configured preference; `auto` probes the scratch directory.
    pub fn resolve(preference: BackendPreference, scratch: &Path) -> Self {
        match preference {
            BackendPreference::Zip => BackendKind::Zip,
            BackendPreference::Tar => BackendKind::Tar,
            BackendPreference::Auto => Self::probe(scratch),
        }
    }

    /// Write and re-read a tiny zip; fall back to tar if that fails.
    pub fn probe(scratch: &Path) -> Self {
        let probe_path = scratch.join(format!(".probe-{}.zip", uuid::Uuid::new_v4()));
        let result = (|| -> Result<bool> {
            std::fs::create_dir_all(scratch)?;
            let mut writer = BackendKind::Zip.create(&probe_path)?;
            writer.add_bytes("probe", b"ok")?;
            writer.finish()?;

            let mut reader = open_reader(&probe_path)?;
            let mut out = Vec::new();
            Ok(reader.copy_entry("probe", &mut out)? && out == b"ok")
        })();
        let _ = std::fs::remove_file(&probe_path);

        match result {
            Ok(true) => BackendKind::Zip,
            Ok(false) => {
                tracing::warn!("Zip probe read back wrong content, using tar backend");
                BackendKind::Tar
            }
            Err(e) => {
                tracing::warn!(error = %e, "Zip probe failed, using tar backend");
                BackendKind::Tar
            }
        }
    }

    /// Create a new container at `path`. The file must not exist yet.
    pub fn create(&self, path: &Path) -> Result<Box<dyn ArchiveWriter>> {
        let file = File::options()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| TransferError::Write(format!("{}: {}", path.display(), e)))?;
        Ok(match self {
            BackendKind::Zip => Box::new(zip_backend::ZipArchiveWriter::new(file)),
            BackendKind::Tar => Box::new(tar_backend::TarArchiveWriter::new(file)),
        })
    }

    /// Identify the backend of an existing container from its magic bytes.
    pub fn detect(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut header = Vec::with_capacity(512);
        (&mut file).take(512).read_to_end(&mut header)?;

        if header.starts_with(b"PK\x03\x04") || header.starts_with(b"PK\x05\x06") {
            return Ok(BackendKind::Zip);
        }
        if header.len() >= 262 && &header[257..262] == b"ustar" {
            return Ok(BackendKind::Tar);
        }
        Err(TransferError::Format(format!(
            "{} is neither a zip nor a tar container",
            path.display()
        )))
    }
}

/// Open an existing container with whichever backend wrote it.
pub fn open_reader(path: &Path) -> Result<Box<dyn ArchiveReader>> {
    Ok(match BackendKind::detect(path)? {
        BackendKind::Zip => Box::new(zip_backend::ZipArchiveReader::open(path)?),
        BackendKind::Tar => Box::new(tar_backend::TarArchiveReader::open(path)),
    })
}

/// Reader wrapper that fails once `cancelled` reports true, checked every
/// [`CANCEL_POLL_BYTES`].
pub struct CancellableReader<'a, R> {
    inner: R,
    cancelled: &'a dyn Fn() -> bool,
    since_check: usize,
}

impl<'a, R: Read> CancellableReader<'a, R> {
    pub fn new(inner: R, cancelled: &'a dyn Fn() -> bool) -> Self {
        Self {
            inner,
            cancelled,
            since_check: 0,
        }
    }
}

impl<R: Read> Read for CancellableReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.since_check >= CANCEL_POLL_BYTES {
            self.since_check = 0;
            if (self.cancelled)() {
                // Not ErrorKind::Interrupted: io::copy would retry it
                return Err(std::io::Error::other("cancelled"));
            }
        }
        let n = self.inner.read(buf)?;
        self.since_check += n;
        Ok(n)
    }
}

/// Yields exactly the `size` bytes an entry header announced. Bytes past
/// that are ignored; running dry early is an `UnexpectedEof` error.
pub struct SizedReader<'a> {
    inner: std::io::Take<&'a mut dyn Read>,
    name: &'a str,
    remaining: u64,
}

impl<'a> SizedReader<'a> {
    pub fn new(name: &'a str, size: u64, inner: &'a mut dyn Read) -> Self {
        Self {
            inner: inner.take(size),
            name,
            remaining: size,
        }
    }
}

impl Read for SizedReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let n = self.inner.read(buf)?;
        if n == 0 && !buf.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("{} shrank while archiving, {} bytes short", self.name, self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Entries written through `add_reader` with a stale size stay readable
    /// when the source grew, and fail loudly when it shrank.
    #[test]
    fn test_add_reader_holds_to_announced_size() {
        let dir = TempDir::new().unwrap();
        for kind in [BackendKind::Zip, BackendKind::Tar] {
            let path = dir.path().join(format!("grown.{}", kind.extension()));
            let mut writer = kind.create(&path).unwrap();
            let grown = vec![b'x'; 2000];
            writer.add_reader("uploads/a.txt", 3, &mut &grown[..]).unwrap();
            writer.add_bytes("manifest.json", b"{}").unwrap();
            writer.finish().unwrap();

            let mut reader = open_reader(&path).unwrap();
            let entries = reader.entries().unwrap();
            assert_eq!(entries.len(), 2, "{:?}", entries);
            let mut first = Vec::new();
            assert!(reader.copy_entry("uploads/a.txt", &mut first).unwrap());
            assert_eq!(first, b"xxx");
            let mut manifest = Vec::new();
            assert!(reader.copy_entry("manifest.json", &mut manifest).unwrap());
            assert_eq!(manifest, b"{}");

            let path = dir.path().join(format!("shrunk.{}", kind.extension()));
            let mut writer = kind.create(&path).unwrap();
            let err = writer.add_reader("uploads/b.txt", 10, &mut &b"abc"[..]).unwrap_err();
            assert!(err.to_string().contains("uploads/b.txt"), "{}", err);
        }
    }

    #[test]
    fn test_compression_policy() {
        assert_eq!(compression_for("media/12-photo.JPG"), Compression::Stored);
        assert_eq!(compression_for("files/themes/x/font.woff2"), Compression::Stored);
        assert_eq!(compression_for("payload/content"), Compression::Deflated);
        assert_eq!(compression_for("files/plugins/a/main.php"), Compression::Deflated);
        assert_eq!(BackendKind::Tar.compression_for("main.php"), Compression::Stored);
    }

    #[test]
    fn test_normalize_entry_path() {
        assert_eq!(normalize_entry_path("/files//uploads/./a.png").as_deref(), Some("files/uploads/a.png"));
        assert_eq!(normalize_entry_path("media\\1-a.png").as_deref(), Some("media/1-a.png"));
        assert_eq!(normalize_entry_path("files/../etc/passwd"), None);
        assert_eq!(normalize_entry_path("/"), None);
    }

    #[test]
    fn test_detect_both_backends() {
        let dir = TempDir::new().unwrap();
        for kind in [BackendKind::Zip, BackendKind::Tar] {
            let path = dir.path().join(format!("a.{}", kind.extension()));
            let mut writer = kind.create(&path).unwrap();
            writer.add_bytes("manifest", b"{}").unwrap();
            writer.finish().unwrap();
            assert_eq!(BackendKind::detect(&path).unwrap(), kind);
        }

        let junk = dir.path().join("junk.bin");
        std::fs::write(&junk, b"not an archive").unwrap();
        assert!(matches!(BackendKind::detect(&junk), Err(TransferError::Format(_))));
    }

    #[test]
    fn test_probe_prefers_zip() {
        let dir = TempDir::new().unwrap();
        assert_eq!(BackendKind::probe(dir.path()), BackendKind::Zip);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("exists.zip");
        std::fs::write(&path, b"x").unwrap();
        assert!(matches!(BackendKind::Zip.create(&path), Err(TransferError::Write(_))));
    }

    #[test]
    fn test_cancellable_reader_stops() {
        let data = vec![0u8; CANCEL_POLL_BYTES * 3];
        let cancel = || true;
        let mut reader = CancellableReader::new(&data[..], &cancel);
        let mut out = Vec::new();
        assert!(std::io::copy(&mut reader, &mut out).is_err());
        assert!(out.len() < data.len());
    }
}
