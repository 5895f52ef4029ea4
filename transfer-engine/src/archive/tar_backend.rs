use super::backend::{ArchiveReader, ArchiveWriter, EntryInfo, SizedReader};
use crate::{Result, TransferError};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};

pub struct TarArchiveWriter {
    builder: Builder<BufWriter<File>>,
}

impl TarArchiveWriter {
    pub fn new(file: File) -> Self {
        Self {
            builder: Builder::new(BufWriter::new(file)),
        }
    }

    fn header(size: u64) -> Header {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(size);
        header.set_mode(0o644);
        header.set_mtime(0);
        header
    }
}

impl ArchiveWriter for TarArchiveWriter {
    fn add_bytes(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        let mut header = Self::header(bytes.len() as u64);
        // append_data writes a GNU long-name record for paths over 100 bytes
        self.builder.append_data(&mut header, name, bytes)?;
        Ok(())
    }

    fn add_reader(&mut self, name: &str, size: u64, reader: &mut dyn Read) -> Result<()> {
        let mut header = Self::header(size);
        self.builder
            .append_data(&mut header, name, SizedReader::new(name, size, reader))?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        let writer = self.builder.into_inner()?;
        let file = writer
            .into_inner()
            .map_err(|e| TransferError::Write(format!("tar flush: {}", e.error())))?;
        file.sync_all()?;
        Ok(())
    }
}

/// Tar has no index, so every operation rescans the file from the start.
pub struct TarArchiveReader {
    path: PathBuf,
}

impl TarArchiveReader {
    pub fn open(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    fn archive(&self) -> Result<Archive<BufReader<File>>> {
        Ok(Archive::new(BufReader::new(File::open(&self.path)?)))
    }
}

fn entry_name(entry: &tar::Entry<'_, BufReader<File>>) -> Result<String> {
    let path = entry
        .path()
        .map_err(|e| TransferError::Format(format!("tar entry path: {}", e)))?;
    Ok(path.to_string_lossy().replace('\\', "/"))
}

impl ArchiveReader for TarArchiveReader {
    fn entries(&mut self) -> Result<Vec<EntryInfo>> {
        let mut archive = self.archive()?;
        let mut entries = Vec::new();
        for entry in archive.entries()? {
            let entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            entries.push(EntryInfo {
                name: entry_name(&entry)?,
                size: entry.header().size()?,
            });
        }
        Ok(entries)
    }

    fn copy_entry(&mut self, name: &str, out: &mut dyn Write) -> Result<bool> {
        let mut archive = self.archive()?;
        for entry in archive.entries()? {
            let mut entry = entry?;
            if entry.header().entry_type().is_file() && entry_name(&entry)? == name {
                std::io::copy(&mut entry, out)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn visit(&mut self, visitor: &mut dyn FnMut(&str, &mut dyn Read) -> Result<()>) -> Result<()> {
        let mut archive = self.archive()?;
        for entry in archive.entries()? {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = entry_name(&entry)?;
            visitor(&name, &mut entry)?;
        }
        Ok(())
    }
}
