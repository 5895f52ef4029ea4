use super::backend::{
    compression_for, ArchiveReader, ArchiveWriter, Compression, EntryInfo, SizedReader,
};
use crate::{Result, TransferError};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub struct ZipArchiveWriter {
    zip: ZipWriter<File>,
}

impl ZipArchiveWriter {
    pub fn new(file: File) -> Self {
        Self {
            zip: ZipWriter::new(file),
        }
    }

    fn options(name: &str, size: u64) -> SimpleFileOptions {
        let method = match compression_for(name) {
            Compression::Stored => CompressionMethod::Stored,
            Compression::Deflated => CompressionMethod::Deflated,
        };
        SimpleFileOptions::default()
            .compression_method(method)
            .unix_permissions(0o644)
            .large_file(size >= u32::MAX as u64)
    }
}

impl ArchiveWriter for ZipArchiveWriter {
    fn add_bytes(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        self.zip
            .start_file(name, Self::options(name, bytes.len() as u64))?;
        self.zip.write_all(bytes)?;
        Ok(())
    }

    fn add_reader(&mut self, name: &str, size: u64, reader: &mut dyn Read) -> Result<()> {
        self.zip.start_file(name, Self::options(name, size))?;
        std::io::copy(&mut SizedReader::new(name, size, reader), &mut self.zip)?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        let mut file = self.zip.finish()?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }
}

pub struct ZipArchiveReader {
    zip: ZipArchive<BufReader<File>>,
}

impl ZipArchiveReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let zip = ZipArchive::new(BufReader::new(file))
            .map_err(|e| TransferError::Format(format!("{}: {}", path.display(), e)))?;
        Ok(Self { zip })
    }
}

impl ArchiveReader for ZipArchiveReader {
    fn entries(&mut self) -> Result<Vec<EntryInfo>> {
        let mut entries = Vec::with_capacity(self.zip.len());
        for i in 0..self.zip.len() {
            let entry = self.zip.by_index(i)?;
            if entry.is_dir() {
                continue;
            }
            entries.push(EntryInfo {
                name: entry.name().to_string(),
                size: entry.size(),
            });
        }
        Ok(entries)
    }

    fn copy_entry(&mut self, name: &str, out: &mut dyn Write) -> Result<bool> {
        let mut entry = match self.zip.by_name(name) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        std::io::copy(&mut entry, out)?;
        Ok(true)
    }

    fn visit(&mut self, visitor: &mut dyn FnMut(&str, &mut dyn Read) -> Result<()>) -> Result<()> {
        for i in 0..self.zip.len() {
            let mut entry = self.zip.by_index(i)?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();
            visitor(&name, &mut entry)?;
        }
        Ok(())
    }
}
