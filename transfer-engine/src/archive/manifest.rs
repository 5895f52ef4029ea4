//! Manifest types for site archives.
//!
//! The manifest is the first entry of every container. It identifies what
//! the payload is and carries the payload checksum plus the list of media
//! assets stored next to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Container format written by this build. Readers reject anything newer.
pub const FORMAT_VERSION: u32 = 1;

/// Version string recorded as the producer of new archives.
pub const PRODUCER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArchiveType {
    #[serde(rename = "page")]
    Page,
    #[serde(rename = "form")]
    Form,
    #[serde(rename = "options_page")]
    OptionsPage,
    #[serde(rename = "bundle")]
    Bundle,
    #[serde(rename = "snapshot")]
    Snapshot,
    #[serde(rename = "full-site")]
    FullSite,
}

impl ArchiveType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveType::Page => "page",
            ArchiveType::Form => "form",
            ArchiveType::OptionsPage => "options_page",
            ArchiveType::Bundle => "bundle",
            ArchiveType::Snapshot => "snapshot",
            ArchiveType::FullSite => "full-site",
        }
    }

    /// Snapshot and full-site containers carry a database dump and site files.
    pub fn is_site_level(&self) -> bool {
        matches!(self, ArchiveType::Snapshot | ArchiveType::FullSite)
    }
}

impl std::fmt::Display for ArchiveType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One media asset stored in the container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentManifestEntry {
    pub original_id: i64,
    pub parent_id: i64,
    pub filename: String,
    pub mime_type: String,
    pub filesize: u64,
    /// sha256 of the file bytes; used to find an existing copy on import
    pub checksum: String,
    pub source_url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub alt: String,
    #[serde(default)]
    pub caption: String,
    #[serde(default)]
    pub description: String,
    pub archive_path: String,
}

/// Archive manifest, serialized as the `manifest` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    #[serde(rename = "plugin_version")]
    pub producer_version: String,
    #[serde(rename = "type")]
    pub archive_type: ArchiveType,
    pub label: String,
    #[serde(rename = "created_at_gmt")]
    pub created_at: DateTime<Utc>,
    /// sha256 of the exact `payload/content` bytes
    pub checksum: String,
    #[serde(default)]
    pub media: Vec<AttachmentManifestEntry>,
    #[serde(default)]
    pub includes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_wire_keys() {
        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            producer_version: "1.2.3".into(),
            archive_type: ArchiveType::FullSite,
            label: "Nightly".into(),
            created_at: Utc::now(),
            checksum: "00".repeat(32),
            media: Vec::new(),
            includes: vec!["uploads".into()],
        };

        let json = serde_json::to_value(&manifest).unwrap();
        let keys: Vec<_> = json.as_object().unwrap().keys().cloned().collect();
        assert_eq!(
            keys,
            vec![
                "format_version",
                "plugin_version",
                "type",
                "label",
                "created_at_gmt",
                "checksum",
                "media",
                "includes"
            ]
        );
        assert_eq!(json["type"], "full-site");
    }

    #[test]
    fn test_manifest_defaults_optional_lists() {
        let manifest: Manifest = serde_json::from_str(
            r#"{"format_version":1,"plugin_version":"0.1","type":"options_page",
                "label":"x","created_at_gmt":"2024-05-01T10:00:00Z","checksum":"ab"}"#,
        )
        .unwrap();
        assert_eq!(manifest.archive_type, ArchiveType::OptionsPage);
        assert!(manifest.media.is_empty());
        assert!(manifest.includes.is_empty());
    }
}
