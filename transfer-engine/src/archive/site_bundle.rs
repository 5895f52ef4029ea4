//! Site-level containers (full-site exports and snapshots): a database dump
//! as payload plus the files of the selected components.

use super::{ArchiveMeta, ArchiveType, Asset, Manifest, Packer};
use crate::database::{self, DatabaseDump};
use crate::fs::walker::{walk_directory, SiteFile, WalkOptions};
use crate::site::{Component, Site, SitePaths};
use crate::{Result, TransferError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;

/// Site identity stored next to the dump in full-site payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteSummary {
    pub site_url: String,
    pub home_url: String,
    pub table_prefix: String,
}

/// Walk options for one component. The content walk skips the component
/// directories nested inside it so no file is archived twice.
pub fn walk_options(paths: &SitePaths, component: Component) -> WalkOptions {
    let mut options = WalkOptions::default();
    if component == Component::Content {
        options.prune_dirs = Component::ALL
            .into_iter()
            .filter(|c| *c != Component::Content)
            .map(|c| c.dir(paths).to_path_buf())
            .collect();
    }
    options
}

pub fn component_files(paths: &SitePaths, component: Component) -> Result<Vec<SiteFile>> {
    Ok(walk_directory(
        component.dir(paths),
        &walk_options(paths, component),
    )?)
}

/// Map walked files to archive assets under `files/<component>/`.
pub fn assets_for(component: Component, files: &[SiteFile]) -> Vec<Asset> {
    let prefix = component.archive_prefix();
    files
        .iter()
        .map(|f| Asset {
            source: f.path.clone(),
            target: format!("{}{}", prefix, f.relative),
        })
        .collect()
}

pub fn site_payload(dump: &DatabaseDump, archive_type: ArchiveType) -> Result<Value> {
    let mut payload = json!({});
    payload["database"] = serde_json::to_value(dump)?;
    if archive_type == ArchiveType::FullSite {
        payload["site"] = serde_json::to_value(SiteSummary {
            site_url: dump.site_url.clone(),
            home_url: dump.home_url.clone(),
            table_prefix: dump.table_prefix.clone(),
        })?;
    }
    Ok(payload)
}

/// Pull the database dump back out of a site-level payload.
pub fn dump_from_payload(payload: &Value) -> Result<DatabaseDump> {
    let database = payload
        .get("database")
        .ok_or_else(|| TransferError::Format("payload has no database dump".into()))?;
    serde_json::from_value(database.clone())
        .map_err(|e| TransferError::Format(format!("database dump: {}", e)))
}

/// Dump the database, walk the components and write one container at `dest`.
pub fn build_site_archive(
    site: &Site,
    packer: &Packer,
    dest: &Path,
    archive_type: ArchiveType,
    label: &str,
    components: &[Component],
    cancelled: &dyn Fn() -> bool,
) -> Result<Manifest> {
    let dump = database::export(site.store.as_ref(), &site.info)?;
    build_site_archive_from_dump(site, packer, dest, archive_type, label, &dump, components, cancelled)
}

/// Same as [`build_site_archive`] with a dump taken beforehand, so callers
/// can hold the job lock for the dump only.
#[allow(clippy::too_many_arguments)]
pub fn build_site_archive_from_dump(
    site: &Site,
    packer: &Packer,
    dest: &Path,
    archive_type: ArchiveType,
    label: &str,
    dump: &DatabaseDump,
    components: &[Component],
    cancelled: &dyn Fn() -> bool,
) -> Result<Manifest> {
    let payload = site_payload(dump, archive_type)?;

    let mut assets = Vec::new();
    let mut includes = vec!["database".to_string()];
    for component in components {
        if cancelled() {
            return Err(TransferError::Cancelled(format!("{} export", archive_type)));
        }
        let files = component_files(&site.info.paths, *component)?;
        tracing::debug!(component = component.as_str(), files = files.len(), "Collected component files");
        assets.extend(assets_for(*component, &files));
        includes.push(component.as_str().to_string());
    }

    let mut meta = ArchiveMeta::new(archive_type, label);
    meta.includes = includes;
    packer.create_archive_at(dest, &payload, meta, &assets, cancelled)?;
    super::read_manifest(dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_walk_prunes_nested_components() {
        let dir = tempfile::TempDir::new().unwrap();
        let content = dir.path().join("content");
        let paths = SitePaths {
            root: dir.path().to_path_buf(),
            content: content.clone(),
            uploads: content.join("uploads"),
            plugins: content.join("plugins"),
            mu_plugins: content.join("mu-plugins"),
            themes: content.join("themes"),
        };
        std::fs::create_dir_all(&paths.uploads).unwrap();
        std::fs::create_dir_all(&paths.themes).unwrap();
        std::fs::write(paths.uploads.join("a.png"), b"a").unwrap();
        std::fs::write(paths.themes.join("style.css"), b"b").unwrap();
        std::fs::write(content.join("index.php"), b"c").unwrap();

        let files = component_files(&paths, Component::Content).unwrap();
        let assets = assets_for(Component::Content, &files);
        assert_eq!(assets.len(), 1);
        assert_eq!(assets[0].target, "files/content/index.php");
        assert_eq!(assets[0].source, content.join("index.php"));
    }
}
