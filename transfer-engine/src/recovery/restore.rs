//! Replaying a site-level container onto the live site. Shared by snapshot
//! restore and the import pipeline.

use crate::archive::{self, site_bundle};
use crate::database::{self, ReplayReport};
use crate::site::{Component, Site};
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// Legacy containers may carry a plain SQL script instead of (or next to)
/// the JSON dump.
pub const LEGACY_SQL_ENTRY: &str = "database.sql";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseRestore {
    pub tables: usize,
    pub rows: usize,
    pub urls_rewritten: usize,
    #[serde(default)]
    pub replay: Option<ReplayReport>,
}

/// Restore the dump in `payload` (and any legacy SQL script in the archive),
/// then point URLs back at the target site.
pub fn restore_database(site: &Site, archive_path: &Path, payload: &Value) -> Result<DatabaseRestore> {
    let (target_site_url, target_home_url) = site.current_urls()?;
    let store = site.store.as_ref();
    let prefix = &site.info.table_prefix;
    let mut outcome = DatabaseRestore::default();

    let dump = if payload.get("database").is_some() {
        let dump = site_bundle::dump_from_payload(payload)?;
        let report = database::import(store, &dump, prefix)?;
        outcome.tables = report.tables;
        outcome.rows = report.rows;
        Some(dump)
    } else {
        None
    };

    if let Some(script) = archive::read_entry(archive_path, LEGACY_SQL_ENTRY)? {
        let script = String::from_utf8_lossy(&script);
        outcome.replay = Some(database::replay_sql(store, &script)?);
    }

    if let Some(dump) = &dump {
        outcome.urls_rewritten += database::rewrite_urls(store, prefix, &dump.site_url, &target_site_url)?;
        if dump.home_url != dump.site_url {
            outcome.urls_rewritten += database::rewrite_urls(store, prefix, &dump.home_url, &target_home_url)?;
        }
    }
    site.options.set("siteurl", &Value::String(target_site_url))?;
    site.options.set("home", &Value::String(target_home_url))?;

    tracing::info!(
        tables = outcome.tables,
        rows = outcome.rows,
        urls_rewritten = outcome.urls_rewritten,
        "Database restored"
    );
    Ok(outcome)
}

/// Extract `files/<component>/` into the component directory, overwriting
/// existing files. Returns the number of files written.
pub fn restore_component(site: &Site, archive_path: &Path, component: Component) -> Result<usize> {
    let dest = component.dir(&site.info.paths);
    std::fs::create_dir_all(dest)?;
    let written = archive::extract_prefix(archive_path, &component.archive_prefix(), dest)?;
    tracing::info!(component = component.as_str(), files = written, "Component files restored");
    Ok(written)
}
