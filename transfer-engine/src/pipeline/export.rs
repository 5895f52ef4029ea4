//! Full-site export steps.
//!
//! Intermediate results live in the run's scratch directory: the package
//! description, the database dump and one file list per component. The
//! archive step assembles them into a `full-site` container.

use super::{scratch_dir, PipelineParams, StepDef};
use crate::archive::manifest::{FORMAT_VERSION, PRODUCER_VERSION};
use crate::archive::site_bundle::{assets_for, component_files, site_payload};
use crate::archive::{ArchiveMeta, ArchiveType};
use crate::database::{self, DatabaseDump};
use crate::fs::walker::{total_size, SiteFile};
use crate::site::Component;
use crate::{Result, TransferContext, TransferError};
use serde_json::{json, Value};
use std::fs;
use std::path::Path;

/// The compatibility check runs without the job lock.
pub const LOCK_FROM: i64 = 10;

pub static STEPS: &[StepDef] = &[
    StepDef { priority: 5, name: "compatibility", run: compatibility },
    StepDef { priority: 10, name: "init", run: init },
    StepDef { priority: 20, name: "config", run: config },
    StepDef { priority: 30, name: "config_file", run: config_file },
    StepDef { priority: 40, name: "database", run: database_tables },
    StepDef { priority: 50, name: "database_file", run: database_file },
    StepDef { priority: 60, name: "media", run: media },
    StepDef { priority: 70, name: "content", run: content },
    StepDef { priority: 80, name: "plugins", run: plugins },
    StepDef { priority: 90, name: "themes", run: themes },
    StepDef { priority: 100, name: "archive", run: archive },
    StepDef { priority: 110, name: "cleanup", run: cleanup },
];

const PACKAGE_FILE: &str = "package.json";
const DATABASE_FILE: &str = "database.json";

/// Scratch file holding the walked files of one component.
fn list_file(component: Component) -> String {
    format!("files-{}.json", component.as_str())
}

fn compatibility(ctx: &TransferContext, mut params: PipelineParams) -> Result<PipelineParams> {
    let paths = &ctx.site.info.paths;
    if !paths.root.is_dir() {
        return Err(TransferError::Config(format!(
            "site root {} does not exist",
            paths.root.display()
        )));
    }
    fs::create_dir_all(ctx.packer.archives_dir())?;
    params.set("backend", ctx.packer.kind().extension());
    params.set("format_version", FORMAT_VERSION);
    params.set_status("Checking environment", "Environment ready for export");
    Ok(params)
}

fn init(ctx: &TransferContext, mut params: PipelineParams) -> Result<PipelineParams> {
    fs::create_dir_all(scratch_dir(ctx, &params)?)?;
    params.set("archive", ctx.packer.archive_name(ArchiveType::FullSite));
    params.set_status("Preparing", "Export initialised");
    Ok(params)
}

fn config(ctx: &TransferContext, mut params: PipelineParams) -> Result<PipelineParams> {
    let (site_url, home_url) = ctx.site.current_urls()?;
    let package = json!({
        "site_url": site_url,
        "home_url": home_url,
        "table_prefix": ctx.site.info.table_prefix,
        "producer_version": PRODUCER_VERSION,
        "format_version": FORMAT_VERSION,
        "include": params.get("include").cloned().unwrap_or_else(|| json!({})),
        "created_at": chrono::Utc::now().to_rfc3339(),
    });
    params.set("package", package);
    params.set_status("Reading configuration", "Collected site configuration");
    Ok(params)
}

fn config_file(ctx: &TransferContext, mut params: PipelineParams) -> Result<PipelineParams> {
    let package = params
        .get("package")
        .ok_or_else(|| TransferError::Format("missing parameter 'package'".into()))?;
    let path = scratch_dir(ctx, &params)?.join(PACKAGE_FILE);
    fs::write(&path, serde_json::to_vec_pretty(package)?)?;
    params.set_status("Reading configuration", "Wrote package description");
    Ok(params)
}

fn database_tables(ctx: &TransferContext, mut params: PipelineParams) -> Result<PipelineParams> {
    let tables = if params.include("database") {
        ctx.site.store.list_tables(&ctx.site.info.table_prefix)?
    } else {
        Vec::new()
    };
    params.set_status("Exporting database", &format!("{} tables to export", tables.len()));
    params.set("tables", tables);
    Ok(params)
}

fn database_file(ctx: &TransferContext, mut params: PipelineParams) -> Result<PipelineParams> {
    let (site_url, home_url) = ctx.site.current_urls()?;
    let mut info = ctx.site.info.clone();
    info.site_url = site_url;
    info.home_url = home_url;

    let tables: Vec<String> = match params.get("tables") {
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| TransferError::Format(format!("tables: {}", e)))?,
        None => Vec::new(),
    };
    let dump = if params.include("database") {
        database::export_tables(ctx.site.store.as_ref(), &info, &tables)?
    } else {
        DatabaseDump {
            site_url: info.site_url,
            home_url: info.home_url,
            table_prefix: info.table_prefix,
            ..Default::default()
        }
    };
    let rows: usize = dump.tables.values().map(|t| t.rows.len()).sum();
    let path = scratch_dir(ctx, &params)?.join(DATABASE_FILE);
    fs::write(&path, serde_json::to_vec(&dump)?)?;

    params.set("database_file", DATABASE_FILE);
    params.set_status("Exporting database", &format!("Dumped {} rows", rows));
    Ok(params)
}

/// Walk the given components (when included) and record their file lists.
fn collect(
    ctx: &TransferContext,
    mut params: PipelineParams,
    option: &str,
    key: &str,
    components: &[Component],
) -> Result<PipelineParams> {
    let scratch = scratch_dir(ctx, &params)?;
    let mut count = 0;
    let mut bytes = 0;
    for component in components {
        let files = if params.include(option) {
            component_files(&ctx.site.info.paths, *component)?
        } else {
            Vec::new()
        };
        count += files.len();
        bytes += total_size(&files);
        fs::write(scratch.join(list_file(*component)), serde_json::to_vec(&files)?)?;
    }
    tracing::debug!(option, files = count, bytes, "Collected files");
    params.set(key, count);
    params.set_status(&format!("Collecting {}", option), &format!("{} files, {} bytes", count, bytes));
    Ok(params)
}

fn media(ctx: &TransferContext, params: PipelineParams) -> Result<PipelineParams> {
    collect(ctx, params, "media", "media_files", &[Component::Uploads])
}

fn content(ctx: &TransferContext, params: PipelineParams) -> Result<PipelineParams> {
    collect(ctx, params, "content", "content_files", &[Component::Content])
}

fn plugins(ctx: &TransferContext, params: PipelineParams) -> Result<PipelineParams> {
    collect(
        ctx,
        params,
        "plugins",
        "plugin_files",
        &[Component::Plugins, Component::MuPlugins],
    )
}

fn themes(ctx: &TransferContext, params: PipelineParams) -> Result<PipelineParams> {
    collect(ctx, params, "themes", "theme_files", &[Component::Themes])
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn archive(ctx: &TransferContext, mut params: PipelineParams) -> Result<PipelineParams> {
    let scratch = scratch_dir(ctx, &params)?;
    let name = params.require_str("archive")?.to_string();
    let dest = ctx.packer.archives_dir().join(&name);

    let dump: DatabaseDump = read_json(&scratch.join(DATABASE_FILE))?;
    let mut payload = site_payload(&dump, ArchiveType::FullSite)?;
    if let Some(package) = params.get("package") {
        payload["package"] = package.clone();
    }

    let mut assets = Vec::new();
    let mut includes = Vec::new();
    if params.include("database") {
        includes.push("database".to_string());
    }
    for component in Component::ALL {
        let path = scratch.join(list_file(component));
        if !path.exists() {
            continue;
        }
        let files: Vec<SiteFile> = read_json(&path)?;
        if files.is_empty() {
            continue;
        }
        assets.extend(assets_for(component, &files));
        includes.push(component.as_str().to_string());
    }

    let label = params
        .get_str("label")
        .map(str::to_string)
        .unwrap_or_else(|| format!("Export of {}", dump.site_url));
    let mut meta = ArchiveMeta::new(ArchiveType::FullSite, &label);
    meta.includes = includes;
    ctx.packer.create_archive_at(&dest, &payload, meta, &assets, &|| false)?;

    let size = fs::metadata(&dest)?.len();
    tracing::info!(archive = %dest.display(), size, assets = assets.len(), "Export archive written");
    params.set("archive_path", dest.to_string_lossy().into_owned());
    params.set("archive_size", size);
    params.set_status("Building archive", &format!("{} ({} bytes)", name, size));
    Ok(params)
}

fn cleanup(ctx: &TransferContext, mut params: PipelineParams) -> Result<PipelineParams> {
    let scratch = scratch_dir(ctx, &params)?;
    if scratch.exists() {
        fs::remove_dir_all(&scratch)?;
    }
    if let Some(lock_id) = params.lock_id().map(str::to_string) {
        ctx.lock.release(&lock_id)?;
        params.remove("lock_id");
    }
    let archive = params.get_str("archive").unwrap_or_default().to_string();
    params.set_status("Export complete", &archive);
    params.set("download", Value::String(archive));
    Ok(params)
}
