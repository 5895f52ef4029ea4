//! Import steps: verify a container, snapshot the live site, then replay
//! the database, options, files and entities onto it.

use super::{scratch_dir, PipelineParams, StepDef};
use crate::archive::{self, ArchiveType, Manifest, FORMAT_VERSION};
use crate::entity;
use crate::recovery::restore::{restore_component, restore_database, LEGACY_SQL_ENTRY};
use crate::site::{Component, User};
use crate::{Result, TransferContext, TransferError};
use serde_json::{json, Map, Value};
use std::fs;
use std::path::PathBuf;

/// The job lock is held from the first step on.
pub const LOCK_FROM: i64 = 5;

pub static STEPS: &[StepDef] = &[
    StepDef { priority: 5, name: "upload", run: upload },
    StepDef { priority: 10, name: "encryption", run: encryption },
    StepDef { priority: 20, name: "validate", run: validate },
    StepDef { priority: 30, name: "compatibility", run: compatibility },
    StepDef { priority: 40, name: "enumerate", run: enumerate },
    StepDef { priority: 50, name: "confirm", run: confirm },
    StepDef { priority: 55, name: "snapshot", run: snapshot },
    StepDef { priority: 60, name: "database", run: database },
    StepDef { priority: 70, name: "options", run: options },
    StepDef { priority: 80, name: "media", run: media },
    StepDef { priority: 90, name: "content", run: content },
    StepDef { priority: 100, name: "mu-plugins", run: mu_plugins },
    StepDef { priority: 110, name: "plugins", run: plugins },
    StepDef { priority: 120, name: "themes", run: themes },
    StepDef { priority: 130, name: "users", run: users },
    StepDef { priority: 140, name: "permalinks", run: permalinks },
    StepDef { priority: 150, name: "done", run: done },
    StepDef { priority: 160, name: "cleanup", run: cleanup },
];

const PAYLOAD_FILE: &str = "payload.json";
const MANIFEST_FILE: &str = "manifest.json";

fn archive_path(ctx: &TransferContext, params: &PipelineParams) -> Result<PathBuf> {
    ctx.packer.resolve(params.require_str("archive")?)
}

fn archive_type(params: &PipelineParams) -> Result<ArchiveType> {
    let value = params
        .get("archive_type")
        .cloned()
        .ok_or_else(|| TransferError::Format("missing parameter 'archive_type'".into()))?;
    serde_json::from_value(value).map_err(|e| TransferError::Format(format!("archive_type: {}", e)))
}

fn load_payload(ctx: &TransferContext, params: &PipelineParams) -> Result<Value> {
    let bytes = fs::read(scratch_dir(ctx, params)?.join(PAYLOAD_FILE))?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn load_manifest(ctx: &TransferContext, params: &PipelineParams) -> Result<Manifest> {
    let bytes = fs::read(scratch_dir(ctx, params)?.join(MANIFEST_FILE))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Number of archived files of `component`, as counted by `enumerate`.
fn component_count(params: &PipelineParams, component: Component) -> u64 {
    params
        .get("components")
        .and_then(|c| c.get(component.as_str()))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

fn upload(ctx: &TransferContext, mut params: PipelineParams) -> Result<PipelineParams> {
    fs::create_dir_all(scratch_dir(ctx, &params)?)?;

    if params.archive().is_none() {
        let job = params.require_str("upload_job")?.to_string();
        let dest = ctx.packer.archives_dir().join(format!("upload-{}", job));
        ctx.chunks.take_upload(&job, &dest)?;
        params.set("archive", format!("upload-{}", job));
    }

    let path = archive_path(ctx, &params)?;
    if !path.is_file() {
        return Err(TransferError::NotFound(format!("archive {}", path.display())));
    }
    let message = format!("Using {}", path.display());
    params.set_status("Receiving archive", &message);
    Ok(params)
}

fn encryption(_ctx: &TransferContext, mut params: PipelineParams) -> Result<PipelineParams> {
    params.set("encrypted", false);
    Ok(params)
}

fn validate(ctx: &TransferContext, mut params: PipelineParams) -> Result<PipelineParams> {
    let path = archive_path(ctx, &params)?;
    let extracted = archive::extract(&path)?;
    let scratch = scratch_dir(ctx, &params)?;
    fs::write(scratch.join(PAYLOAD_FILE), serde_json::to_vec(&extracted.payload)?)?;
    fs::write(scratch.join(MANIFEST_FILE), serde_json::to_vec_pretty(&extracted.manifest)?)?;

    params.set("archive_type", extracted.archive_type.as_str());
    params.set("label", extracted.manifest.label.as_str());
    params.set_status(
        "Validating archive",
        &format!("{} archive '{}' verified", extracted.archive_type, extracted.manifest.label),
    );
    Ok(params)
}

fn compatibility(ctx: &TransferContext, mut params: PipelineParams) -> Result<PipelineParams> {
    let manifest = load_manifest(ctx, &params)?;
    if manifest.format_version > FORMAT_VERSION {
        return Err(TransferError::Format(format!(
            "archive format {} is newer than supported format {}",
            manifest.format_version, FORMAT_VERSION
        )));
    }
    params.set("format_version", manifest.format_version);
    params.set("producer_version", manifest.producer_version.as_str());
    Ok(params)
}

fn enumerate(ctx: &TransferContext, mut params: PipelineParams) -> Result<PipelineParams> {
    let path = archive_path(ctx, &params)?;
    let entries = archive::list_entries(&path)?;

    let mut components = Map::new();
    for component in Component::ALL {
        let prefix = component.archive_prefix();
        let count = entries.iter().filter(|e| e.name.starts_with(&prefix)).count();
        components.insert(component.as_str().to_string(), Value::from(count));
    }
    let media = entries.iter().filter(|e| e.name.starts_with("media/")).count();
    let payload = load_payload(ctx, &params)?;
    let tables = payload
        .get("database")
        .and_then(|d| d.get("tables"))
        .and_then(Value::as_object)
        .map(|t| t.len())
        .unwrap_or(0);
    let legacy_sql = entries.iter().any(|e| e.name == LEGACY_SQL_ENTRY);

    let (site_url, home_url) = ctx.site.current_urls()?;
    params.set("target_site_url", site_url);
    params.set("target_home_url", home_url);
    if let Some(user_id) = params.user_id() {
        if let Some(user) = ctx.site.users.get_user(user_id)? {
            params.set("user", serde_json::to_value(user)?);
        }
    }

    params.set("components", Value::Object(components));
    params.set("media_files", media);
    params.set("tables", tables);
    params.set("legacy_sql", legacy_sql);
    params.set_status("Reading archive", &format!("{} entries, {} tables", entries.len(), tables));
    Ok(params)
}

fn confirm(ctx: &TransferContext, mut params: PipelineParams) -> Result<PipelineParams> {
    if params.confirmed() {
        params.remove("requires_confirmation");
        params.remove("confirmation");
        params.set_status("Confirmed", "Import confirmed");
        return Ok(params);
    }

    let manifest = load_manifest(ctx, &params)?;
    let confirmation = json!({
        "label": manifest.label,
        "type": manifest.archive_type.as_str(),
        "created_at": manifest.created_at.to_rfc3339(),
        "components": params.get("components").cloned().unwrap_or_else(|| json!({})),
        "tables": params.get_i64("tables").unwrap_or(0),
    });
    params.set("requires_confirmation", true);
    params.set("confirmation", confirmation);
    params.set_status(
        "Confirm import",
        &format!("Importing '{}' replaces data on this site", manifest.label),
    );
    Ok(params)
}

fn snapshot(ctx: &TransferContext, mut params: PipelineParams) -> Result<PipelineParams> {
    if params.get_bool("skip_snapshot") {
        params.set_status("Snapshot", "Skipped on request");
        return Ok(params);
    }
    let include_plugins = component_count(&params, Component::Plugins) > 0
        || component_count(&params, Component::MuPlugins) > 0;
    let include_themes = component_count(&params, Component::Themes) > 0;
    let label = format!("Before import of {}", params.get_str("label").unwrap_or("archive"));

    let snapshot = ctx.snapshots.create(&label, include_plugins, include_themes)?;
    params.set("snapshot_id", snapshot.id.as_str());
    params.set_status("Snapshot", &format!("Created snapshot {}", snapshot.id));
    Ok(params)
}

fn database(ctx: &TransferContext, mut params: PipelineParams) -> Result<PipelineParams> {
    let archive_type = archive_type(&params)?;
    if !archive_type.is_site_level() && !params.get_bool("legacy_sql") {
        return Ok(params);
    }
    let path = archive_path(ctx, &params)?;
    let payload = load_payload(ctx, &params)?;
    let restored = restore_database(&ctx.site, &path, &payload)?;

    params.set_status(
        "Importing database",
        &format!("{} tables, {} rows", restored.tables, restored.rows),
    );
    params.set("database", serde_json::to_value(restored)?);
    Ok(params)
}

fn options(ctx: &TransferContext, mut params: PipelineParams) -> Result<PipelineParams> {
    let archive_type = archive_type(&params)?;
    let payload = load_payload(ctx, &params)?;
    let options = entity::payload_options(archive_type, &payload)?;
    if !options.is_empty() {
        let applied = entity::apply_options(&ctx.site, &options)?;
        params.set("options_applied", applied);
        params.set_status("Importing options", &format!("{} options", applied));
    }
    Ok(params)
}

/// Extract one component if the archive carries files for it.
fn restore_files(
    ctx: &TransferContext,
    mut params: PipelineParams,
    component: Component,
) -> Result<PipelineParams> {
    if component_count(&params, component) == 0 {
        return Ok(params);
    }
    let path = archive_path(ctx, &params)?;
    let written = restore_component(&ctx.site, &path, component)?;
    tracing::info!(component = component.as_str(), files = written, "Component restored");
    params.set_status(
        &format!("Importing {}", component.as_str()),
        &format!("{} files", written),
    );
    Ok(params)
}

fn media(ctx: &TransferContext, params: PipelineParams) -> Result<PipelineParams> {
    restore_files(ctx, params, Component::Uploads)
}

fn content(ctx: &TransferContext, params: PipelineParams) -> Result<PipelineParams> {
    let mut params = restore_files(ctx, params, Component::Content)?;

    let archive_type = archive_type(&params)?;
    if matches!(archive_type, ArchiveType::Page | ArchiveType::Form | ArchiveType::Bundle) {
        let path = archive_path(ctx, &params)?;
        let payload = load_payload(ctx, &params)?;
        let manifest = load_manifest(ctx, &params)?;
        let summary = entity::import_content(&ctx.site, &path, archive_type, &payload, &manifest.media)?;
        params.set_status(
            "Importing content",
            &format!(
                "{} posts, {} media imported, {} reused",
                summary.posts.len(),
                summary.media_imported,
                summary.media_reused
            ),
        );
        params.set("imported", serde_json::to_value(summary)?);
    }
    Ok(params)
}

fn mu_plugins(ctx: &TransferContext, params: PipelineParams) -> Result<PipelineParams> {
    restore_files(ctx, params, Component::MuPlugins)
}

fn plugins(ctx: &TransferContext, params: PipelineParams) -> Result<PipelineParams> {
    restore_files(ctx, params, Component::Plugins)
}

fn themes(ctx: &TransferContext, params: PipelineParams) -> Result<PipelineParams> {
    restore_files(ctx, params, Component::Themes)
}

fn users(ctx: &TransferContext, mut params: PipelineParams) -> Result<PipelineParams> {
    let Some(user) = params.get("user").cloned() else {
        return Ok(params);
    };
    let user: User = serde_json::from_value(user)?;
    if ctx.site.users.get_user(user.id)?.as_ref() != Some(&user) {
        ctx.site.users.upsert_user(&user)?;
        tracing::info!(user_id = user.id, "Importing user restored");
        params.set_status("Users", &format!("Restored user {}", user.login));
    }
    Ok(params)
}

fn permalinks(ctx: &TransferContext, params: PipelineParams) -> Result<PipelineParams> {
    ctx.site.options.set("rewrite_rules", &Value::String(String::new()))?;
    Ok(params)
}

fn set_complete(params: &mut PipelineParams) {
    let label = params.get_str("label").unwrap_or("archive").to_string();
    params.set_status("Import complete", &format!("Imported '{}'", label));
}

fn done(_ctx: &TransferContext, mut params: PipelineParams) -> Result<PipelineParams> {
    set_complete(&mut params);
    Ok(params)
}

fn cleanup(ctx: &TransferContext, mut params: PipelineParams) -> Result<PipelineParams> {
    let scratch = scratch_dir(ctx, &params)?;
    if scratch.exists() {
        fs::remove_dir_all(&scratch)?;
    }
    if !params.get_bool("keep_archive") {
        let path = archive_path(ctx, &params)?;
        if path.exists() {
            fs::remove_file(&path)?;
        }
    }
    if let Some(lock_id) = params.lock_id().map(str::to_string) {
        ctx.lock.release(&lock_id)?;
        params.remove("lock_id");
    }
    set_complete(&mut params);
    Ok(params)
}
