//! transfer-cli - Main entry point
//!
//! Drives exports, imports and snapshots against a local site without the
//! HTTP server.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use transfer_engine::archive::{self, site_bundle};
use transfer_engine::pipeline::{InlineContinuation, Outcome, Pipeline, PipelineParams, RunState};
use transfer_engine::{utils, Config, TransferContext};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Site root (overrides config)
    #[arg(long)]
    site_root: Option<PathBuf>,

    /// Working data directory (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Export the whole site into a full-site archive
    Export {
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        no_database: bool,
        #[arg(long)]
        no_media: bool,
        #[arg(long)]
        no_content: bool,
        #[arg(long)]
        no_plugins: bool,
        #[arg(long)]
        no_themes: bool,
    },
    /// Import an archive into the site
    Import {
        archive: PathBuf,
        /// Confirm the import without prompting
        #[arg(short, long)]
        yes: bool,
        #[arg(long)]
        skip_snapshot: bool,
        /// Importing user, re-created if the database restore removes it
        #[arg(long)]
        user_id: Option<i64>,
    },
    /// Print the manifest and entries of an archive
    Inspect { archive: PathBuf },
    #[command(subcommand)]
    Snapshot(SnapshotCommand),
    /// Purge expired chunk jobs and stale scratch directories
    Sweep,
}

#[derive(Subcommand, Debug)]
enum SnapshotCommand {
    Create {
        #[arg(long, default_value = "")]
        label: String,
        #[arg(long)]
        plugins: bool,
        #[arg(long)]
        themes: bool,
    },
    List,
    Delete { id: String },
    Restore { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(root) = &args.site_root {
        config.site.root = root.clone();
    }
    if let Some(data_dir) = &args.data_dir {
        config.storage.data_dir = data_dir.clone();
    }

    let log_level = args.log_level.clone().unwrap_or_else(|| config.log.level.clone());
    utils::logger::init(&log_level)?;

    tokio::task::spawn_blocking(move || run(config, args.command))
        .await
        .context("command task failed")?
}

fn run(config: Config, command: Command) -> Result<()> {
    let open = || TransferContext::open(config.clone());
    match command {
        Command::Inspect { archive } => inspect(&archive)?,
        Command::Export {
            label,
            no_database,
            no_media,
            no_content,
            no_plugins,
            no_themes,
        } => {
            let ctx = open()?;
            let mut params = PipelineParams::new();
            params.set(
                "include",
                json!({
                    "database": !no_database,
                    "media": !no_media,
                    "content": !no_content,
                    "plugins": !no_plugins,
                    "themes": !no_themes,
                }),
            );
            if let Some(label) = label {
                params.set("label", label);
            }
            let pipeline = Pipeline::new(ctx.clone(), Arc::new(InlineContinuation));
            let outcome = pipeline.start_export(params)?;
            let params = finish(&pipeline, outcome)?;
            println!("{}", params.get_str("archive_path").unwrap_or_default());
        }
        Command::Import {
            archive,
            yes,
            skip_snapshot,
            user_id,
        } => {
            let ctx = open()?;
            let name = stage_archive(&ctx, &archive)?;
            let mut params = PipelineParams::new();
            params.set("archive", name);
            params.set("skip_snapshot", skip_snapshot);
            if let Some(user_id) = user_id {
                params.set("user_id", user_id);
            }

            let pipeline = Pipeline::new(ctx.clone(), Arc::new(InlineContinuation));
            let outcome = pipeline.start_import(params)?;
            let storage = outcome
                .params()
                .storage()
                .map(str::to_string)
                .context("pipeline has no storage token")?;

            let status = pipeline.status(&storage)?.context("pipeline wrote no status")?;
            if status.state == RunState::Confirm {
                let checkpoint = pipeline.checkpoint(&storage)?;
                println!(
                    "{}",
                    serde_json::to_string_pretty(checkpoint.get("confirmation").unwrap_or(&json!({})))?
                );
                if !yes {
                    bail!("import needs confirmation; run again with --yes");
                }
                let outcome = pipeline.confirm(&storage)?;
                finish(&pipeline, outcome)?;
            } else {
                finish(&pipeline, outcome)?;
            }
            println!("Import complete");
        }
        Command::Snapshot(SnapshotCommand::Create { label, plugins, themes }) => {
            let ctx = open()?;
            let snapshot = ctx.snapshots.create(&label, plugins, themes)?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Command::Snapshot(SnapshotCommand::List) => {
            let ctx = open()?;
            for snapshot in ctx.snapshots.all()? {
                println!(
                    "{}  {}  {:>12}  {}",
                    snapshot.id,
                    snapshot.created_at.format("%Y-%m-%d %H:%M:%S"),
                    snapshot.size,
                    snapshot.label
                );
            }
        }
        Command::Snapshot(SnapshotCommand::Delete { id }) => {
            let ctx = open()?;
            if !ctx.snapshots.delete(&id)? {
                bail!("snapshot {} not found", id);
            }
        }
        Command::Snapshot(SnapshotCommand::Restore { id }) => {
            let ctx = open()?;
            let outcome = ctx.snapshots.restore(&id, &ctx.lock)?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Sweep => {
            let ctx = open()?;
            let summary = ctx.sweep()?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }
    Ok(())
}

/// With the inline continuation the whole run has happened by the time
/// `start_*` or `confirm` returns; the status record tells how it ended.
fn finish(pipeline: &Pipeline, outcome: Outcome) -> Result<PipelineParams> {
    let storage = outcome
        .params()
        .storage()
        .map(str::to_string)
        .context("pipeline has no storage token")?;
    let status = pipeline.status(&storage)?.context("pipeline wrote no status")?;
    match status.state {
        RunState::Done => Ok(pipeline.checkpoint(&storage)?),
        RunState::Error => bail!("{}: {}", status.title, status.message),
        state => bail!("pipeline stopped in state {}", state.as_str()),
    }
}

/// Copy an archive into the archives directory so the import can own it.
fn stage_archive(ctx: &TransferContext, source: &Path) -> Result<String> {
    let name = source
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} is not a file", source.display()))?
        .to_string();
    let dest = ctx.packer.archives_dir().join(&name);
    if dest != source {
        std::fs::copy(source, &dest)
            .with_context(|| format!("copying {} into {}", source.display(), dest.display()))?;
    }
    Ok(name)
}

fn inspect(path: &Path) -> Result<()> {
    let manifest = archive::read_manifest(path)?;
    println!("{}", serde_json::to_string_pretty(&manifest)?);

    let verified = archive::extract(path);
    match &verified {
        Ok(extracted) if extracted.archive_type.is_site_level() => {
            let dump = site_bundle::dump_from_payload(&extracted.payload)?;
            println!("checksum: ok, {} tables from {}", dump.tables.len(), dump.site_url);
        }
        Ok(_) => println!("checksum: ok"),
        Err(e) => println!("checksum: FAILED ({})", e),
    }

    for entry in archive::list_entries(path)? {
        println!("{:>12}  {}", entry.size, entry.name);
    }
    Ok(())
}
