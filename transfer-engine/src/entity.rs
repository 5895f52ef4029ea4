//! Entity-level archives: single pages and forms, option groups, and bundles
//! of several entities with their options.
//!
//! Media referenced by an entity (attached files and the featured image)
//! travel as `media/<id>-<filename>` assets. On import every asset is first
//! matched by checksum against the local library and only sideloaded when no
//! copy exists; attachment ids and URLs in the content are remapped.

use crate::archive::checksum::{digests_match, sha256_file};
use crate::archive::{self, ArchiveMeta, ArchiveType, Asset, AttachmentManifestEntry, Packer};
use crate::site::{Attachment, MediaDetails, PostFields, Site};
use crate::{Result, TransferError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

const THUMBNAIL_META: &str = "_thumbnail_id";

/// Single entity payload (`page` and `form` archives, bundle items).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityPayload {
    pub id: i64,
    pub post_type: String,
    pub title: String,
    pub slug: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub excerpt: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub menu_order: i64,
    #[serde(default)]
    pub meta: BTreeMap<String, Value>,
    #[serde(default)]
    pub terms: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BundlePayload {
    pub items: Vec<EntityPayload>,
    #[serde(default)]
    pub options: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptionsPagePayload {
    pub name: String,
    #[serde(default)]
    pub options: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub posts: Vec<i64>,
    pub media_reused: usize,
    pub media_imported: usize,
    pub options: usize,
}

fn load_entity(site: &Site, id: i64) -> Result<EntityPayload> {
    let post = site
        .content
        .get_post_by_id(id)?
        .ok_or_else(|| TransferError::NotFound(format!("post {}", id)))?;
    Ok(EntityPayload {
        id: post.id,
        post_type: post.post_type,
        title: post.title,
        slug: post.slug,
        content: post.content,
        excerpt: post.excerpt,
        status: post.status,
        menu_order: post.menu_order,
        meta: site.content.all_meta(id)?,
        terms: site.content.all_terms(id)?,
    })
}

fn manifest_entry(attachment: &Attachment) -> AttachmentManifestEntry {
    let checksum = if attachment.checksum.is_empty() {
        sha256_file(&attachment.path).unwrap_or_default()
    } else {
        attachment.checksum.clone()
    };
    AttachmentManifestEntry {
        original_id: attachment.id,
        parent_id: attachment.parent_id,
        filename: attachment.filename.clone(),
        mime_type: attachment.mime_type.clone(),
        filesize: attachment.filesize,
        checksum,
        source_url: attachment.source_url.clone(),
        title: attachment.title.clone(),
        alt: attachment.alt.clone(),
        caption: attachment.caption.clone(),
        description: attachment.description.clone(),
        archive_path: format!("media/{}-{}", attachment.id, attachment.filename),
    }
}

/// Attached files plus the featured image of each entity, deduplicated by id.
fn collect_media(site: &Site, entities: &[EntityPayload]) -> Result<(Vec<AttachmentManifestEntry>, Vec<Asset>)> {
    let mut seen = std::collections::BTreeSet::new();
    let mut attachments = Vec::new();

    for entity in entities {
        for attachment in site.media.attachments_for(entity.id)? {
            if seen.insert(attachment.id) {
                attachments.push(attachment);
            }
        }
        let thumbnail = entity.meta.get(THUMBNAIL_META).and_then(value_as_id);
        if let Some(thumbnail) = thumbnail {
            if !seen.contains(&thumbnail) {
                if let Some(attachment) = site.media.get_attachment(thumbnail)? {
                    seen.insert(attachment.id);
                    attachments.push(attachment);
                }
            }
        }
    }

    let entries: Vec<_> = attachments.iter().map(manifest_entry).collect();
    let assets = attachments
        .iter()
        .zip(&entries)
        .map(|(attachment, entry)| Asset {
            source: attachment.path.clone(),
            target: entry.archive_path.clone(),
        })
        .collect();
    Ok((entries, assets))
}

fn value_as_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Export one page or form.
pub fn export_entity(site: &Site, packer: &Packer, archive_type: ArchiveType, id: i64) -> Result<PathBuf> {
    if !matches!(archive_type, ArchiveType::Page | ArchiveType::Form) {
        return Err(TransferError::Format(format!(
            "{} is not a single-entity archive type",
            archive_type
        )));
    }
    let entity = load_entity(site, id)?;
    let (media, assets) = collect_media(site, std::slice::from_ref(&entity))?;

    let mut meta = ArchiveMeta::new(archive_type, &entity.title);
    meta.media = media;
    let payload = serde_json::to_value(&entity)?;
    let path = packer.create_archive(&payload, meta, &assets)?;
    tracing::info!(post_id = id, archive = %path.display(), "Entity exported");
    Ok(path)
}

/// Export every option whose name starts with `name`.
pub fn export_options_page(site: &Site, packer: &Packer, name: &str) -> Result<PathBuf> {
    let options: Map<String, Value> = site.options.all_with_prefix(name)?.into_iter().collect();
    let payload = serde_json::to_value(OptionsPagePayload {
        name: name.to_string(),
        options,
    })?;
    packer.create_archive(&payload, ArchiveMeta::new(ArchiveType::OptionsPage, name), &[])
}

/// Export several entities and option groups into one bundle.
pub fn export_bundle(
    site: &Site,
    packer: &Packer,
    label: &str,
    ids: &[i64],
    option_prefixes: &[String],
) -> Result<PathBuf> {
    let items = ids
        .iter()
        .map(|id| load_entity(site, *id))
        .collect::<Result<Vec<_>>>()?;
    let mut options = Map::new();
    for prefix in option_prefixes {
        options.extend(site.options.all_with_prefix(prefix)?);
    }
    let (media, assets) = collect_media(site, &items)?;

    let mut meta = ArchiveMeta::new(ArchiveType::Bundle, label);
    meta.media = media;
    let payload = serde_json::to_value(BundlePayload { items, options })?;
    packer.create_archive(&payload, meta, &assets)
}

/// Import an entity archive (page, form, options_page or bundle).
pub fn import_archive(site: &Site, archive_path: &Path) -> Result<ImportSummary> {
    let extracted = archive::extract(archive_path)?;
    import_payload(site, archive_path, extracted.archive_type, &extracted.payload, &extracted.media)
}

/// Import an already verified entity payload.
pub fn import_payload(
    site: &Site,
    archive_path: &Path,
    archive_type: ArchiveType,
    payload: &Value,
    media: &[AttachmentManifestEntry],
) -> Result<ImportSummary> {
    let mut summary = import_content(site, archive_path, archive_type, payload, media)?;
    summary.options += apply_options(site, &payload_options(archive_type, payload)?)?;

    tracing::info!(
        posts = summary.posts.len(),
        media_reused = summary.media_reused,
        media_imported = summary.media_imported,
        options = summary.options,
        "Entity import finished"
    );
    Ok(summary)
}

fn decode<T: serde::de::DeserializeOwned>(archive_type: ArchiveType, payload: &Value) -> Result<T> {
    serde_json::from_value(payload.clone())
        .map_err(|e| TransferError::Format(format!("{} payload: {}", archive_type, e)))
}

/// Posts and media of an entity payload. Options are left alone.
pub fn import_content(
    site: &Site,
    archive_path: &Path,
    archive_type: ArchiveType,
    payload: &Value,
    media: &[AttachmentManifestEntry],
) -> Result<ImportSummary> {
    let mut summary = ImportSummary::default();
    match archive_type {
        ArchiveType::Page | ArchiveType::Form => {
            let entity: EntityPayload = decode(archive_type, payload)?;
            import_entities(site, archive_path, &[entity], media, &mut summary)?;
        }
        ArchiveType::Bundle => {
            let bundle: BundlePayload = decode(archive_type, payload)?;
            import_entities(site, archive_path, &bundle.items, media, &mut summary)?;
        }
        ArchiveType::OptionsPage => {}
        ArchiveType::Snapshot | ArchiveType::FullSite => {
            return Err(TransferError::Format(format!(
                "{} archives are restored through the import pipeline",
                archive_type
            )));
        }
    }
    Ok(summary)
}

/// Options carried by a bundle or options page; empty for other types.
pub fn payload_options(archive_type: ArchiveType, payload: &Value) -> Result<Map<String, Value>> {
    match archive_type {
        ArchiveType::Bundle => Ok(decode::<BundlePayload>(archive_type, payload)?.options),
        ArchiveType::OptionsPage => Ok(decode::<OptionsPagePayload>(archive_type, payload)?.options),
        _ => Ok(Map::new()),
    }
}

pub fn apply_options(site: &Site, options: &Map<String, Value>) -> Result<usize> {
    for (key, value) in options {
        site.options.set(key, value)?;
    }
    Ok(options.len())
}

fn import_entities(
    site: &Site,
    archive_path: &Path,
    entities: &[EntityPayload],
    media: &[AttachmentManifestEntry],
    summary: &mut ImportSummary,
) -> Result<()> {
    // Posts first, so attachments can be parented to the new ids
    let mut post_ids: HashMap<i64, i64> = HashMap::new();
    for entity in entities {
        let id = site.content.upsert_post(&post_fields(entity, None, &entity.content))?;
        post_ids.insert(entity.id, id);
    }

    let mut attachment_ids: HashMap<i64, i64> = HashMap::new();
    let mut urls: Vec<(String, String)> = Vec::new();
    for entry in media {
        let parent = post_ids.get(&entry.parent_id).copied().unwrap_or(0);
        let local_id = import_media(site, archive_path, entry, parent, summary)?;
        attachment_ids.insert(entry.original_id, local_id);
        if let Some(local) = site.media.get_attachment(local_id)? {
            if !entry.source_url.is_empty() && entry.source_url != local.source_url {
                urls.push((entry.source_url.clone(), local.source_url));
            }
        }
    }

    for entity in entities {
        let id = post_ids[&entity.id];
        let content = urls
            .iter()
            .fold(entity.content.clone(), |acc, (from, to)| acc.replace(from, to));
        if content != entity.content {
            site.content.upsert_post(&post_fields(entity, Some(id), &content))?;
        }

        for (key, value) in &entity.meta {
            let value = if key == THUMBNAIL_META {
                match value_as_id(value).and_then(|old| attachment_ids.get(&old)) {
                    Some(new_id) => Value::from(*new_id),
                    None => value.clone(),
                }
            } else {
                value.clone()
            };
            site.content.set_meta(id, key, &value)?;
        }
        for (taxonomy, terms) in &entity.terms {
            site.content.set_terms(id, taxonomy, terms)?;
        }
        summary.posts.push(id);
    }

    Ok(())
}

fn post_fields(entity: &EntityPayload, id: Option<i64>, content: &str) -> PostFields {
    PostFields {
        id,
        post_type: entity.post_type.clone(),
        title: entity.title.clone(),
        slug: entity.slug.clone(),
        content: content.to_string(),
        excerpt: entity.excerpt.clone(),
        status: if entity.status.is_empty() {
            "publish".to_string()
        } else {
            entity.status.clone()
        },
        parent_id: 0,
        menu_order: entity.menu_order,
    }
}

/// Reuse a local attachment with the same checksum, or sideload the asset.
fn import_media(
    site: &Site,
    archive_path: &Path,
    entry: &AttachmentManifestEntry,
    parent_id: i64,
    summary: &mut ImportSummary,
) -> Result<i64> {
    if !entry.checksum.is_empty() {
        if let Some(existing) = site.media.find_by_checksum(&entry.checksum)? {
            tracing::debug!(original_id = entry.original_id, attachment_id = existing, "Reusing attachment with matching checksum");
            summary.media_reused += 1;
            return Ok(existing);
        }
    }

    let temp = archive::extract_media_file(&entry.archive_path, archive_path)?;
    if !entry.checksum.is_empty() {
        let actual = sha256_file(&temp);
        let matches = actual.as_ref().is_ok_and(|actual| digests_match(&entry.checksum, actual));
        if !matches {
            let _ = std::fs::remove_file(&temp);
            let actual = actual?;
            return Err(TransferError::Integrity(format!(
                "media {} does not match its checksum (expected {}, got {})",
                entry.archive_path, entry.checksum, actual
            )));
        }
    }
    let details = MediaDetails {
        filename: entry.filename.clone(),
        mime_type: entry.mime_type.clone(),
        title: entry.title.clone(),
        alt: entry.alt.clone(),
        caption: entry.caption.clone(),
        description: entry.description.clone(),
    };
    let result = site.media.sideload_file(&temp, parent_id, &details);
    let _ = std::fs::remove_file(&temp);

    let id = result?;
    summary.media_imported += 1;
    Ok(id)
}
