use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use transfer_engine::chunk::{
    ArchiveFileProducer, ChunkJob, DownloadChunk, DownloadProducer, FullSiteProducer, UploadInit,
    UploadProgress,
};

/// Download source naming a fresh full-site export instead of a stored archive.
const FULL_SITE_SOURCE: &str = "full-site";

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/upload", post(init_upload))
        .route("/upload/{id}", post(upload_chunk))
        .route("/download", post(init_download))
        .route("/download/{id}/{index}", get(download_chunk))
        .route("/{id}", get(job_status).delete(cancel_job))
}

#[derive(Debug, Deserialize)]
pub struct InitUploadRequest {
    pub total_chunks: u64,
    pub checksum: Option<String>,
    pub chunk_size: Option<u64>,
}

async fn init_upload(
    State(state): State<Arc<AppState>>,
    Json(body): Json<InitUploadRequest>,
) -> Result<Json<UploadInit>, AppError> {
    if body.total_chunks == 0 {
        return Err(AppError::BadRequest("total_chunks must be at least 1".into()));
    }
    let ctx = state.ctx.clone();
    let init = tokio::task::spawn_blocking(move || {
        ctx.chunks.init_upload(body.total_chunks, body.checksum, body.chunk_size)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(init))
}

#[derive(Debug, Deserialize)]
pub struct UploadChunkRequest {
    pub index: u64,
    pub chunk: String,
}

async fn upload_chunk(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<UploadChunkRequest>,
) -> Result<Json<UploadProgress>, AppError> {
    let ctx = state.ctx.clone();
    let progress = tokio::task::spawn_blocking(move || {
        ctx.chunks.upload_chunk(&id, body.index, &body.chunk)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(progress))
}

#[derive(Debug, Default, Deserialize)]
pub struct InitDownloadRequest {
    /// Archive name in the archives directory, or `full-site` (the default)
    pub source: Option<String>,
    pub chunk_size: Option<u64>,
}

async fn init_download(
    State(state): State<Arc<AppState>>,
    body: Option<Json<InitDownloadRequest>>,
) -> Result<Json<Value>, AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let ctx = state.ctx.clone();

    let producer: Box<dyn DownloadProducer> = match body.source.as_deref() {
        None | Some(FULL_SITE_SOURCE) => Box::new(FullSiteProducer {
            site: ctx.site.clone(),
            packer: ctx.packer.clone(),
            lock: ctx.lock.clone(),
        }),
        Some(name) => {
            let source = ctx.packer.resolve(name)?;
            if !source.is_file() {
                return Err(AppError::NotFound(format!("archive '{}' not found", name)));
            }
            Box::new(ArchiveFileProducer { source })
        }
    };

    // The producer runs on the blocking pool; creating the job is quick
    let job = ctx.chunks.init_download(producer, body.chunk_size)?;
    Ok(Json(json!({
        "job_id": job.id,
        "status": job.status,
        "chunk_size": job.chunk_size,
    })))
}

async fn download_chunk(
    State(state): State<Arc<AppState>>,
    Path((id, index)): Path<(String, u64)>,
) -> Result<Json<DownloadChunk>, AppError> {
    let ctx = state.ctx.clone();
    let chunk = tokio::task::spawn_blocking(move || ctx.chunks.download_chunk(&id, index))
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(chunk))
}

async fn job_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ChunkJob>, AppError> {
    let ctx = state.ctx.clone();
    let job = tokio::task::spawn_blocking(move || ctx.chunks.status(&id))
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(job))
}

async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let ctx = state.ctx.clone();
    let deleted = tokio::task::spawn_blocking(move || ctx.chunks.cancel(&id))
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(json!({ "deleted": deleted })))
}
