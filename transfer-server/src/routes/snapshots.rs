use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use transfer_engine::recovery::{RestoreOutcome, Snapshot};

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_snapshots).post(create_snapshot))
        .route("/{id}", get(get_snapshot).delete(delete_snapshot))
        .route("/{id}/restore", post(restore_snapshot))
}

async fn list_snapshots(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Snapshot>>, AppError> {
    let ctx = state.ctx.clone();
    let snapshots = tokio::task::spawn_blocking(move || ctx.snapshots.all())
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(snapshots))
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateSnapshotRequest {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub include_plugins: bool,
    #[serde(default)]
    pub include_themes: bool,
}

async fn create_snapshot(
    State(state): State<Arc<AppState>>,
    body: Option<Json<CreateSnapshotRequest>>,
) -> Result<(StatusCode, Json<Snapshot>), AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let ctx = state.ctx.clone();
    let snapshot = tokio::task::spawn_blocking(move || {
        ctx.snapshots
            .create(&body.label, body.include_plugins, body.include_themes)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

async fn get_snapshot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Snapshot>, AppError> {
    let ctx = state.ctx.clone();
    let snapshot = tokio::task::spawn_blocking(move || ctx.snapshots.get(&id))
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    match snapshot {
        Some(s) => Ok(Json(s)),
        None => Err(AppError::NotFound("Snapshot not found".into())),
    }
}

async fn delete_snapshot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let ctx = state.ctx.clone();
    let deleted = tokio::task::spawn_blocking(move || ctx.snapshots.delete(&id))
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    if deleted {
        Ok(Json(json!({ "deleted": true })))
    } else {
        Err(AppError::NotFound("Snapshot not found".into()))
    }
}

async fn restore_snapshot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RestoreOutcome>, AppError> {
    let ctx = state.ctx.clone();
    let outcome = tokio::task::spawn_blocking(move || ctx.snapshots.restore(&id, &ctx.lock))
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(outcome))
}
