use crate::error::AppError;
use crate::models::transfer_run;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use transfer_engine::pipeline::{Outcome, PipelineParams};
use transfer_engine::TransferError;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/exports", post(start_export))
        .route("/api/imports", post(start_import))
        .route("/api/imports/{storage}/confirm", post(confirm_import))
        .route("/api/pipelines/{storage}", get(get_pipeline))
        .route("/api/runs", get(list_runs))
}

fn outcome_json(outcome: Outcome) -> Value {
    let state = match &outcome {
        Outcome::Continued(_) => "running",
        Outcome::ConfirmationRequired(_) => "confirm",
        Outcome::Done(_) => "done",
        Outcome::Idle(_) => "idle",
    };
    let params = outcome.into_params();
    json!({
        "storage": params.storage(),
        "state": state,
        "confirmation": params.get("confirmation"),
        "params": params,
    })
}

/// Refuse a new run up front while another one holds the job lock.
fn ensure_unlocked(state: &AppState) -> Result<(), TransferError> {
    match state.ctx.lock.current()? {
        Some(lock) => Err(TransferError::Conflict(format!("{} is running", lock.context))),
        None => Ok(()),
    }
}

async fn start_export(
    State(state): State<Arc<AppState>>,
    body: Option<Json<PipelineParams>>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let params = body.map(|Json(p)| p).unwrap_or_default();
    let state2 = state.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        ensure_unlocked(&state2)?;
        state2.pipeline.start_export(params)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;
    Ok((StatusCode::ACCEPTED, Json(outcome_json(outcome))))
}

async fn start_import(
    State(state): State<Arc<AppState>>,
    Json(params): Json<PipelineParams>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    if params.archive().is_none() && params.get_str("upload_job").is_none() {
        return Err(AppError::BadRequest("archive or upload_job is required".into()));
    }
    let state2 = state.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        ensure_unlocked(&state2)?;
        state2.pipeline.start_import(params)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;
    Ok((StatusCode::ACCEPTED, Json(outcome_json(outcome))))
}

async fn confirm_import(
    State(state): State<Arc<AppState>>,
    Path(storage): Path<String>,
) -> Result<Json<Value>, AppError> {
    let outcome = tokio::task::spawn_blocking(move || state.pipeline.confirm(&storage))
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(outcome_json(outcome)))
}

async fn get_pipeline(
    State(state): State<Arc<AppState>>,
    Path(storage): Path<String>,
) -> Result<Json<Value>, AppError> {
    let (status, params, run) = tokio::task::spawn_blocking(move || -> Result<_, AppError> {
        let status = state.pipeline.status(&storage)?;
        let params = state.pipeline.checkpoint(&storage)?;
        let conn = state.db.get().map_err(anyhow::Error::from)?;
        let run = transfer_run::find_by_storage(&conn, &storage)?;
        Ok((status, params, run))
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;
    let Some(status) = status else {
        return Err(AppError::NotFound("Pipeline has no status yet".into()));
    };
    Ok(Json(json!({ "status": status, "params": params, "run": run })))
}

#[derive(Deserialize)]
pub struct RunsQuery {
    pub limit: Option<i64>,
}

async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Vec<transfer_run::TransferRun>>, AppError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let db = state.db.clone();
    let runs = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        transfer_run::find_recent(&conn, limit)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(runs))
}
