use crate::error::AppError;
use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use std::sync::Arc;
use transfer_engine::recovery::LockRecord;

/// The live job lock, or `null` when no migration is running.
pub async fn current_lock(State(state): State<Arc<AppState>>) -> Result<Json<Option<LockRecord>>, AppError> {
    let ctx = state.ctx.clone();
    let lock = tokio::task::spawn_blocking(move || ctx.lock.current())
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(lock))
}
