use crate::config::AppConfig;
use crate::db::connection::DbPool;
use crate::services::run_history::RunHistory;
use std::sync::Arc;
use transfer_engine::pipeline::{Pipeline, TokioContinuation};
use transfer_engine::TransferContext;

pub struct AppState {
    pub db: DbPool,
    pub config: AppConfig,
    pub ctx: Arc<TransferContext>,
    pub pipeline: Pipeline,
}

impl AppState {
    /// Must be called inside the tokio runtime; pipeline steps run on its
    /// blocking pool.
    pub fn new(db: DbPool, config: AppConfig, ctx: Arc<TransferContext>) -> Self {
        let continuation = TokioContinuation::new(tokio::runtime::Handle::current());
        let pipeline = Pipeline::new(ctx.clone(), Arc::new(continuation))
            .with_observer(Arc::new(RunHistory::new(db.clone())));
        Self {
            db,
            config,
            ctx,
            pipeline,
        }
    }
}
