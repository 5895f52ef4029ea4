use crate::db::connection::DbPool;
use crate::models::transfer_run::{self, RunUpdate};
use transfer_engine::pipeline::{PipelineParams, PipelineStatus, RunObserver, RunState, StepTable};

/// Mirrors pipeline status records into the `transfer_runs` table.
///
/// Called from the blocking threads that run pipeline steps, so it talks to
/// SQLite directly. A failed write is logged and never fails the step.
pub struct RunHistory {
    db: DbPool,
}

impl RunHistory {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    fn record(&self, status: &PipelineStatus, params: &PipelineParams) -> anyhow::Result<()> {
        let step = StepTable::for_kind(status.kind)
            .find(status.priority)
            .map(|s| s.name)
            .unwrap_or("");
        let error = match status.state {
            RunState::Error => params.get_str("error"),
            _ => None,
        };
        let conn = self.db.get()?;
        transfer_run::upsert(
            &conn,
            &RunUpdate {
                storage: &status.storage,
                kind: status.kind.as_str(),
                status: status.state.as_str(),
                step,
                title: &status.title,
                message: &status.message,
                archive: params.archive(),
                error,
                started_at: params.get_str("started_at"),
                terminal: status.state.is_terminal(),
            },
        )
    }
}

impl RunObserver for RunHistory {
    fn on_status(&self, status: &PipelineStatus, params: &PipelineParams) {
        if let Err(e) = self.record(status, params) {
            tracing::warn!(storage = %status.storage, error = %e, "Failed to record run history");
        }
    }
}
