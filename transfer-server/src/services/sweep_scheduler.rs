use crate::models::transfer_run;
use crate::state::AppState;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

/// Finished runs older than this drop out of the history table.
const HISTORY_RETENTION_DAYS: i64 = 30;

pub struct SweepScheduler {
    scheduler: Mutex<JobScheduler>,
    state: Arc<AppState>,
}

impl SweepScheduler {
    pub async fn new(state: Arc<AppState>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            state,
        })
    }

    /// Register the periodic sweep on `cron_expression` (six fields, seconds first).
    pub async fn schedule_sweep(&self, cron_expression: &str) -> anyhow::Result<()> {
        let state = self.state.clone();

        let job = Job::new_async(cron_expression, move |_uuid, _lock| {
            let state = state.clone();
            Box::pin(async move {
                if let Err(e) = run_sweep(state).await {
                    tracing::error!(error = %e, "Scheduled sweep failed");
                }
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(cron = %cron_expression, "Sweep scheduled");
        Ok(())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}

/// Expire stale chunk jobs and scratch directories, then prune old history.
pub async fn run_sweep(state: Arc<AppState>) -> anyhow::Result<()> {
    let ctx = state.ctx.clone();
    let db = state.db.clone();
    let (summary, pruned) = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        let summary = ctx.sweep()?;
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(HISTORY_RETENTION_DAYS)).to_rfc3339();
        let conn = db.get()?;
        let pruned = transfer_run::delete_finished_before(&conn, &cutoff)?;
        Ok((summary, pruned))
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    tracing::info!(
        expired_jobs = summary.expired_jobs,
        scratch_dirs = summary.scratch_dirs,
        pruned_runs = pruned,
        "Scheduled sweep finished"
    );
    Ok(())
}
