//! Priority-ordered, resumable export/import pipelines.
//!
//! A pipeline is a static table of `(priority, step)` pairs. The driver runs
//! exactly one step per call, checkpoints the parameter bag, and hands the
//! next step to a [`Continuation`]. The checkpoint lets any later call pick
//! the run up again from its stored priority; priorities only ever grow.

pub mod export;
pub mod import;
pub mod params;
pub mod status;

pub use params::PipelineParams;
pub use status::{PipelineKind, PipelineStatus, RunState, RunStore};

use crate::{Result, TransferContext, TransferError};
use chrono::Utc;
use std::sync::Arc;

pub type StepFn = fn(&TransferContext, PipelineParams) -> Result<PipelineParams>;

pub struct StepDef {
    pub priority: i64,
    pub name: &'static str,
    pub run: StepFn,
}

/// Steps of one pipeline kind, sorted by priority.
pub struct StepTable {
    steps: &'static [StepDef],
    lock_from: i64,
}

impl StepTable {
    pub fn for_kind(kind: PipelineKind) -> Self {
        match kind {
            PipelineKind::Export => Self {
                steps: export::STEPS,
                lock_from: export::LOCK_FROM,
            },
            PipelineKind::Import => Self {
                steps: import::STEPS,
                lock_from: import::LOCK_FROM,
            },
        }
    }

    pub fn steps(&self) -> &'static [StepDef] {
        self.steps
    }

    /// Whether the step at `priority` runs under the job lock.
    pub fn needs_lock(&self, priority: i64) -> bool {
        priority >= self.lock_from
    }

    pub fn first(&self) -> i64 {
        self.steps.first().map(|s| s.priority).unwrap_or(0)
    }

    pub fn find(&self, priority: i64) -> Option<&'static StepDef> {
        self.steps.iter().find(|s| s.priority == priority)
    }

    /// Smallest priority strictly greater than `priority`.
    pub fn next_after(&self, priority: i64) -> Option<i64> {
        self.steps
            .iter()
            .map(|s| s.priority)
            .filter(|p| *p > priority)
            .min()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// One step ran; the next one was handed to the continuation.
    Continued(PipelineParams),
    /// Halted until the run is confirmed.
    ConfirmationRequired(PipelineParams),
    Done(PipelineParams),
    /// No step at the stored priority; nothing ran.
    Idle(PipelineParams),
}

impl Outcome {
    pub fn params(&self) -> &PipelineParams {
        match self {
            Outcome::Continued(p)
            | Outcome::ConfirmationRequired(p)
            | Outcome::Done(p)
            | Outcome::Idle(p) => p,
        }
    }

    pub fn into_params(self) -> PipelineParams {
        match self {
            Outcome::Continued(p)
            | Outcome::ConfirmationRequired(p)
            | Outcome::Done(p)
            | Outcome::Idle(p) => p,
        }
    }
}

/// Schedules the next step of a run. Fire-and-forget: failures surface
/// through the run's status record, never to the dispatcher.
pub trait Continuation: Send + Sync {
    fn dispatch(&self, pipeline: Pipeline, storage: String);
}

/// Runs the next step in the same call chain.
pub struct InlineContinuation;

impl Continuation for InlineContinuation {
    fn dispatch(&self, pipeline: Pipeline, storage: String) {
        if let Err(e) = pipeline.resume(&storage) {
            tracing::error!(storage = %storage, error = %e, "Pipeline stopped");
        }
    }
}

/// Runs every step as its own blocking task on the tokio runtime.
pub struct TokioContinuation {
    handle: tokio::runtime::Handle,
}

impl TokioContinuation {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    pub fn current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }
}

impl Continuation for TokioContinuation {
    fn dispatch(&self, pipeline: Pipeline, storage: String) {
        self.handle.spawn(async move {
            let task_storage = storage.clone();
            match tokio::task::spawn_blocking(move || pipeline.resume(&task_storage)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::error!(storage = %storage, error = %e, "Pipeline stopped"),
                Err(e) => tracing::error!(storage = %storage, error = %e, "Pipeline task panicked"),
            }
        });
    }
}

/// Leaves the run at its checkpoint; the caller drives it.
pub struct ManualContinuation;

impl Continuation for ManualContinuation {
    fn dispatch(&self, _pipeline: Pipeline, storage: String) {
        tracing::debug!(storage = %storage, "Next step left to the caller");
    }
}

/// Notified whenever a run's status record changes.
pub trait RunObserver: Send + Sync {
    fn on_status(&self, status: &PipelineStatus, params: &PipelineParams);
}

#[derive(Clone)]
pub struct Pipeline {
    ctx: Arc<TransferContext>,
    continuation: Arc<dyn Continuation>,
    observer: Option<Arc<dyn RunObserver>>,
}

impl Pipeline {
    pub fn new(ctx: Arc<TransferContext>, continuation: Arc<dyn Continuation>) -> Self {
        Self {
            ctx,
            continuation,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn context(&self) -> &Arc<TransferContext> {
        &self.ctx
    }

    fn runs(&self) -> RunStore {
        RunStore::new(&self.ctx.layout.pipelines_dir())
    }

    /// Start an export. `options` may carry `include`, `label` and `user_id`.
    pub fn start_export(&self, options: PipelineParams) -> Result<Outcome> {
        self.start(PipelineKind::Export, options)
    }

    /// Start an import of `archive` (a file in the archives directory) or of
    /// a completed chunk upload named by `upload_job`.
    pub fn start_import(&self, options: PipelineParams) -> Result<Outcome> {
        if options.get_str("archive").is_none() && options.get_str("upload_job").is_none() {
            return Err(TransferError::Format(
                "import needs an archive or an upload_job".into(),
            ));
        }
        self.start(PipelineKind::Import, options)
    }

    fn start(&self, kind: PipelineKind, mut params: PipelineParams) -> Result<Outcome> {
        let storage = uuid::Uuid::new_v4().simple().to_string();
        let table = StepTable::for_kind(kind);
        params.set("kind", kind.as_str());
        params.set("storage", storage.as_str());
        params.set("started_at", Utc::now().to_rfc3339());
        params.set_priority(table.first());
        for key in ["completed", "requires_confirmation", "lock_id"] {
            params.remove(key);
        }

        tracing::info!(kind = kind.as_str(), storage = %storage, "Pipeline started");
        self.runs().save_params(&storage, &params)?;
        self.write_status(&params, kind, RunState::Running, "Queued", "Waiting for the first step")?;
        self.run(params)
    }

    /// Accept a run halted for confirmation and carry on.
    pub fn confirm(&self, storage: &str) -> Result<Outcome> {
        let mut params = self.runs().load_params(storage)?;
        if params.completed() {
            return Ok(Outcome::Done(params));
        }
        if !params.requires_confirmation() {
            return Err(TransferError::Format(format!(
                "pipeline '{}' is not waiting for confirmation",
                storage
            )));
        }
        params.set("confirmed", true);
        params.remove("requires_confirmation");
        self.run(params)
    }

    /// Continue a run from its checkpoint.
    pub fn resume(&self, storage: &str) -> Result<Outcome> {
        let params = self.runs().load_params(storage)?;
        self.run(params)
    }

    pub fn checkpoint(&self, storage: &str) -> Result<PipelineParams> {
        self.runs().load_params(storage)
    }

    pub fn status(&self, storage: &str) -> Result<Option<PipelineStatus>> {
        self.runs().read_status(storage)
    }

    /// Run the step at `params.priority` and dispatch the next one.
    pub fn run(&self, params: PipelineParams) -> Result<Outcome> {
        self.execute(params, true)
    }

    /// Run steps back to back until the run halts or finishes.
    pub fn run_to_completion(&self, mut params: PipelineParams) -> Result<Outcome> {
        loop {
            match self.execute(params, false)? {
                Outcome::Continued(next) => params = next,
                other => return Ok(other),
            }
        }
    }

    fn execute(&self, mut params: PipelineParams, dispatch: bool) -> Result<Outcome> {
        if params.completed() {
            return Ok(Outcome::Done(params));
        }
        let kind = params.kind()?;
        let storage = params.require_str("storage")?.to_string();
        let table = StepTable::for_kind(kind);
        let priority = params.priority();

        let Some(step) = table.find(priority) else {
            tracing::debug!(storage = %storage, priority, "No step at priority");
            return Ok(Outcome::Idle(params));
        };

        let span = tracing::info_span!("pipeline_step", storage = %storage, step = step.name, priority);
        let _enter = span.enter();

        if table.needs_lock(priority) {
            if let Err(e) = self.hold_lock(kind, &storage, &mut params) {
                return Err(self.fail(kind, params, step, e));
            }
        }
        // Steps that publish nothing must not inherit the previous text
        params.remove("status");
        self.write_status(&params, kind, RunState::Running, step.name, &format!("Running {}", step.name))?;

        let started = std::time::Instant::now();
        let mut next = match (step.run)(&self.ctx, params.clone()) {
            Ok(next) => next,
            Err(e) => return Err(self.fail(kind, params, step, e)),
        };
        next.set_priority(priority);
        tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "Step finished");

        let (title, message) = next
            .status_text()
            .unwrap_or_else(|| (step.name.to_string(), format!("Finished {}", step.name)));

        if next.requires_confirmation() && !next.confirmed() {
            self.runs().save_params(&storage, &next)?;
            self.write_status(&next, kind, RunState::Confirm, &title, &message)?;
            tracing::info!("Waiting for confirmation");
            return Ok(Outcome::ConfirmationRequired(next));
        }

        match table.next_after(priority) {
            Some(following) => {
                next.set_priority(following);
                self.runs().save_params(&storage, &next)?;
                self.write_status(&next, kind, RunState::Running, &title, &message)?;
                if dispatch {
                    self.continuation.dispatch(self.clone(), storage);
                }
                Ok(Outcome::Continued(next))
            }
            None => {
                next.set("completed", true);
                next.set("finished_at", Utc::now().to_rfc3339());
                if let Some(lock_id) = next.lock_id().map(str::to_string) {
                    self.ctx.lock.release(&lock_id)?;
                    next.remove("lock_id");
                }
                self.runs().save_params(&storage, &next)?;
                self.write_status(&next, kind, RunState::Done, &title, &message)?;
                tracing::info!(kind = kind.as_str(), "Pipeline finished");
                Ok(Outcome::Done(next))
            }
        }
    }

    /// Take or extend the run's lock before a step. The id is checkpointed
    /// before the step runs so a failing step still releases it. An expired
    /// lock is taken again unless another run grabbed it in between.
    fn hold_lock(&self, kind: PipelineKind, storage: &str, params: &mut PipelineParams) -> Result<()> {
        if let Some(lock_id) = params.lock_id().map(str::to_string) {
            if self.ctx.lock.refresh(&lock_id, None)? {
                return Ok(());
            }
            tracing::warn!(lock_id = %lock_id, "Job lock lapsed, taking it again");
        }
        let lock_id = self.ctx.lock.acquire(kind.as_str(), None, params.user_id())?;
        params.set("lock_id", lock_id);
        self.runs().save_params(storage, params)
    }

    fn fail(&self, kind: PipelineKind, mut params: PipelineParams, step: &StepDef, err: TransferError) -> TransferError {
        let err = match err {
            TransferError::Step { .. } => err,
            other => TransferError::step(step.name, other),
        };
        tracing::error!(error = %err, "Pipeline step failed");

        if let Some(lock_id) = params.lock_id().map(str::to_string) {
            if let Err(e) = self.ctx.lock.release(&lock_id) {
                tracing::warn!(error = %e, "Could not release job lock");
            }
            params.remove("lock_id");
        }
        params.set("error", err.to_string());
        if let Some(storage) = params.storage().map(str::to_string) {
            if let Err(e) = self.runs().save_params(&storage, &params) {
                tracing::warn!(error = %e, "Could not checkpoint failed run");
            }
        }
        let title = format!("{} failed", step.name);
        if let Err(e) = self.write_status(&params, kind, RunState::Error, &title, &err.to_string()) {
            tracing::warn!(error = %e, "Could not write failure status");
        }
        err
    }

    fn write_status(
        &self,
        params: &PipelineParams,
        kind: PipelineKind,
        state: RunState,
        title: &str,
        message: &str,
    ) -> Result<()> {
        let status = PipelineStatus {
            storage: params.require_str("storage")?.to_string(),
            kind,
            priority: params.priority(),
            state,
            title: title.to_string(),
            message: message.to_string(),
            updated_at: Utc::now(),
        };
        self.runs().write_status(&status)?;
        if let Some(observer) = &self.observer {
            observer.on_status(&status, params);
        }
        Ok(())
    }
}

/// Directory holding a run's intermediate files.
pub(crate) fn scratch_dir(ctx: &TransferContext, params: &PipelineParams) -> Result<std::path::PathBuf> {
    Ok(ctx.layout.scratch_dir(params.require_str("storage")?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_tables_strictly_increase() {
        for kind in [PipelineKind::Export, PipelineKind::Import] {
            let table = StepTable::for_kind(kind);
            let priorities: Vec<i64> = table.steps().iter().map(|s| s.priority).collect();
            assert!(priorities.windows(2).all(|w| w[0] < w[1]), "{:?}", priorities);
        }
    }

    #[test]
    fn test_next_after() {
        let table = StepTable::for_kind(PipelineKind::Import);
        assert_eq!(table.first(), 5);
        assert_eq!(table.next_after(50), Some(55));
        assert_eq!(table.next_after(52), Some(55));
        assert_eq!(table.next_after(160), None);
        assert!(table.find(52).is_none());
    }

    #[test]
    fn test_export_table_shape() {
        let table = StepTable::for_kind(PipelineKind::Export);
        assert_eq!(table.first(), 5);
        assert_eq!(table.steps().last().map(|s| s.priority), Some(110));
        assert_eq!(table.steps().len(), 12);
    }
}
