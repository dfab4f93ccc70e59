use segforge_core::ProjectName;
use tracing::{debug, warn};

use crate::config::MaintenanceConfig;
use crate::meta_store::MetaStore;
use crate::offset::{read_offset, stage_offset, OffsetPo};
use crate::retry::RetryPolicy;
use crate::transaction::{run_in_transaction, Transaction, TransactionError};

use super::runner::MaintenanceTask;

/// Result of one maintenance iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Work was committed. `offset` is the cursor after the iteration, for
    /// offset-tracked tasks.
    Committed { records: usize, offset: Option<i64> },
    /// Nothing (more) was committed; earlier batches of the same iteration
    /// stay committed.
    Aborted(AbortReason),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// Another writer advanced the cursor since this iteration read it.
    OffsetMoved { expected: i64, found: i64 },
    Conflict(String),
    Store(String),
    TaskFailed(String),
}

impl core::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AbortReason::OffsetMoved { expected, found } => {
                write!(f, "offset moved from {expected} to {found}")
            }
            AbortReason::Conflict(msg) => write!(f, "conflict: {msg}"),
            AbortReason::Store(msg) => write!(f, "store failure: {msg}"),
            AbortReason::TaskFailed(msg) => write!(f, "task failed: {msg}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotMaster,
    /// Every job the task would create is already running.
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationLimits {
    pub batch_size: usize,
    pub max_records_per_iteration: usize,
}

impl Default for IterationLimits {
    fn default() -> Self {
        Self::from(&MaintenanceConfig::default())
    }
}

impl From<&MaintenanceConfig> for IterationLimits {
    fn from(cfg: &MaintenanceConfig) -> Self {
        Self {
            batch_size: cfg.batch_size.max(1),
            max_records_per_iteration: cfg.max_records_per_iteration,
        }
    }
}

/// A task that folds an ordered feed into metadata.
///
/// `fetch` must return records with offsets strictly greater than `after`, in
/// ascending order. `process` runs outside any transaction; `apply` stages
/// the derived updates and may run only once per batch.
pub trait OffsetTrackedTask: Send + Sync + 'static {
    type Record: Send;
    type Update: Send;

    fn name(&self) -> &str;

    /// Cursor name under `/{project}/offset/`.
    fn offset_type(&self) -> &str;

    fn fetch(&self, project: &ProjectName, after: i64, limit: usize) -> anyhow::Result<Vec<Self::Record>>;

    fn offset_of(&self, record: &Self::Record) -> i64;

    fn process(&self, project: &ProjectName, batch: &[Self::Record]) -> anyhow::Result<Self::Update>;

    fn apply<S: MetaStore + ?Sized>(
        &self,
        tx: &mut Transaction<'_, S>,
        project: &ProjectName,
        update: &Self::Update,
    ) -> Result<(), TransactionError>;
}

#[derive(Debug)]
enum IterationError {
    OffsetMoved { expected: i64, found: i64 },
    Transaction(TransactionError),
}

impl From<TransactionError> for IterationError {
    fn from(e: TransactionError) -> Self {
        IterationError::Transaction(e)
    }
}

impl From<IterationError> for AbortReason {
    fn from(e: IterationError) -> Self {
        match e {
            IterationError::OffsetMoved { expected, found } => {
                AbortReason::OffsetMoved { expected, found }
            }
            IterationError::Transaction(e) if e.is_conflict() => AbortReason::Conflict(e.to_string()),
            IterationError::Transaction(e) => AbortReason::Store(e.to_string()),
        }
    }
}

/// Run one offset-tracked iteration.
///
/// Each batch commits in its own single-attempt transaction that re-reads the
/// cursor: if it moved since the iteration read it, the batch is dropped and
/// the iteration aborts, so every feed record is applied at most once.
pub fn run_iteration<S, T>(
    store: &S,
    task: &T,
    project: &ProjectName,
    limits: &IterationLimits,
) -> IterationOutcome
where
    S: MetaStore + ?Sized,
    T: OffsetTrackedTask,
{
    let mut offset = match read_offset(&mut Transaction::new(store), project, task.offset_type()) {
        Ok(po) => po.map(|o| o.offset).unwrap_or(0),
        Err(e) => return abort(task, project, AbortReason::Store(e.to_string())),
    };
    let batch_size = limits.batch_size.max(1);
    let mut committed = 0usize;

    loop {
        let batch = match task.fetch(project, offset, batch_size) {
            Ok(batch) => batch,
            Err(e) => return abort(task, project, AbortReason::TaskFailed(format!("{e:#}"))),
        };
        if batch.is_empty() {
            break;
        }

        let high = batch
            .iter()
            .map(|r| task.offset_of(r))
            .fold(offset, i64::max);
        let update = match task.process(project, &batch) {
            Ok(update) => update,
            Err(e) => return abort(task, project, AbortReason::TaskFailed(format!("{e:#}"))),
        };

        let start = offset;
        let result = run_in_transaction(store, &RetryPolicy::single_shot(), task.name(), |tx| {
            let current = read_offset(tx, project, task.offset_type())?
                .map(|o| o.offset)
                .unwrap_or(0);
            if current != start {
                return Err(IterationError::OffsetMoved {
                    expected: start,
                    found: current,
                });
            }
            task.apply(tx, project, &update)?;
            stage_offset(tx, &OffsetPo::new(project.clone(), task.offset_type(), high))?;
            Ok(())
        });

        if let Err(e) = result {
            return abort(task, project, e.into());
        }

        committed += batch.len();
        offset = high;
        debug!(
            task = task.name(),
            project = %project,
            records = batch.len(),
            offset,
            "maintenance batch committed"
        );

        if batch.len() < batch_size || committed >= limits.max_records_per_iteration {
            break;
        }
    }

    IterationOutcome::Committed {
        records: committed,
        offset: Some(offset),
    }
}

fn abort<T: OffsetTrackedTask>(task: &T, project: &ProjectName, reason: AbortReason) -> IterationOutcome {
    warn!(task = task.name(), project = %project, reason = %reason, "maintenance iteration aborted");
    IterationOutcome::Aborted(reason)
}

/// Adapter running an [`OffsetTrackedTask`] as a [`MaintenanceTask`].
pub struct OffsetTracked<T, S> {
    task: T,
    store: S,
    limits: IterationLimits,
}

impl<T, S> OffsetTracked<T, S> {
    pub fn new(task: T, store: S, limits: IterationLimits) -> Self {
        Self { task, store, limits }
    }

    pub fn inner(&self) -> &T {
        &self.task
    }
}

impl<T, S> MaintenanceTask for OffsetTracked<T, S>
where
    T: OffsetTrackedTask,
    S: MetaStore + 'static,
{
    fn name(&self) -> &str {
        self.task.name()
    }

    fn run_once(&self, project: &ProjectName) -> IterationOutcome {
        run_iteration(&self.store, &self.task, project, &self.limits)
    }
}
