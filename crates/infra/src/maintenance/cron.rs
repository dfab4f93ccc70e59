use std::sync::Arc;

use tracing::{debug, info};

use segforge_core::ProjectName;
use segforge_jobs::Priority;

use super::iteration::{AbortReason, IterationOutcome, SkipReason};
use super::runner::MaintenanceTask;
use crate::admission::{AdmissionError, BuildRequest, BuildTarget, Dataflow, JobManager};
use crate::meta_store::{MetaKey, MetaStore};
use crate::transaction::Transaction;

/// Submits a `LAYOUT_CLEANUP` job for every model of the project.
///
/// A model that already has a non-final cleanup job is skipped; the
/// admission duplicate guard decides.
pub struct CronJobSubmitter<S> {
    manager: Arc<JobManager<S>>,
    submitter: String,
}

impl<S: MetaStore> CronJobSubmitter<S> {
    pub fn new(manager: Arc<JobManager<S>>) -> Self {
        Self {
            manager,
            submitter: "SYSTEM".to_string(),
        }
    }

    fn model_ids(&self, project: &ProjectName) -> Result<Vec<String>, AdmissionError> {
        let mut tx = Transaction::new(self.manager.executables().meta_store());
        Ok(tx
            .scan::<Dataflow>(&MetaKey::dataflows_prefix(project))?
            .into_iter()
            .map(|(_, stored)| stored.value.model_id)
            .collect())
    }
}

impl<S> MaintenanceTask for CronJobSubmitter<S>
where
    S: MetaStore + 'static,
{
    fn name(&self) -> &str {
        "layout_cleanup_cron"
    }

    fn run_once(&self, project: &ProjectName) -> IterationOutcome {
        let models = match self.model_ids(project) {
            Ok(models) => models,
            Err(e) => return IterationOutcome::Aborted(AbortReason::Store(e.to_string())),
        };

        let mut submitted = 0usize;
        let mut skipped = 0usize;
        let mut failures = Vec::new();
        for model_id in models {
            let request = BuildRequest::new(
                project.clone(),
                self.submitter.clone(),
                BuildTarget::LayoutCleanup {
                    model_id: model_id.clone(),
                },
            )
            .with_priority(Priority::LOWEST);

            match self.manager.submit_build(&request) {
                Ok(job_id) => {
                    submitted += 1;
                    debug!(project = %project, model = %model_id, job_id = %job_id, "cleanup job submitted");
                }
                Err(AdmissionError::JobCreationCheckFailed { existing, .. }) => {
                    skipped += 1;
                    debug!(project = %project, model = %model_id, existing = %existing, "cleanup job already running");
                }
                Err(e) => failures.push(format!("{model_id}: {} ({})", e, e.code())),
            }
        }

        if !failures.is_empty() {
            return IterationOutcome::Aborted(AbortReason::TaskFailed(failures.join("; ")));
        }
        if submitted == 0 && skipped > 0 {
            return IterationOutcome::Skipped(SkipReason::AlreadyRunning);
        }
        if submitted > 0 {
            info!(project = %project, submitted, skipped, "cleanup jobs submitted");
        }
        IterationOutcome::Committed {
            records: submitted,
            offset: None,
        }
    }
}
