//! Process context: wires the stores, the job service and the maintenance
//! threads from one [`OrchestratorConfig`].

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use segforge_core::ProjectName;
use segforge_jobs::StepRatioCalculator;

use crate::admission::{AdmissionPolicy, ComputeSubmitter, JobManager};
use crate::config::{ConfigError, OrchestratorConfig};
use crate::executable::ExecutableStore;
use crate::maintenance::{
    CronJobSubmitter, IterationLimits, LayoutUsageRollup, MaintenanceHandle, MaintenanceRunner,
    MaintenanceTask, MasterElection, OffsetTracked, QueryHistoryFeed,
};
use crate::meta_store::MetaStore;
use crate::service::JobService;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to spawn maintenance thread {task} for {project}: {source}")]
    Spawn {
        task: String,
        project: ProjectName,
        #[source]
        source: std::io::Error,
    },
}

impl OrchestratorError {
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::Config(e) => e.code(),
            OrchestratorError::Spawn { .. } => "MAINTENANCE_SPAWN_FAILED",
        }
    }
}

/// External collaborators the orchestrator does not own.
pub struct Collaborators {
    pub submitter: Arc<dyn ComputeSubmitter>,
    pub master: Arc<dyn MasterElection>,
    pub query_history: Arc<dyn QueryHistoryFeed>,
}

/// Running orchestration core.
///
/// Every cron project gets two maintenance threads: the layout usage
/// roll-up and the layout cleanup job submitter. Dropping the value also
/// stops them at their next wake-up, without waiting;
/// [`shutdown`](Self::shutdown) stops and joins them.
pub struct Orchestrator<S> {
    config: OrchestratorConfig,
    service: Arc<JobService<S>>,
    maintenance: Vec<MaintenanceHandle>,
}

impl<S> Orchestrator<S>
where
    S: MetaStore + Clone + 'static,
{
    pub fn start(
        config: OrchestratorConfig,
        store: S,
        collaborators: Collaborators,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;

        let policy: Arc<dyn AdmissionPolicy> = Arc::new(config.admission_policy());
        let jobs = ExecutableStore::new(store.clone(), config.transaction_retry.clone());
        let manager = Arc::new(
            JobManager::new(jobs, policy, collaborators.submitter)
                .with_submit_job_multiplier(config.submit_job_multiplier),
        );
        let service = Arc::new(JobService::new(
            manager.clone(),
            StepRatioCalculator::new(config.unfinished_ratio_cap),
        ));

        let runner = MaintenanceRunner::from(&config.maintenance);
        let limits = IterationLimits::from(&config.maintenance);
        let mut maintenance = Vec::new();
        for project in config.cron_project_names() {
            let rollup = Arc::new(OffsetTracked::new(
                LayoutUsageRollup::new(collaborators.query_history.clone()),
                store.clone(),
                limits,
            ));
            let cron = Arc::new(CronJobSubmitter::new(manager.clone()));

            let tasks: [Arc<dyn MaintenanceTask>; 2] = [rollup, cron];
            for task in tasks {
                let name = task.name().to_string();
                match runner.spawn(project.clone(), task, collaborators.master.clone()) {
                    Ok(handle) => maintenance.push(handle),
                    Err(source) => {
                        maintenance.into_iter().for_each(MaintenanceHandle::shutdown);
                        return Err(OrchestratorError::Spawn {
                            task: name,
                            project,
                            source,
                        });
                    }
                }
            }
        }

        info!(
            cron_projects = config.cron_projects.len(),
            maintenance_threads = maintenance.len(),
            "orchestrator started"
        );
        Ok(Self {
            config,
            service,
            maintenance,
        })
    }
}

impl<S> Orchestrator<S> {
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn service(&self) -> &Arc<JobService<S>> {
        &self.service
    }

    pub fn maintenance(&self) -> &[MaintenanceHandle] {
        &self.maintenance
    }

    /// Handle of `task` for `project`, if it runs here.
    pub fn maintenance_handle(&self, task: &str, project: &ProjectName) -> Option<&MaintenanceHandle> {
        self.maintenance
            .iter()
            .find(|h| h.task() == task && h.project() == project)
    }

    /// Stop every maintenance thread and wait for them.
    pub fn shutdown(self) {
        let threads = self.maintenance.len();
        for handle in self.maintenance {
            handle.shutdown();
        }
        info!(maintenance_threads = threads, "orchestrator stopped");
    }
}
