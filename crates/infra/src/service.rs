//! Caller-facing job operations and the read views they return.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use segforge_core::{JobId, ProjectName, SegmentId, StageId, TaskId};
use segforge_jobs::{
    task_progress, ExecutableOutput, ExecutableState, Job, JobStatus, JobType, StageKind,
    StepRatioCalculator, Task, TaskKind, WaitTimes,
};

use crate::admission::{AdmissionError, BuildRequest, JobManager};
use crate::executable::{ExecutableStore, ExecutableStoreError, OutputUpdate, StageUpdate};
use crate::meta_store::MetaStore;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Store(#[from] ExecutableStoreError),
}

impl ServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Admission(e) => e.code(),
            ServiceError::Store(e) => e.code(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageView {
    pub id: StageId,
    pub kind: StageKind,
    pub status: ExecutableState,
    pub index_success_count: Option<u64>,
    pub failed_msg: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentView {
    pub segment_id: SegmentId,
    pub stages: Vec<StageView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub id: TaskId,
    pub kind: TaskKind,
    pub status: ExecutableState,
    pub progress: f64,
    pub duration_ms: u64,
    pub segments: Vec<SegmentView>,
}

/// User-facing snapshot of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: JobId,
    pub project: ProjectName,
    pub job_type: JobType,
    pub status: JobStatus,
    pub internal_status: ExecutableState,
    pub target_subject: String,
    pub target_segments: Vec<SegmentId>,
    pub submitter: String,
    pub tag: Option<String>,
    pub priority: u8,
    pub step_ratio: f64,
    pub create_time: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub duration_ms: u64,
    pub failed_msg: Option<String>,
    pub short_err_msg: Option<String>,
    pub tasks: Vec<TaskView>,
}

impl JobView {
    fn build(job: &Job, ratio: &StepRatioCalculator, now: DateTime<Utc>) -> Self {
        Self {
            id: job.id,
            project: job.project.clone(),
            job_type: job.job_type,
            status: job.status().to_job_status(),
            internal_status: job.status(),
            target_subject: job.target_subject.clone(),
            target_segments: job.target_segments.clone(),
            submitter: job.submitter.clone(),
            tag: job.tag.clone(),
            priority: job.priority.value(),
            step_ratio: ratio.step_ratio(job),
            create_time: job.create_time,
            last_modified: job.last_modified,
            duration_ms: duration_ms(&job.output, now),
            failed_msg: job.output.failed_msg.clone(),
            short_err_msg: job.output.short_err_msg.clone(),
            tasks: job.tasks.iter().map(|t| TaskView::build(t, now)).collect(),
        }
    }
}

impl TaskView {
    fn build(task: &Task, now: DateTime<Utc>) -> Self {
        let segments = task
            .stages_map
            .iter()
            .map(|(segment_id, stages)| SegmentView {
                segment_id: *segment_id,
                stages: stages
                    .iter()
                    .map(|s| StageView {
                        id: s.id,
                        kind: s.kind,
                        status: s.output.status(),
                        index_success_count: s.output.index_success_count(),
                        failed_msg: s.output.failed_msg.clone(),
                    })
                    .collect(),
            })
            .collect();
        Self {
            id: task.id,
            kind: task.kind,
            status: task.output.status(),
            progress: task_progress(task),
            duration_ms: duration_ms(&task.output, now),
            segments,
        }
    }
}

/// Elapsed run time: start to end, or start to now while unfinished.
fn duration_ms(output: &ExecutableOutput, now: DateTime<Utc>) -> u64 {
    match output.start_time {
        Some(start) => {
            let end = output.end_time.unwrap_or(now);
            (end - start).num_milliseconds().max(0) as u64
        }
        None => 0,
    }
}

/// Entry point for callers and executor callbacks.
pub struct JobService<S> {
    manager: Arc<JobManager<S>>,
    ratio: StepRatioCalculator,
}

impl<S: MetaStore> JobService<S> {
    pub fn new(manager: Arc<JobManager<S>>, ratio: StepRatioCalculator) -> Self {
        Self { manager, ratio }
    }

    pub fn manager(&self) -> &Arc<JobManager<S>> {
        &self.manager
    }

    fn jobs(&self) -> &ExecutableStore<S> {
        self.manager.executables()
    }

    pub fn submit_build(&self, request: &BuildRequest) -> Result<JobId, ServiceError> {
        Ok(self.manager.submit_build(request)?)
    }

    pub fn get_job(&self, project: &ProjectName, job_id: JobId) -> Result<JobView, ServiceError> {
        let job = self.jobs().get_job(project, job_id)?;
        Ok(JobView::build(&job, &self.ratio, Utc::now()))
    }

    /// Jobs of a project, oldest first.
    pub fn list_jobs(&self, project: &ProjectName) -> Result<Vec<JobView>, ServiceError> {
        let now = Utc::now();
        Ok(self
            .jobs()
            .list_jobs(project)?
            .iter()
            .map(|job| JobView::build(job, &self.ratio, now))
            .collect())
    }

    pub fn get_step_ratio(&self, project: &ProjectName, job_id: JobId) -> Result<f64, ServiceError> {
        let job = self.jobs().get_job(project, job_id)?;
        Ok(self.ratio.step_ratio(&job))
    }

    pub fn discard_job(&self, project: &ProjectName, job_id: JobId) -> Result<JobView, ServiceError> {
        let job = self.jobs().discard_job(project, job_id)?;
        Ok(JobView::build(&job, &self.ratio, Utc::now()))
    }

    pub fn pause_job(&self, project: &ProjectName, job_id: JobId) -> Result<JobView, ServiceError> {
        let job = self.jobs().pause_job(project, job_id)?;
        Ok(JobView::build(&job, &self.ratio, Utc::now()))
    }

    pub fn resume_job(&self, project: &ProjectName, job_id: JobId) -> Result<JobView, ServiceError> {
        let job = self.jobs().resume_job(project, job_id)?;
        Ok(JobView::build(&job, &self.ratio, Utc::now()))
    }

    pub fn restart_job(&self, project: &ProjectName, job_id: JobId) -> Result<JobView, ServiceError> {
        let job = self.jobs().restart_job(project, job_id)?;
        Ok(JobView::build(&job, &self.ratio, Utc::now()))
    }

    /// Executor stage callback. Rejected transitions are a logged no-op and
    /// return `false`.
    pub fn update_stage_status(
        &self,
        project: &ProjectName,
        stage_id: StageId,
        segment_id: SegmentId,
        update: &StageUpdate,
    ) -> Result<bool, ServiceError> {
        let applied = self
            .jobs()
            .update_stage_status(project, stage_id, segment_id, update)?;
        if !applied {
            debug!(
                project = %project,
                stage_id = %stage_id,
                segment_id = %segment_id,
                status = %update.status,
                "stage update ignored"
            );
        }
        Ok(applied)
    }

    pub fn update_job_output(
        &self,
        project: &ProjectName,
        job_id: JobId,
        update: &OutputUpdate,
    ) -> Result<bool, ServiceError> {
        Ok(self.jobs().update_job_output(project, job_id, update)?)
    }

    pub fn update_task_output(
        &self,
        project: &ProjectName,
        task_id: TaskId,
        update: &OutputUpdate,
    ) -> Result<bool, ServiceError> {
        Ok(self.jobs().update_task_output(project, task_id, update)?)
    }

    pub fn get_wait_time(&self, project: &ProjectName, job_id: JobId) -> Result<WaitTimes, ServiceError> {
        Ok(self.jobs().get_wait_time(project, job_id)?)
    }
}
