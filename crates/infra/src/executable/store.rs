use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

use segforge_core::{JobId, PartitionId, ProjectName, SegmentId, StageId, TaskId};
use segforge_jobs::{
    wait_times, ExecutableState, Job, JobType, StageScope, TransitionError, WaitTimes,
};

use super::po::{ExecutablePo, JobIndex, JobIndexEntry};
use crate::meta_store::{MetaKey, MetaStore};
use crate::retry::RetryPolicy;
use crate::transaction::{run_in_transaction, Transaction, TransactionError};

#[derive(Debug, Error)]
pub enum ExecutableStoreError {
    #[error("job {job_id} not found in project {project}")]
    JobNotFound { project: ProjectName, job_id: JobId },

    #[error("job {0} already exists")]
    JobAlreadyExists(JobId),

    #[error("job {job_id} is {status} and cannot be deleted until it is final")]
    JobNotFinal {
        job_id: JobId,
        status: ExecutableState,
    },

    #[error("a running job {existing} already targets {subject}")]
    JobCreationCheckFailed { subject: String, existing: JobId },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

impl ExecutableStoreError {
    pub fn code(&self) -> &'static str {
        match self {
            ExecutableStoreError::JobNotFound { .. } => "JOB_NOT_FOUND",
            ExecutableStoreError::JobAlreadyExists(_) => "JOB_ALREADY_EXISTS",
            ExecutableStoreError::JobNotFinal { .. } => "JOB_NOT_FINAL",
            ExecutableStoreError::JobCreationCheckFailed { .. } => "JOB_CREATION_CHECK_FAILED",
            ExecutableStoreError::Transition(e) => e.code(),
            ExecutableStoreError::Transaction(e) => e.code(),
        }
    }
}

/// Job- or task-level status update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputUpdate {
    pub status: ExecutableState,
    pub info: Option<BTreeMap<String, String>>,
    pub failed_msg: Option<String>,
    /// Overrides the short message otherwise derived from `failed_msg`.
    pub short_err_msg: Option<String>,
}

impl OutputUpdate {
    pub fn status(status: ExecutableState) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self {
            status: ExecutableState::Error,
            failed_msg: Some(msg.into()),
            ..Default::default()
        }
    }
}

/// Executor callback for one stage×segment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageUpdate {
    pub status: ExecutableState,
    pub info: Option<BTreeMap<String, String>>,
    pub failed_msg: Option<String>,
    pub is_restart: bool,
}

impl StageUpdate {
    pub fn status(status: ExecutableState) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn with_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.info
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }
}

/// Job persistence with optimistic concurrency.
///
/// Every mutation loads the job inside a transaction, applies one of the
/// state-machine operations from `segforge-jobs`, and writes the record back
/// expecting the version it read. Mutations that change nothing do not write.
///
/// The project job index only holds non-final jobs. A mutation that
/// finishes a job drops its entry; one that brings a final job back
/// (resume, restart) re-runs the duplicate guard and re-registers it.
#[derive(Debug, Clone)]
pub struct ExecutableStore<S> {
    store: S,
    retry: RetryPolicy,
}

impl<S: MetaStore> ExecutableStore<S> {
    pub fn new(store: S, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn meta_store(&self) -> &S {
        &self.store
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Persist a freshly planned job and register it in the project index.
    pub fn add_job(&self, job: Job) -> Result<Job, ExecutableStoreError> {
        let job = run_in_transaction(&self.store, &self.retry, "add_job", |tx| {
            let key = MetaKey::executable(&job.project, job.id);
            if tx.get_raw(&key)?.is_some() {
                return Err(ExecutableStoreError::JobAlreadyExists(job.id));
            }
            let mut job = job.clone();
            save_job(tx, &mut job)?;
            index_job(tx, &job)?;
            Ok(job)
        })?;
        info!(project = %job.project, job_id = %job.id, job_type = %job.job_type, "job added");
        Ok(job)
    }

    pub fn get_job(&self, project: &ProjectName, job_id: JobId) -> Result<Job, ExecutableStoreError> {
        let po = self.get_executable_po(project, job_id)?;
        po.to_job().map_err(|e| {
            TransactionError::Corrupt {
                key: po.key.clone(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    pub fn get_executable_po(
        &self,
        project: &ProjectName,
        job_id: JobId,
    ) -> Result<ExecutablePo, ExecutableStoreError> {
        let key = MetaKey::executable(project, job_id);
        let raw = self
            .store
            .read(&key)
            .map_err(TransactionError::from)?
            .ok_or_else(|| ExecutableStoreError::JobNotFound {
                project: project.clone(),
                job_id,
            })?;
        Ok(ExecutablePo {
            key,
            mvcc: raw.version,
            document: raw.value,
        })
    }

    /// Every job of the project, ordered by creation time.
    pub fn list_jobs(&self, project: &ProjectName) -> Result<Vec<Job>, ExecutableStoreError> {
        let mut tx = Transaction::new(&self.store);
        let mut jobs: Vec<Job> = tx
            .scan::<Job>(&MetaKey::executables_prefix(project))?
            .into_iter()
            .map(|(_, stored)| {
                let mut job = stored.value;
                job.mvcc = stored.version;
                job
            })
            .collect();
        jobs.sort_by_key(|j| (j.create_time, j.id));
        Ok(jobs)
    }

    /// Jobs created within `[from, to)`.
    pub fn get_all_jobs(
        &self,
        project: &ProjectName,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Job>, ExecutableStoreError> {
        Ok(self
            .list_jobs(project)?
            .into_iter()
            .filter(|j| j.create_time >= from && j.create_time < to)
            .collect())
    }

    pub fn update_job_output(
        &self,
        project: &ProjectName,
        job_id: JobId,
        update: &OutputUpdate,
    ) -> Result<bool, ExecutableStoreError> {
        self.mutate("update_job_output", project, job_id, |job, now| {
            let changed = job.update_output(
                update.status,
                update.info.as_ref(),
                update.failed_msg.as_deref(),
                now,
            )?;
            if let Some(short) = &update.short_err_msg {
                job.output.short_err_msg = Some(short.clone());
            }
            Ok(changed)
        })
    }

    pub fn update_task_output(
        &self,
        project: &ProjectName,
        task_id: TaskId,
        update: &OutputUpdate,
    ) -> Result<bool, ExecutableStoreError> {
        self.mutate("update_task_output", project, task_id.job_id(), |job, now| {
            let changed = job.update_task_output(
                task_id,
                update.status,
                update.info.as_ref(),
                update.failed_msg.as_deref(),
                now,
            )?;
            if let (Some(short), Some(task)) = (&update.short_err_msg, job.task_mut(task_id)) {
                task.output.short_err_msg = Some(short.clone());
            }
            Ok(changed)
        })
    }

    /// Apply an executor stage callback. Returns whether it was applied.
    pub fn update_stage_status(
        &self,
        project: &ProjectName,
        stage_id: StageId,
        segment_id: SegmentId,
        update: &StageUpdate,
    ) -> Result<bool, ExecutableStoreError> {
        self.mutate("update_stage_status", project, stage_id.job_id(), |job, now| {
            Ok(job.update_stage_status(
                stage_id,
                segment_id,
                update.status,
                update.info.as_ref(),
                update.failed_msg.as_deref(),
                update.is_restart,
                now,
            )?)
        })
    }

    pub fn discard_job(&self, project: &ProjectName, job_id: JobId) -> Result<Job, ExecutableStoreError> {
        let job = self.mutate("discard_job", project, job_id, |job, now| {
            job.discard(now)?;
            Ok(job.clone())
        })?;
        info!(project = %project, job_id = %job_id, "job discarded");
        Ok(job)
    }

    pub fn pause_job(&self, project: &ProjectName, job_id: JobId) -> Result<Job, ExecutableStoreError> {
        let job = self.mutate("pause_job", project, job_id, |job, now| {
            job.pause(now)?;
            Ok(job.clone())
        })?;
        info!(project = %project, job_id = %job_id, "job paused");
        Ok(job)
    }

    pub fn resume_job(&self, project: &ProjectName, job_id: JobId) -> Result<Job, ExecutableStoreError> {
        let job = self.mutate("resume_job", project, job_id, |job, now| {
            job.resume(now)?;
            Ok(job.clone())
        })?;
        info!(project = %project, job_id = %job_id, "job resumed");
        Ok(job)
    }

    pub fn restart_job(&self, project: &ProjectName, job_id: JobId) -> Result<Job, ExecutableStoreError> {
        let job = self.mutate("restart_job", project, job_id, |job, now| {
            job.restart(now)?;
            Ok(job.clone())
        })?;
        info!(project = %project, job_id = %job_id, "job restarted");
        Ok(job)
    }

    /// Force every non-final stage of the job to `PAUSED` without touching
    /// job or task status.
    pub fn update_stage_paused(
        &self,
        project: &ProjectName,
        job_id: JobId,
    ) -> Result<usize, ExecutableStoreError> {
        self.mutate("update_stage_paused", project, job_id, |job, now| {
            Ok(job.update_stage_paused(now))
        })
    }

    pub fn make_stage_success(
        &self,
        project: &ProjectName,
        job_id: JobId,
        scope: StageScope,
    ) -> Result<usize, ExecutableStoreError> {
        self.mutate("make_stage_success", project, job_id, |job, now| {
            Ok(job.make_stage_success(scope, now))
        })
    }

    pub fn make_stage_error(
        &self,
        project: &ProjectName,
        job_id: JobId,
        scope: StageScope,
    ) -> Result<usize, ExecutableStoreError> {
        self.mutate("make_stage_error", project, job_id, |job, now| {
            Ok(job.make_stage_error(scope, now))
        })
    }

    pub fn get_wait_time(
        &self,
        project: &ProjectName,
        job_id: JobId,
    ) -> Result<WaitTimes, ExecutableStoreError> {
        let job = self.get_job(project, job_id)?;
        Ok(wait_times(&job, Utc::now()))
    }

    /// Record the compute engine's id for a submitted job.
    pub fn record_executor_job_id(
        &self,
        project: &ProjectName,
        job_id: JobId,
        executor_job_id: &str,
    ) -> Result<(), ExecutableStoreError> {
        self.mutate("record_executor_job_id", project, job_id, |job, now| {
            job.params
                .insert(EXECUTOR_JOB_ID.to_string(), executor_job_id.to_string());
            job.last_modified = now;
            Ok(())
        })
    }

    /// Remove a final job and its index entry.
    pub fn delete_job(&self, project: &ProjectName, job_id: JobId) -> Result<(), ExecutableStoreError> {
        run_in_transaction(&self.store, &self.retry, "delete_job", |tx| {
            let job = load_job(tx, project, job_id)?;
            if !job.is_final() {
                return Err(ExecutableStoreError::JobNotFinal {
                    job_id,
                    status: job.status(),
                });
            }
            tx.delete(MetaKey::executable(project, job_id))?;

            unindex_job(tx, project, job_id)?;
            Ok(())
        })?;
        info!(project = %project, job_id = %job_id, "job deleted");
        Ok(())
    }

    fn mutate<T, F>(
        &self,
        name: &str,
        project: &ProjectName,
        job_id: JobId,
        mut apply: F,
    ) -> Result<T, ExecutableStoreError>
    where
        F: FnMut(&mut Job, DateTime<Utc>) -> Result<T, ExecutableStoreError>,
    {
        run_in_transaction(&self.store, &self.retry, name, |tx| {
            let mut job = load_job(tx, project, job_id)?;
            let before = job.clone();
            let out = apply(&mut job, Utc::now())?;
            if job != before {
                match (before.is_final(), job.is_final()) {
                    (false, true) => unindex_job(tx, project, job_id)?,
                    (true, false) => {
                        if let Some(existing) = find_contender(
                            tx,
                            project,
                            job.job_type,
                            &job.target_subject,
                            &job.target_segments,
                            &job.target_partitions,
                            Some(job_id),
                        )? {
                            return Err(ExecutableStoreError::JobCreationCheckFailed {
                                subject: job.target_subject.clone(),
                                existing,
                            });
                        }
                        index_job(tx, &job)?;
                    }
                    _ => {}
                }
                save_job(tx, &mut job)?;
            } else {
                debug!(operation = name, job_id = %job_id, "no change, skipping write");
            }
            Ok(out)
        })
    }
}

/// Key under which the executor-assigned job id is kept in `Job::params`.
pub const EXECUTOR_JOB_ID: &str = "executorJobId";

pub(crate) fn load_job<S: MetaStore + ?Sized>(
    tx: &mut Transaction<'_, S>,
    project: &ProjectName,
    job_id: JobId,
) -> Result<Job, ExecutableStoreError> {
    let stored = tx
        .get::<Job>(&MetaKey::executable(project, job_id))?
        .ok_or_else(|| ExecutableStoreError::JobNotFound {
            project: project.clone(),
            job_id,
        })?;
    let mut job = stored.value;
    job.mvcc = stored.version;
    Ok(job)
}

/// Stage a job write; `job.mvcc` becomes the version the commit will assign.
pub(crate) fn save_job<S: MetaStore + ?Sized>(
    tx: &mut Transaction<'_, S>,
    job: &mut Job,
) -> Result<(), TransactionError> {
    tx.put_versioned(MetaKey::executable(&job.project, job.id), job)
}

pub(crate) fn index_job<S: MetaStore + ?Sized>(
    tx: &mut Transaction<'_, S>,
    job: &Job,
) -> Result<(), TransactionError> {
    let key = MetaKey::job_index(&job.project);
    let mut index = tx
        .get::<JobIndex>(&key)?
        .map(|s| s.value)
        .unwrap_or_else(|| JobIndex::empty(job.project.clone()));
    index.upsert(JobIndexEntry::for_job(job));
    tx.put(key, &index)
}

/// Drop a job from the project index; no write when it is not there.
pub(crate) fn unindex_job<S: MetaStore + ?Sized>(
    tx: &mut Transaction<'_, S>,
    project: &ProjectName,
    job_id: JobId,
) -> Result<(), TransactionError> {
    let key = MetaKey::job_index(project);
    if let Some(stored) = tx.get::<JobIndex>(&key)? {
        let mut index = stored.value;
        if index.remove(job_id) {
            tx.put(key, &index)?;
        }
    }
    Ok(())
}

/// A non-final job, other than `exclude`, that works on the same target.
///
/// Always reads the index key, so two writers racing for one target
/// conflict on it at commit.
pub(crate) fn find_contender<S: MetaStore + ?Sized>(
    tx: &mut Transaction<'_, S>,
    project: &ProjectName,
    job_type: JobType,
    subject: &str,
    segments: &[SegmentId],
    partitions: &BTreeSet<PartitionId>,
    exclude: Option<JobId>,
) -> Result<Option<JobId>, ExecutableStoreError> {
    let Some(index) = tx
        .get::<JobIndex>(&MetaKey::job_index(project))?
        .map(|s| s.value)
    else {
        return Ok(None);
    };

    for entry in index.for_subject(subject) {
        if Some(entry.job_id) == exclude || !entry.contends(job_type, segments, partitions) {
            continue;
        }
        match load_job(tx, project, entry.job_id) {
            Ok(existing) if !existing.is_final() => return Ok(Some(existing.id)),
            Ok(_) | Err(ExecutableStoreError::JobNotFound { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use segforge_core::SegmentId;
    use segforge_jobs::{JobType, TaskParams, INDEX_SUCCESS_COUNT};

    use super::*;
    use crate::meta_store::InMemoryMetaStore;

    fn project() -> ProjectName {
        ProjectName::new("retail").unwrap()
    }

    fn store() -> ExecutableStore<Arc<InMemoryMetaStore>> {
        ExecutableStore::new(
            Arc::new(InMemoryMetaStore::new()),
            RetryPolicy::fixed(5, Duration::from_millis(1)),
        )
    }

    fn build_job(segments: &[SegmentId]) -> Job {
        Job::plan(
            project(),
            JobType::IndexBuild,
            "model-1",
            "ADMIN",
            TaskParams {
                segment_ids: segments.to_vec(),
                index_count: 4,
                ..Default::default()
            },
            Utc::now(),
        )
    }

    #[test]
    fn add_then_get_round_trips_with_version() {
        let store = store();
        let seg = SegmentId::new();
        let job = store.add_job(build_job(&[seg])).unwrap();
        assert_eq!(job.mvcc, 1);

        let loaded = store.get_job(&project(), job.id).unwrap();
        assert_eq!(loaded, job);

        let po = store.get_executable_po(&project(), job.id).unwrap();
        assert_eq!(po.mvcc, 1);
        assert_eq!(po.document["jobType"], "INDEX_BUILD");
        assert!(po.document["tasks"][1]["stagesMap"][seg.to_string()].is_array());
    }

    #[test]
    fn stage_update_bumps_version_only_when_applied() {
        let store = store();
        let seg = SegmentId::new();
        let job = store.add_job(build_job(&[seg])).unwrap();
        let stage = job.tasks[1].id.stage(0);

        let applied = store
            .update_stage_status(
                &project(),
                stage,
                seg,
                &StageUpdate::status(ExecutableState::Running).with_info(INDEX_SUCCESS_COUNT, "1"),
            )
            .unwrap();
        assert!(applied);
        assert_eq!(store.get_job(&project(), job.id).unwrap().mvcc, 2);

        store.pause_job(&project(), job.id).unwrap();
        let before = store.get_job(&project(), job.id).unwrap();

        let applied = store
            .update_stage_status(&project(), stage, seg, &StageUpdate::status(ExecutableState::Succeed))
            .unwrap();
        assert!(!applied);
        assert_eq!(store.get_job(&project(), job.id).unwrap(), before);
    }

    #[test]
    fn illegal_job_transition_is_reported() {
        let store = store();
        let job = store.add_job(build_job(&[SegmentId::new()])).unwrap();
        store.discard_job(&project(), job.id).unwrap();

        let err = store
            .update_job_output(&project(), job.id, &OutputUpdate::status(ExecutableState::Running))
            .unwrap_err();
        assert_eq!(err.code(), "ILLEGAL_STATE_TRANSFER");
    }

    #[test]
    fn explicit_short_error_overrides_derived_one() {
        let store = store();
        let job = store.add_job(build_job(&[SegmentId::new()])).unwrap();
        let update = OutputUpdate {
            short_err_msg: Some("OOM".to_string()),
            ..OutputUpdate::failed("java.lang.OutOfMemoryError\n\tat ...")
        };
        store.update_job_output(&project(), job.id, &update).unwrap();

        let job = store.get_job(&project(), job.id).unwrap();
        assert_eq!(job.status(), ExecutableState::Error);
        assert_eq!(job.output.short_err_msg.as_deref(), Some("OOM"));
    }

    #[test]
    fn delete_requires_final_job() {
        let store = store();
        let job = store.add_job(build_job(&[SegmentId::new()])).unwrap();

        let err = store.delete_job(&project(), job.id).unwrap_err();
        assert_eq!(err.code(), "JOB_NOT_FINAL");

        store.discard_job(&project(), job.id).unwrap();
        store.delete_job(&project(), job.id).unwrap();
        assert_eq!(
            store.get_job(&project(), job.id).unwrap_err().code(),
            "JOB_NOT_FOUND"
        );
        assert!(store.list_jobs(&project()).unwrap().is_empty());
    }

    fn indexed(store: &ExecutableStore<Arc<InMemoryMetaStore>>) -> (Vec<JobId>, u64) {
        match store.meta_store().read(&MetaKey::job_index(&project())).unwrap() {
            Some(raw) => {
                let index: JobIndex = serde_json::from_value(raw.value).unwrap();
                (index.entries.iter().map(|e| e.job_id).collect(), raw.version)
            }
            None => (Vec::new(), 0),
        }
    }

    #[test]
    fn index_only_holds_unfinished_jobs() {
        let store = store();
        let seg = SegmentId::new();
        let a = store.add_job(build_job(&[seg])).unwrap();
        let b = store.add_job(build_job(&[SegmentId::new()])).unwrap();
        assert_eq!(indexed(&store).0, vec![a.id, b.id]);

        store.discard_job(&project(), a.id).unwrap();
        assert_eq!(indexed(&store).0, vec![b.id]);

        // Updates that keep a job unfinished leave the index alone.
        let (_, version) = indexed(&store);
        store
            .update_job_output(&project(), b.id, &OutputUpdate::status(ExecutableState::Running))
            .unwrap();
        assert_eq!(indexed(&store).1, version);

        store
            .update_job_output(&project(), b.id, &OutputUpdate::status(ExecutableState::Succeed))
            .unwrap();
        assert!(indexed(&store).0.is_empty());

        store.restart_job(&project(), b.id).unwrap();
        assert_eq!(indexed(&store).0, vec![b.id]);

        store.delete_job(&project(), a.id).unwrap();
        assert_eq!(indexed(&store).0, vec![b.id]);
    }

    #[test]
    fn resume_is_refused_while_a_newer_job_holds_the_segment() {
        let store = store();
        let seg = SegmentId::new();
        let old = store.add_job(build_job(&[seg])).unwrap();
        store
            .update_job_output(&project(), old.id, &OutputUpdate::failed("executor lost"))
            .unwrap();
        let newer = store.add_job(build_job(&[seg])).unwrap();

        let err = store.resume_job(&project(), old.id).unwrap_err();
        assert!(matches!(
            err,
            ExecutableStoreError::JobCreationCheckFailed { existing, .. } if existing == newer.id
        ));
        assert_eq!(
            store.get_job(&project(), old.id).unwrap().status(),
            ExecutableState::Error
        );
        assert_eq!(indexed(&store).0, vec![newer.id]);
    }

    #[test]
    fn time_range_filter_is_half_open() {
        let store = store();
        let first = store.add_job(build_job(&[SegmentId::new()])).unwrap();
        let second = store.add_job(build_job(&[SegmentId::new()])).unwrap();

        let all = store.list_jobs(&project()).unwrap();
        assert_eq!(all.len(), 2);

        let only_first = store
            .get_all_jobs(&project(), first.create_time, second.create_time)
            .unwrap();
        if first.create_time < second.create_time {
            assert_eq!(only_first.len(), 1);
            assert_eq!(only_first[0].id, first.id);
        } else {
            assert!(only_first.is_empty());
        }
    }

    #[test]
    fn executor_id_is_recorded_in_params() {
        let store = store();
        let job = store.add_job(build_job(&[SegmentId::new()])).unwrap();
        store
            .record_executor_job_id(&project(), job.id, "application_1700000000_0001")
            .unwrap();
        let job = store.get_job(&project(), job.id).unwrap();
        assert_eq!(
            job.params.get(EXECUTOR_JOB_ID).map(String::as_str),
            Some("application_1700000000_0001")
        );
    }

    #[test]
    fn make_stage_success_settles_one_task() {
        let store = store();
        let seg = SegmentId::new();
        let job = store.add_job(build_job(&[seg])).unwrap();
        let task_id = job.tasks[1].id;

        let changed = store
            .make_stage_success(&project(), job.id, StageScope::Task(task_id))
            .unwrap();
        assert_eq!(changed, 8);

        let job = store.get_job(&project(), job.id).unwrap();
        assert!(job.tasks[1].stages_map[&seg]
            .iter()
            .all(|s| s.output.status == ExecutableState::Succeed));
    }
}
