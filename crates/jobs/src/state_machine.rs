//! Status updates and cascading operators over a job graph.
//!
//! Every method here mutates an in-memory copy; persistence (and version
//! checks) happen in the store's transaction around these calls.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use segforge_core::{SegmentId, StageId, TaskId};

use crate::model::{Job, Task};
use crate::output::TransitionError;
use crate::status::ExecutableState;

/// Which stages a force-settle operator walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageScope {
    Job,
    Task(TaskId),
}

impl Job {
    /// Apply an executor stage callback for one segment.
    ///
    /// Returns `Ok(false)` for silently rejected updates (guarded states).
    pub fn update_stage_status(
        &mut self,
        stage_id: StageId,
        segment_id: SegmentId,
        new_status: ExecutableState,
        info: Option<&BTreeMap<String, String>>,
        failed_msg: Option<&str>,
        is_restart: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, TransitionError> {
        let task = self
            .task_mut(stage_id.task_id())
            .ok_or_else(|| TransitionError::TaskNotFound(stage_id.task_id().to_string()))?;

        let stage = task
            .stages_map
            .get_mut(&segment_id)
            .and_then(|stages| stages.iter_mut().find(|s| s.id == stage_id))
            .ok_or_else(|| TransitionError::StageNotFound {
                stage: stage_id.to_string(),
                segment: segment_id.to_string(),
            })?;

        let from = stage.output.status;
        let applied = stage
            .output
            .set_stage_output(new_status, info, failed_msg, is_restart, now);
        if applied {
            self.last_modified = now;
        } else {
            debug!(
                stage_id = %stage_id,
                segment_id = %segment_id,
                from = %from,
                to = %new_status,
                "stage update rejected"
            );
        }
        Ok(applied)
    }

    /// Apply a job-level status update.
    pub fn update_output(
        &mut self,
        new_status: ExecutableState,
        info: Option<&BTreeMap<String, String>>,
        failed_msg: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, TransitionError> {
        let changed = self.output.transition(new_status, info, failed_msg, now)?;
        self.last_modified = now;
        Ok(changed)
    }

    /// Apply a task-level status update.
    pub fn update_task_output(
        &mut self,
        task_id: TaskId,
        new_status: ExecutableState,
        info: Option<&BTreeMap<String, String>>,
        failed_msg: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, TransitionError> {
        let task = self
            .task_mut(task_id)
            .ok_or_else(|| TransitionError::TaskNotFound(task_id.to_string()))?;
        let changed = task.output.transition(new_status, info, failed_msg, now)?;
        self.last_modified = now;
        Ok(changed)
    }

    /// Discard the job and every non-final task and stage×segment.
    pub fn discard(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.output.transition(ExecutableState::Discarded, None, None, now)?;
        self.force_open_work(ExecutableState::Discarded, now);
        self.last_modified = now;
        Ok(())
    }

    /// Pause the job and every non-final task and stage×segment.
    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.output.transition(ExecutableState::Paused, None, None, now)?;
        self.force_open_work(ExecutableState::Paused, now);
        self.last_modified = now;
        Ok(())
    }

    /// Force every non-final stage×segment of every task to `PAUSED`.
    ///
    /// Returns the number of stage entries changed.
    pub fn update_stage_paused(&mut self, now: DateTime<Utc>) -> usize {
        let mut changed = 0;
        for task in &mut self.tasks {
            changed += force_stages(task, ExecutableState::Paused, now, |s| !s.is_final());
        }
        changed
    }

    /// Resume a paused or failed job: the job and unfinished tasks go back to
    /// `READY`, unfinished stages restart from scratch, succeeded work is kept.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.output.transition(ExecutableState::Ready, None, None, now)?;
        for task in &mut self.tasks {
            if !task.output.status.is_success() {
                task.output.reset();
            }
            for stages in task.stages_map.values_mut() {
                for stage in stages.iter_mut() {
                    if !stage.output.status.is_success() {
                        stage
                            .output
                            .set_stage_output(ExecutableState::Ready, None, None, true, now);
                    }
                }
            }
        }
        self.last_modified = now;
        Ok(())
    }

    /// Restart the whole job from scratch, keeping nothing.
    pub fn restart(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        let from = self.output.status;
        if from.is_not_progressing() {
            return Err(TransitionError::IllegalStateTransfer {
                from,
                to: ExecutableState::Ready,
            });
        }
        self.output.reset();
        for task in &mut self.tasks {
            task.output.reset();
            for stages in task.stages_map.values_mut() {
                for stage in stages.iter_mut() {
                    stage
                        .output
                        .set_stage_output(ExecutableState::Ready, None, None, true, now);
                }
            }
        }
        self.last_modified = now;
        Ok(())
    }

    /// Force-settle stages to `SUCCEED` once the executor has decided the
    /// outcome. Stages already succeeded or skipped are untouched.
    pub fn make_stage_success(&mut self, scope: StageScope, now: DateTime<Utc>) -> usize {
        self.settle_stages(scope, ExecutableState::Succeed, now, |s| !s.is_success())
    }

    /// Force-settle unfinished stages to `ERROR`.
    pub fn make_stage_error(&mut self, scope: StageScope, now: DateTime<Utc>) -> usize {
        self.settle_stages(scope, ExecutableState::Error, now, |s| !s.is_final())
    }

    /// Next task the executor may start, honouring chain order: every
    /// predecessor must have completed successfully.
    pub fn next_runnable_task(&self) -> Option<&Task> {
        if self.output.status.is_final() || self.output.status == ExecutableState::Paused {
            return None;
        }
        for task in &self.tasks {
            let status = task.output.status;
            if status.is_success() {
                continue;
            }
            return match status {
                ExecutableState::Ready | ExecutableState::Pending => Some(task),
                _ => None,
            };
        }
        None
    }

    fn settle_stages<F>(
        &mut self,
        scope: StageScope,
        to: ExecutableState,
        now: DateTime<Utc>,
        eligible: F,
    ) -> usize
    where
        F: Fn(ExecutableState) -> bool + Copy,
    {
        let mut changed = 0;
        for task in &mut self.tasks {
            if let StageScope::Task(task_id) = scope {
                if task.id != task_id {
                    continue;
                }
            }
            changed += force_stages(task, to, now, eligible);
        }
        if changed > 0 {
            self.last_modified = now;
        }
        changed
    }

    fn force_open_work(&mut self, to: ExecutableState, now: DateTime<Utc>) {
        for task in &mut self.tasks {
            if !task.output.status.is_final() {
                task.output.force(to, now);
            }
            force_stages(task, to, now, |s| !s.is_final());
        }
    }
}

fn force_stages<F>(task: &mut Task, to: ExecutableState, now: DateTime<Utc>, eligible: F) -> usize
where
    F: Fn(ExecutableState) -> bool,
{
    let mut changed = 0;
    for stages in task.stages_map.values_mut() {
        for stage in stages.iter_mut() {
            if eligible(stage.output.status) && stage.output.force(to, now) {
                changed += 1;
            }
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HasStages, JobType, TaskParams};
    use segforge_core::ProjectName;

    fn build_job(segments: &[SegmentId]) -> Job {
        let params = TaskParams {
            segment_ids: segments.to_vec(),
            index_count: 10,
            ..Default::default()
        };
        Job::plan(
            ProjectName::new("retail").unwrap(),
            JobType::IndexBuild,
            "model-1",
            "alice",
            params,
            Utc::now(),
        )
    }

    fn build_task_id(job: &Job) -> TaskId {
        job.tasks[1].id
    }

    #[test]
    fn stage_update_on_unknown_segment_is_an_error() {
        let seg = SegmentId::new();
        let mut job = build_job(&[seg]);
        let stage_id = build_task_id(&job).stage(0);
        let err = job
            .update_stage_status(
                stage_id,
                SegmentId::new(),
                ExecutableState::Running,
                None,
                None,
                false,
                Utc::now(),
            )
            .unwrap_err();
        assert_eq!(err.code(), "STAGE_NOT_FOUND");
    }

    #[test]
    fn discard_cascades_to_open_stages_only() {
        let seg = SegmentId::new();
        let mut job = build_job(&[seg]);
        let task_id = build_task_id(&job);
        let now = Utc::now();

        job.update_stage_status(task_id.stage(0), seg, ExecutableState::Succeed, None, None, false, now)
            .unwrap();
        job.update_stage_status(task_id.stage(1), seg, ExecutableState::Running, None, None, false, now)
            .unwrap();

        job.discard(now).unwrap();

        let task = job.task(task_id).unwrap();
        assert_eq!(task.stage_status(task_id.stage(0), seg), Some(ExecutableState::Succeed));
        assert_eq!(task.stage_status(task_id.stage(1), seg), Some(ExecutableState::Discarded));
        assert_eq!(task.stage_status(task_id.stage(7), seg), Some(ExecutableState::Discarded));
        assert_eq!(job.status(), ExecutableState::Discarded);

        // Late executor callback is swallowed.
        let applied = job
            .update_stage_status(task_id.stage(1), seg, ExecutableState::Succeed, None, None, false, now)
            .unwrap();
        assert!(!applied);
    }

    #[test]
    fn pause_then_resume_restarts_unfinished_stages() {
        let seg = SegmentId::new();
        let mut job = build_job(&[seg]);
        let task_id = build_task_id(&job);
        let now = Utc::now();

        job.update_output(ExecutableState::Running, None, None, now).unwrap();
        job.update_stage_status(task_id.stage(0), seg, ExecutableState::Succeed, None, None, false, now)
            .unwrap();
        job.update_stage_status(task_id.stage(1), seg, ExecutableState::Running, None, None, false, now)
            .unwrap();

        job.pause(now).unwrap();
        let task = job.task(task_id).unwrap();
        assert_eq!(task.stage_status(task_id.stage(1), seg), Some(ExecutableState::Paused));

        job.resume(now).unwrap();
        let task = job.task(task_id).unwrap();
        assert_eq!(job.status(), ExecutableState::Ready);
        assert_eq!(task.stage_status(task_id.stage(0), seg), Some(ExecutableState::Succeed));
        assert_eq!(task.stage_status(task_id.stage(1), seg), Some(ExecutableState::Ready));
    }

    #[test]
    fn make_stage_success_is_noop_without_matching_stages() {
        let mut job = build_job(&[SegmentId::new()]);
        let detect = job.tasks[0].id;
        assert_eq!(job.make_stage_success(StageScope::Task(detect), Utc::now()), 0);
    }

    #[test]
    fn make_stage_success_settles_every_segment() {
        let seg_a = SegmentId::new();
        let seg_b = SegmentId::new();
        let mut job = build_job(&[seg_a, seg_b]);
        let task_id = build_task_id(&job);

        let changed = job.make_stage_success(StageScope::Task(task_id), Utc::now());
        assert_eq!(changed, 16);
        let task = job.task(task_id).unwrap();
        assert!(task
            .stages_map
            .values()
            .flatten()
            .all(|s| s.output.status == ExecutableState::Succeed));
    }

    #[test]
    fn make_stage_error_leaves_finished_stages() {
        let seg = SegmentId::new();
        let mut job = build_job(&[seg]);
        let task_id = build_task_id(&job);
        let now = Utc::now();
        job.update_stage_status(task_id.stage(0), seg, ExecutableState::Succeed, None, None, false, now)
            .unwrap();

        let changed = job.make_stage_error(StageScope::Job, now);
        assert_eq!(changed, 7);
        let task = job.task(task_id).unwrap();
        assert_eq!(task.stage_status(task_id.stage(0), seg), Some(ExecutableState::Succeed));
        assert_eq!(task.stage_status(task_id.stage(3), seg), Some(ExecutableState::Error));
    }

    #[test]
    fn restart_is_refused_for_discarded_jobs() {
        let mut job = build_job(&[SegmentId::new()]);
        job.discard(Utc::now()).unwrap();
        assert!(job.restart(Utc::now()).is_err());
    }

    #[test]
    fn chain_order_gates_next_task() {
        let mut job = build_job(&[SegmentId::new()]);
        let now = Utc::now();
        assert_eq!(job.next_runnable_task().map(|t| t.id), Some(job.tasks[0].id));

        let first = job.tasks[0].id;
        job.update_task_output(first, ExecutableState::Running, None, None, now).unwrap();
        assert!(job.next_runnable_task().is_none());

        job.update_task_output(first, ExecutableState::Succeed, None, None, now).unwrap();
        assert_eq!(job.next_runnable_task().map(|t| t.id), Some(job.tasks[1].id));
    }
}
