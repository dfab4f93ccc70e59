//! Progress ratios derived from accumulated stage state.
//!
//! Scores compose bottom-up: stage contribution → segment score → task ratio →
//! job step ratio. Only the job step ratio is normalised and capped.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use segforge_core::{JobId, SegmentId, TaskId};

use crate::model::{HasStages, Job, Stage, Task};
use crate::output::ExecutableOutput;
use crate::status::ExecutableState;

/// Upper bound for the displayed ratio of a job that has not succeeded yet.
pub const DEFAULT_UNFINISHED_RATIO_CAP: f64 = 0.99;

/// Largest cap an unfinished job may report; strictly below `1.0`.
pub const MAX_UNFINISHED_RATIO_CAP: f64 = 1.0 - f64::EPSILON;

/// Contribution of one stage to its segment's score, in `[0, 1]`.
pub fn stage_contribution(stage: &Stage, index_count: u64) -> f64 {
    match stage.output.status {
        ExecutableState::Succeed | ExecutableState::Skip => 1.0,
        ExecutableState::Running => match stage.output.index_success_count() {
            Some(done) if index_count > 0 => (done as f64 / index_count as f64).min(1.0),
            _ => 0.0,
        },
        _ => 0.0,
    }
}

/// Sum of stage contributions for one segment (3 finished stages → `3.0`).
pub fn segment_score(task: &Task, segment_id: SegmentId) -> f64 {
    task.stages_for(segment_id)
        .iter()
        .map(|s| stage_contribution(s, task.params.index_count))
        .sum()
}

/// Mean segment score over the task's configured segments.
///
/// Configured segments without recorded stages count in the denominator.
pub fn task_ratio(task: &Task) -> f64 {
    let segments = &task.params.segment_ids;
    if segments.is_empty() {
        return 0.0;
    }
    let total: f64 = segments.iter().map(|s| segment_score(task, *s)).sum();
    total / segments.len() as f64
}

/// Task completion in `[0, 1]`.
pub fn task_progress(task: &Task) -> f64 {
    if task.output.status.is_success() {
        return 1.0;
    }
    let per_segment = task.stages_per_segment();
    if per_segment == 0 {
        return 0.0;
    }
    (task_ratio(task) / per_segment as f64).clamp(0.0, 1.0)
}

/// Job-level ratio shown to users.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepRatioCalculator {
    unfinished_cap: f64,
}

impl Default for StepRatioCalculator {
    fn default() -> Self {
        Self {
            unfinished_cap: DEFAULT_UNFINISHED_RATIO_CAP,
        }
    }
}

impl StepRatioCalculator {
    /// `unfinished_cap` is clamped into `[0, 1)`; a non-finite cap falls back
    /// to the default.
    pub fn new(unfinished_cap: f64) -> Self {
        if !unfinished_cap.is_finite() {
            return Self::default();
        }
        Self {
            unfinished_cap: unfinished_cap.clamp(0.0, MAX_UNFINISHED_RATIO_CAP),
        }
    }

    pub fn unfinished_cap(&self) -> f64 {
        self.unfinished_cap
    }

    /// Work-share weighted task progress, capped below `1.0` until the job
    /// has actually succeeded.
    pub fn step_ratio(&self, job: &Job) -> f64 {
        if job.output.status == ExecutableState::Succeed {
            return 1.0;
        }
        let total_share: f64 = job.tasks.iter().map(|t| t.work_share).sum();
        if total_share <= 0.0 {
            return 0.0;
        }
        let done: f64 = job
            .tasks
            .iter()
            .map(|t| t.work_share * task_progress(t))
            .sum();
        (done / total_share).min(self.unfinished_cap)
    }
}

/// Time spent in `READY` before the first `RUNNING`.
pub fn wait_time(output: &ExecutableOutput, now: DateTime<Utc>) -> Duration {
    let until = match output.start_time {
        Some(start) => start,
        None if matches!(
            output.status,
            ExecutableState::Ready | ExecutableState::Pending
        ) =>
        {
            now
        }
        None => return Duration::ZERO,
    };
    (until - output.create_time).to_std().unwrap_or(Duration::ZERO)
}

/// Wait-time breakdown for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskWaitTime {
    pub task_id: TaskId,
    pub wait_ms: u64,
    /// Per segment: wait before the segment's first stage started.
    pub segments: Vec<(SegmentId, u64)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitTimes {
    pub job_id: JobId,
    pub job_wait_ms: u64,
    pub tasks: Vec<TaskWaitTime>,
}

/// Derive wait times for a job, its tasks, and every fanned-out segment.
pub fn wait_times(job: &Job, now: DateTime<Utc>) -> WaitTimes {
    let tasks = job
        .tasks
        .iter()
        .map(|task| {
            let segments = task
                .stages_map
                .iter()
                .filter_map(|(segment_id, stages)| {
                    stages
                        .first()
                        .map(|first| (*segment_id, millis(wait_time(&first.output, now))))
                })
                .collect();
            TaskWaitTime {
                task_id: task.id,
                wait_ms: millis(wait_time(&task.output, now)),
                segments,
            }
        })
        .collect();

    WaitTimes {
        job_id: job.id,
        job_wait_ms: millis(wait_time(&job.output, now)),
        tasks,
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::model::{JobType, TaskParams};
    use crate::output::INDEX_SUCCESS_COUNT;
    use segforge_core::ProjectName;

    fn count(n: u64) -> BTreeMap<String, String> {
        BTreeMap::from([(INDEX_SUCCESS_COUNT.to_string(), n.to_string())])
    }

    fn job_with_segments(segments: Vec<SegmentId>) -> Job {
        Job::plan(
            ProjectName::new("retail").unwrap(),
            JobType::IndexBuild,
            "model-1",
            "alice",
            TaskParams {
                segment_ids: segments,
                index_count: 10,
                ..Default::default()
            },
            Utc::now(),
        )
    }

    fn set(job: &mut Job, seg: SegmentId, seq: u16, status: ExecutableState, info: Option<u64>) {
        let task_id = job.tasks[1].id;
        let info = info.map(count);
        job.update_stage_status(task_id.stage(seq), seg, status, info.as_ref(), None, false, Utc::now())
            .unwrap();
    }

    #[test]
    fn running_stage_contributes_fraction_of_index_count() {
        let seg = SegmentId::new();
        let mut job = job_with_segments(vec![seg]);

        set(&mut job, seg, 0, ExecutableState::Running, Some(1));
        assert!((segment_score(&job.tasks[1], seg) - 0.1).abs() < 1e-9);

        set(&mut job, seg, 0, ExecutableState::Running, Some(8));
        assert!((segment_score(&job.tasks[1], seg) - 0.8).abs() < 1e-9);

        set(&mut job, seg, 0, ExecutableState::Running, Some(10));
        assert!((segment_score(&job.tasks[1], seg) - 1.0).abs() < 1e-9);

        set(&mut job, seg, 0, ExecutableState::Succeed, Some(12));
        assert!((segment_score(&job.tasks[1], seg) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn unconfigured_progress_counts_configured_segments_in_denominator() {
        let seg_a = SegmentId::new();
        let seg_b = SegmentId::new();
        let mut job = job_with_segments(vec![seg_a, seg_b]);
        // Only segment A has stages recorded.
        job.tasks[1].stages_map.remove(&seg_b);

        set(&mut job, seg_a, 0, ExecutableState::Succeed, None);
        set(&mut job, seg_a, 1, ExecutableState::Skip, None);
        set(&mut job, seg_a, 2, ExecutableState::Succeed, None);

        assert!((segment_score(&job.tasks[1], seg_a) - 3.0).abs() < 1e-9);
        assert!((task_ratio(&job.tasks[1]) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn task_ratio_tracks_stage_completion() {
        let seg_a = SegmentId::new();
        let seg_b = SegmentId::new();
        let mut job = job_with_segments(vec![seg_a, seg_b]);
        job.tasks[1].stages_map.remove(&seg_b);

        set(&mut job, seg_a, 0, ExecutableState::Running, Some(12));
        set(&mut job, seg_a, 0, ExecutableState::Succeed, None);
        assert!((task_ratio(&job.tasks[1]) - 0.5).abs() < 1e-9);

        set(&mut job, seg_a, 1, ExecutableState::Succeed, None);
        assert!((task_ratio(&job.tasks[1]) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn other_states_contribute_nothing() {
        let seg = SegmentId::new();
        let mut job = job_with_segments(vec![seg]);
        set(&mut job, seg, 0, ExecutableState::Running, None);
        set(&mut job, seg, 1, ExecutableState::Error, None);
        assert_eq!(segment_score(&job.tasks[1], seg), 0.0);
    }

    #[test]
    fn zero_index_count_is_not_a_division_by_zero() {
        let seg = SegmentId::new();
        let mut job = job_with_segments(vec![seg]);
        job.tasks[1].params.index_count = 0;
        set(&mut job, seg, 0, ExecutableState::Running, Some(5));
        assert_eq!(segment_score(&job.tasks[1], seg), 0.0);
    }

    #[test]
    fn step_ratio_is_capped_until_success() {
        let seg = SegmentId::new();
        let mut job = job_with_segments(vec![seg]);
        let now = Utc::now();
        let calc = StepRatioCalculator::default();
        assert_eq!(calc.step_ratio(&job), 0.0);

        job.update_output(ExecutableState::Running, None, None, now).unwrap();
        for task in job.tasks.iter().map(|t| t.id).collect::<Vec<_>>() {
            job.update_task_output(task, ExecutableState::Running, None, None, now).unwrap();
            job.update_task_output(task, ExecutableState::Succeed, None, None, now).unwrap();
        }
        assert!((calc.step_ratio(&job) - DEFAULT_UNFINISHED_RATIO_CAP).abs() < 1e-9);

        job.update_output(ExecutableState::Succeed, None, None, now).unwrap();
        assert_eq!(calc.step_ratio(&job), 1.0);
    }

    #[test]
    fn cap_never_reaches_one_before_success() {
        let seg = SegmentId::new();
        let mut job = job_with_segments(vec![seg]);
        let now = Utc::now();
        job.update_output(ExecutableState::Running, None, None, now).unwrap();
        for task in job.tasks.iter().map(|t| t.id).collect::<Vec<_>>() {
            job.update_task_output(task, ExecutableState::Running, None, None, now).unwrap();
            job.update_task_output(task, ExecutableState::Succeed, None, None, now).unwrap();
        }

        for cap in [1.0, 1.5, f64::INFINITY, f64::NAN] {
            let calc = StepRatioCalculator::new(cap);
            assert!(calc.unfinished_cap() < 1.0, "cap {cap}");
            assert!(calc.step_ratio(&job) < 1.0, "cap {cap}");
        }
        assert_eq!(StepRatioCalculator::new(-0.5).step_ratio(&job), 0.0);
    }

    #[test]
    fn step_ratio_weights_tasks_by_work_share() {
        let seg = SegmentId::new();
        let mut job = job_with_segments(vec![seg]);
        let now = Utc::now();
        let detect = job.tasks[0].id;
        job.update_task_output(detect, ExecutableState::Running, None, None, now).unwrap();
        job.update_task_output(detect, ExecutableState::Succeed, None, None, now).unwrap();

        // Half of the build stages done.
        for seq in 0..4 {
            set(&mut job, seg, seq, ExecutableState::Succeed, None);
        }

        let ratio = StepRatioCalculator::new(0.99).step_ratio(&job);
        let expected = (0.05 + 0.85 * 0.5) / 1.0;
        assert!((ratio - expected).abs() < 1e-9, "ratio {ratio}");
    }

    #[test]
    fn wait_time_stops_at_first_start() {
        let created = Utc::now() - chrono::Duration::seconds(30);
        let mut out = ExecutableOutput::new(created);
        assert!(wait_time(&out, Utc::now()) >= Duration::from_secs(30));

        out.start_time = Some(created + chrono::Duration::seconds(5));
        out.status = ExecutableState::Running;
        assert_eq!(wait_time(&out, Utc::now()), Duration::from_secs(5));
    }

    #[test]
    fn wait_times_cover_every_segment() {
        let segs = vec![SegmentId::new(), SegmentId::new()];
        let job = job_with_segments(segs.clone());
        let waits = wait_times(&job, Utc::now());
        assert_eq!(waits.tasks.len(), 3);
        assert_eq!(waits.tasks[1].segments.len(), 2);
        assert!(waits.tasks[0].segments.is_empty());
    }
}
