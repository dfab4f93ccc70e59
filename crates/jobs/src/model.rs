//! Job → Task → Stage graph.
//!
//! A job owns its tasks in declared (chain) order; a fan-out task owns one
//! ordered stage list per target segment. Parents are never referenced by
//! pointer: task and stage ids embed their parent id.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use segforge_core::{
    DomainError, JobId, LayoutId, PartitionId, ProjectName, SegmentId, StageId, TaskId, Versioned,
};

use crate::output::ExecutableOutput;
use crate::status::ExecutableState;

/// What a job builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    IncBuild,
    IndexBuild,
    IndexRefresh,
    IndexMerge,
    SubPartitionBuild,
    SubPartitionRefresh,
    SnapshotBuild,
    SnapshotRefresh,
    TableSampling,
    LayoutCleanup,
}

impl JobType {
    /// Jobs whose logical target is a source table rather than a model.
    pub fn is_table_job(self) -> bool {
        matches!(
            self,
            JobType::SnapshotBuild | JobType::SnapshotRefresh | JobType::TableSampling
        )
    }

    /// Jobs whose logical target is the model itself (no segment scope).
    pub fn is_model_job(self) -> bool {
        matches!(self, JobType::LayoutCleanup)
    }

    /// Chained task plan for this job type.
    pub fn task_plan(self) -> &'static [TaskKind] {
        match self {
            JobType::IncBuild
            | JobType::IndexBuild
            | JobType::IndexRefresh
            | JobType::SubPartitionBuild
            | JobType::SubPartitionRefresh => &[
                TaskKind::ResourceDetect,
                TaskKind::SegmentBuild,
                TaskKind::UpdateMetadata,
            ],
            JobType::IndexMerge => &[
                TaskKind::ResourceDetect,
                TaskKind::SegmentMerge,
                TaskKind::UpdateMetadata,
            ],
            JobType::SnapshotBuild | JobType::SnapshotRefresh => {
                &[TaskKind::SnapshotBuild, TaskKind::UpdateMetadata]
            }
            JobType::TableSampling => &[TaskKind::TableSampling],
            JobType::LayoutCleanup => &[TaskKind::LayoutCleanup],
        }
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            JobType::IncBuild => "INC_BUILD",
            JobType::IndexBuild => "INDEX_BUILD",
            JobType::IndexRefresh => "INDEX_REFRESH",
            JobType::IndexMerge => "INDEX_MERGE",
            JobType::SubPartitionBuild => "SUB_PARTITION_BUILD",
            JobType::SubPartitionRefresh => "SUB_PARTITION_REFRESH",
            JobType::SnapshotBuild => "SNAPSHOT_BUILD",
            JobType::SnapshotRefresh => "SNAPSHOT_REFRESH",
            JobType::TableSampling => "TABLE_SAMPLING",
            JobType::LayoutCleanup => "LAYOUT_CLEANUP",
        };
        f.write_str(s)
    }
}

/// Concrete task variants. Capabilities (fan-out, work share) are selected by
/// kind rather than by subtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    ResourceDetect,
    SegmentBuild,
    SegmentMerge,
    UpdateMetadata,
    SnapshotBuild,
    TableSampling,
    LayoutCleanup,
}

impl TaskKind {
    /// Stages this task fans out per target segment (empty if it does not).
    pub fn stage_plan(self) -> &'static [StageKind] {
        match self {
            TaskKind::SegmentBuild => &[
                StageKind::WaitForResources,
                StageKind::RefreshSnapshots,
                StageKind::MaterializeFactTable,
                StageKind::BuildGlobalDict,
                StageKind::GenerateFlatTable,
                StageKind::GatherFlatTableStats,
                StageKind::BuildLayer,
                StageKind::RefreshColumnBytes,
            ],
            TaskKind::SegmentMerge => &[
                StageKind::WaitForResources,
                StageKind::MergeFlatTable,
                StageKind::MergeIndices,
                StageKind::MergeColumnBytes,
            ],
            _ => &[],
        }
    }

    pub fn fans_out(self) -> bool {
        !self.stage_plan().is_empty()
    }

    /// Declared share of the owning job's total work.
    pub fn work_share(self) -> f64 {
        match self {
            TaskKind::ResourceDetect => 0.05,
            TaskKind::SegmentBuild | TaskKind::SegmentMerge => 0.85,
            TaskKind::UpdateMetadata => 0.10,
            TaskKind::SnapshotBuild | TaskKind::TableSampling | TaskKind::LayoutCleanup => 0.90,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageKind {
    WaitForResources,
    RefreshSnapshots,
    MaterializeFactTable,
    BuildGlobalDict,
    GenerateFlatTable,
    GatherFlatTableStats,
    BuildLayer,
    RefreshColumnBytes,
    MergeFlatTable,
    MergeIndices,
    MergeColumnBytes,
}

/// Scheduling priority, `0` (highest) to `4` (lowest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(0);
    pub const DEFAULT: Priority = Priority(3);
    pub const LOWEST: Priority = Priority(4);

    pub fn new(value: u8) -> Result<Self, DomainError> {
        if value > Self::LOWEST.0 {
            return Err(DomainError::validation(format!(
                "priority must be between 0 and 4, got {value}"
            )));
        }
        Ok(Self(value))
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<u8> for Priority {
    type Error = DomainError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        value.0
    }
}

/// Typed task parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskParams {
    #[serde(default)]
    pub segment_ids: Vec<SegmentId>,
    #[serde(default)]
    pub layout_ids: BTreeSet<LayoutId>,
    #[serde(default)]
    pub partition_ids: BTreeSet<PartitionId>,
    #[serde(default)]
    pub partial_build: bool,
    /// Number of indexes a stage builds; denominator of running progress.
    #[serde(default)]
    pub index_count: u64,
}

/// One stage entry of a segment's stage list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub id: StageId,
    pub kind: StageKind,
    pub output: ExecutableOutput,
}

impl Stage {
    pub fn parent_task_id(&self) -> TaskId {
        self.id.task_id()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub params: TaskParams,
    pub work_share: f64,
    pub output: ExecutableOutput,
    #[serde(default)]
    pub stages_map: BTreeMap<SegmentId, Vec<Stage>>,
}

impl Task {
    /// Create a task, fanning out one stage list per target segment when the
    /// kind calls for it.
    pub fn new(id: TaskId, kind: TaskKind, params: TaskParams, now: DateTime<Utc>) -> Self {
        let mut stages_map = BTreeMap::new();
        if kind.fans_out() {
            for segment_id in &params.segment_ids {
                let stages = kind
                    .stage_plan()
                    .iter()
                    .enumerate()
                    .map(|(seq, stage_kind)| Stage {
                        id: id.stage(seq as u16),
                        kind: *stage_kind,
                        output: ExecutableOutput::new(now),
                    })
                    .collect();
                stages_map.insert(*segment_id, stages);
            }
        }

        Self {
            id,
            kind,
            params,
            work_share: kind.work_share(),
            output: ExecutableOutput::new(now),
            stages_map,
        }
    }

    pub fn parent_job_id(&self) -> JobId {
        self.id.job_id()
    }

    /// Number of stages each segment runs.
    pub fn stages_per_segment(&self) -> usize {
        self.kind.stage_plan().len()
    }
}

/// A chained executable: tasks run strictly in declared order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub project: ProjectName,
    pub job_type: JobType,
    pub priority: Priority,
    /// Model id, or qualified table name for table jobs.
    pub target_subject: String,
    #[serde(default)]
    pub target_segments: Vec<SegmentId>,
    #[serde(default)]
    pub target_partitions: BTreeSet<PartitionId>,
    pub submitter: String,
    pub tag: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    pub tasks: Vec<Task>,
    pub output: ExecutableOutput,
    /// Version of the persisted record this value was read at (0 = unsaved).
    #[serde(default)]
    pub mvcc: u64,
    pub create_time: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl Job {
    /// Plan a job graph from its type.
    ///
    /// Fan-out tasks receive `task_params` (and therefore one stage list per
    /// segment in `task_params.segment_ids`); other tasks receive the same
    /// targets without fan-out.
    pub fn plan(
        project: ProjectName,
        job_type: JobType,
        target_subject: impl Into<String>,
        submitter: impl Into<String>,
        task_params: TaskParams,
        now: DateTime<Utc>,
    ) -> Self {
        let id = JobId::new();
        let tasks = job_type
            .task_plan()
            .iter()
            .enumerate()
            .map(|(seq, kind)| Task::new(id.task(seq as u16), *kind, task_params.clone(), now))
            .collect();

        Self {
            id,
            project,
            job_type,
            priority: Priority::default(),
            target_subject: target_subject.into(),
            target_segments: task_params.segment_ids.clone(),
            target_partitions: task_params.partition_ids.clone(),
            submitter: submitter.into(),
            tag: None,
            params: BTreeMap::new(),
            tasks,
            output: ExecutableOutput::new(now),
            mvcc: 0,
            create_time: now,
            last_modified: now,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tag(mut self, tag: Option<String>) -> Self {
        self.tag = tag;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn status(&self) -> ExecutableState {
        self.output.status
    }

    pub fn is_final(&self) -> bool {
        self.output.status.is_final()
    }

    pub fn task(&self, task_id: TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn task_mut(&mut self, task_id: TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    /// Whether this job and `other_segments` contend for a segment.
    pub fn targets_any_segment(&self, other_segments: &[SegmentId]) -> bool {
        self.target_segments
            .iter()
            .any(|s| other_segments.contains(s))
    }
}

impl Versioned for Job {
    fn mvcc(&self) -> u64 {
        self.mvcc
    }

    fn set_mvcc(&mut self, mvcc: u64) {
        self.mvcc = mvcc;
    }
}

/// Anything carrying an output record.
pub trait HasStatus {
    fn output(&self) -> &ExecutableOutput;

    fn status(&self) -> ExecutableState {
        self.output().status
    }
}

/// Executables that chain sub-tasks.
pub trait HasSubTasks {
    fn sub_tasks(&self) -> &[Task];
}

/// Executables that fan out per-segment stages.
pub trait HasStages {
    fn stages_map(&self) -> &BTreeMap<SegmentId, Vec<Stage>>;

    fn stages_for(&self, segment_id: SegmentId) -> &[Stage] {
        self.stages_map()
            .get(&segment_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn stage_status(&self, stage_id: StageId, segment_id: SegmentId) -> Option<ExecutableState> {
        self.stages_for(segment_id)
            .iter()
            .find(|s| s.id == stage_id)
            .map(|s| s.output.status)
    }
}

impl HasStatus for Job {
    fn output(&self) -> &ExecutableOutput {
        &self.output
    }
}

impl HasStatus for Task {
    fn output(&self) -> &ExecutableOutput {
        &self.output
    }
}

impl HasStatus for Stage {
    fn output(&self) -> &ExecutableOutput {
        &self.output
    }
}

impl HasSubTasks for Job {
    fn sub_tasks(&self) -> &[Task] {
        &self.tasks
    }
}

impl HasStages for Task {
    fn stages_map(&self) -> &BTreeMap<SegmentId, Vec<Stage>> {
        &self.stages_map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project() -> ProjectName {
        ProjectName::new("retail").unwrap()
    }

    #[test]
    fn build_job_fans_out_stages_per_segment() {
        let seg_a = SegmentId::new();
        let seg_b = SegmentId::new();
        let params = TaskParams {
            segment_ids: vec![seg_a, seg_b],
            index_count: 10,
            ..Default::default()
        };
        let job = Job::plan(project(), JobType::IndexBuild, "model-1", "alice", params, Utc::now());

        assert_eq!(job.tasks.len(), 3);
        let build = &job.tasks[1];
        assert_eq!(build.kind, TaskKind::SegmentBuild);
        assert_eq!(build.parent_job_id(), job.id);
        assert_eq!(build.stages_for(seg_a).len(), 8);
        assert_eq!(build.stages_for(seg_b).len(), 8);
        assert!(job.tasks[0].stages_map.is_empty());

        let stage = &build.stages_for(seg_a)[6];
        assert_eq!(stage.kind, StageKind::BuildLayer);
        assert_eq!(stage.parent_task_id(), build.id);
        assert_eq!(
            build.stage_status(stage.id, seg_b),
            Some(ExecutableState::Ready)
        );
    }

    #[test]
    fn table_jobs_do_not_fan_out() {
        let job = Job::plan(
            project(),
            JobType::TableSampling,
            "DEFAULT.SALES",
            "bob",
            TaskParams::default(),
            Utc::now(),
        );
        assert!(JobType::TableSampling.is_table_job());
        assert_eq!(job.tasks.len(), 1);
        assert!(job.tasks.iter().all(|t| t.stages_map.is_empty()));
    }

    #[test]
    fn priority_is_bounded() {
        assert!(Priority::new(5).is_err());
        assert_eq!(Priority::new(0).unwrap(), Priority::HIGHEST);
    }

    #[test]
    fn job_round_trips_through_json() {
        let params = TaskParams {
            segment_ids: vec![SegmentId::new()],
            ..Default::default()
        };
        let job = Job::plan(project(), JobType::IncBuild, "model-1", "alice", params, Utc::now())
            .with_tag(Some("nightly".into()));
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["jobType"], "INC_BUILD");
        let back: Job = serde_json::from_value(json).unwrap();
        assert_eq!(back, job);
    }
}
