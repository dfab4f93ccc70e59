use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use segforge_core::{JobId, LayoutId, PartitionId, ProjectName, SegmentId, TaskId};
use segforge_jobs::{Job, JobType, Priority};

use super::dataflow::SegmentRange;

/// A request to build something, as received from an outer surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    pub project: ProjectName,
    pub submitter: String,
    #[serde(default)]
    pub priority: Priority,
    /// Resource queue hint forwarded to the compute engine.
    #[serde(default)]
    pub yarn_queue: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub partial_build: bool,
    pub target: BuildTarget,
}

impl BuildRequest {
    pub fn new(project: ProjectName, submitter: impl Into<String>, target: BuildTarget) -> Self {
        Self {
            project,
            submitter: submitter.into(),
            priority: Priority::default(),
            yarn_queue: None,
            tag: None,
            partial_build: false,
            target,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_yarn_queue(mut self, queue: impl Into<String>) -> Self {
        self.yarn_queue = Some(queue.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum BuildTarget {
    /// New segment over `range`. An empty `layout_ids` builds every layout.
    IncrementalSegment {
        model_id: String,
        range: SegmentRange,
        #[serde(default)]
        layout_ids: BTreeSet<LayoutId>,
        /// Partition value tuples for multi-partition models.
        #[serde(default)]
        partition_values: Vec<Vec<String>>,
    },
    /// Add layouts to existing segments.
    Indexes {
        model_id: String,
        segment_ids: Vec<SegmentId>,
        layout_ids: BTreeSet<LayoutId>,
    },
    Refresh {
        model_id: String,
        segment_ids: Vec<SegmentId>,
    },
    Merge {
        model_id: String,
        segment_ids: Vec<SegmentId>,
    },
    Partitions {
        model_id: String,
        segment_id: SegmentId,
        partition_values: Vec<Vec<String>>,
        #[serde(default)]
        refresh: bool,
    },
    Snapshot {
        table: String,
        #[serde(default)]
        refresh: bool,
    },
    Sampling {
        table: String,
        rows: u64,
    },
    LayoutCleanup {
        model_id: String,
    },
}

impl BuildTarget {
    pub fn job_type(&self) -> JobType {
        match self {
            BuildTarget::IncrementalSegment { .. } => JobType::IncBuild,
            BuildTarget::Indexes { .. } => JobType::IndexBuild,
            BuildTarget::Refresh { .. } => JobType::IndexRefresh,
            BuildTarget::Merge { .. } => JobType::IndexMerge,
            BuildTarget::Partitions { refresh: false, .. } => JobType::SubPartitionBuild,
            BuildTarget::Partitions { refresh: true, .. } => JobType::SubPartitionRefresh,
            BuildTarget::Snapshot { refresh: false, .. } => JobType::SnapshotBuild,
            BuildTarget::Snapshot { refresh: true, .. } => JobType::SnapshotRefresh,
            BuildTarget::Sampling { .. } => JobType::TableSampling,
            BuildTarget::LayoutCleanup { .. } => JobType::LayoutCleanup,
        }
    }

    /// Model id or table name the job acts on.
    pub fn subject(&self) -> &str {
        match self {
            BuildTarget::IncrementalSegment { model_id, .. }
            | BuildTarget::Indexes { model_id, .. }
            | BuildTarget::Refresh { model_id, .. }
            | BuildTarget::Merge { model_id, .. }
            | BuildTarget::Partitions { model_id, .. }
            | BuildTarget::LayoutCleanup { model_id } => model_id,
            BuildTarget::Snapshot { table, .. } | BuildTarget::Sampling { table, .. } => table,
        }
    }
}

/// Everything the compute engine needs to run an admitted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobParam {
    pub job_id: JobId,
    pub project: ProjectName,
    pub job_type: JobType,
    pub target_subject: String,
    pub target_segments: Vec<SegmentId>,
    pub target_partitions: BTreeSet<PartitionId>,
    pub layout_ids: BTreeSet<LayoutId>,
    pub task_ids: Vec<TaskId>,
    pub priority: Priority,
    pub yarn_queue: Option<String>,
    pub partial_build: bool,
    pub tag: Option<String>,
    pub submitter: String,
}

impl JobParam {
    pub fn for_job(job: &Job, request: &BuildRequest) -> Self {
        let layout_ids = job
            .tasks
            .iter()
            .flat_map(|t| t.params.layout_ids.iter().copied())
            .collect();
        Self {
            job_id: job.id,
            project: job.project.clone(),
            job_type: job.job_type,
            target_subject: job.target_subject.clone(),
            target_segments: job.target_segments.clone(),
            target_partitions: job.target_partitions.clone(),
            layout_ids,
            task_ids: job.tasks.iter().map(|t| t.id).collect(),
            priority: job.priority,
            yarn_queue: request.yarn_queue.clone(),
            partial_build: request.partial_build,
            tag: job.tag.clone(),
            submitter: job.submitter.clone(),
        }
    }
}
