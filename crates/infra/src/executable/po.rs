use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use segforge_core::{JobId, PartitionId, ProjectName, SegmentId};
use segforge_jobs::{Job, JobType};

use crate::meta_store::MetaKey;

/// An executable record exactly as persisted.
///
/// `document` is the camelCase JSON form of [`Job`] (`id`, `project`,
/// `jobType`, `tasks[].stagesMap`, `output`, `mvcc`, ...). `mvcc` is the
/// store version the document was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutablePo {
    pub key: MetaKey,
    pub mvcc: u64,
    pub document: JsonValue,
}

impl ExecutablePo {
    pub fn to_job(&self) -> Result<Job, serde_json::Error> {
        let mut job: Job = serde_json::from_value(self.document.clone())?;
        job.mvcc = self.mvcc;
        Ok(job)
    }
}

/// What admission needs to know about a live job of a project without
/// loading it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobIndexEntry {
    pub job_id: JobId,
    pub job_type: JobType,
    pub target_subject: String,
    #[serde(default)]
    pub target_segments: Vec<SegmentId>,
    #[serde(default)]
    pub target_partitions: BTreeSet<PartitionId>,
    pub create_time: DateTime<Utc>,
}

impl JobIndexEntry {
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type,
            target_subject: job.target_subject.clone(),
            target_segments: job.target_segments.clone(),
            target_partitions: job.target_partitions.clone(),
            create_time: job.create_time,
        }
    }

    /// Whether this job and a new one of `job_type` would work on the same
    /// data.
    ///
    /// Table jobs contend with table jobs and model jobs with the same type.
    /// Segment jobs contend on shared segments, narrowed to shared
    /// partitions when both sides name some.
    pub fn contends(
        &self,
        job_type: JobType,
        segments: &[SegmentId],
        partitions: &BTreeSet<PartitionId>,
    ) -> bool {
        if job_type.is_table_job() || self.job_type.is_table_job() {
            return job_type.is_table_job() && self.job_type.is_table_job();
        }
        if job_type.is_model_job() || self.job_type.is_model_job() {
            return job_type == self.job_type;
        }
        if !self.target_segments.iter().any(|s| segments.contains(s)) {
            return false;
        }
        self.target_partitions.is_empty()
            || partitions.is_empty()
            || !self.target_partitions.is_disjoint(partitions)
    }
}

/// Non-final jobs of a project.
///
/// A job enters the index when it is admitted or brought back from a final
/// state, and leaves it when it reaches a final state or is deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobIndex {
    pub project: ProjectName,
    #[serde(default)]
    pub entries: Vec<JobIndexEntry>,
}

impl JobIndex {
    pub fn empty(project: ProjectName) -> Self {
        Self {
            project,
            entries: Vec::new(),
        }
    }

    /// Entries that act on `subject` (a model id or table name).
    pub fn for_subject<'a>(&'a self, subject: &'a str) -> impl Iterator<Item = &'a JobIndexEntry> {
        self.entries.iter().filter(move |e| e.target_subject == subject)
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.entries.iter().any(|e| e.job_id == job_id)
    }

    pub fn upsert(&mut self, entry: JobIndexEntry) {
        self.remove(entry.job_id);
        self.entries.push(entry);
    }

    /// Returns whether an entry was removed.
    pub fn remove(&mut self, job_id: JobId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.job_id != job_id);
        self.entries.len() != before
    }
}
