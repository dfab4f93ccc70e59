//! Strongly-typed identifiers used across the orchestration core.
//!
//! Parent/child relations between executables are id computations, never
//! owning references: a [`TaskId`] embeds its job id and a [`StageId`] embeds
//! its task id.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a job (a chained executable).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

/// Identifier of a segment of a model's dataflow.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
            /// for determinism.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(JobId, "JobId");
impl_uuid_newtype!(SegmentId, "SegmentId");

impl JobId {
    /// Id of the task at position `seq` inside this job.
    pub fn task(&self, seq: u16) -> TaskId {
        TaskId { job_id: *self, seq }
    }
}

/// Identifier of a task: `<job-id>_<seq>`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId {
    job_id: JobId,
    seq: u16,
}

impl TaskId {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn seq(&self) -> u16 {
        self.seq
    }

    /// Id of the stage at position `seq` inside this task.
    pub fn stage(&self, seq: u16) -> StageId {
        StageId { task_id: *self, seq }
    }
}

impl core::fmt::Display for TaskId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}_{:02}", self.job_id, self.seq)
    }
}

impl FromStr for TaskId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (job, seq) = s
            .rsplit_once('_')
            .ok_or_else(|| DomainError::invalid_id(format!("TaskId: missing sequence in '{s}'")))?;
        let seq = seq
            .parse::<u16>()
            .map_err(|e| DomainError::invalid_id(format!("TaskId: {e}")))?;
        Ok(Self {
            job_id: job.parse()?,
            seq,
        })
    }
}

impl TryFrom<String> for TaskId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TaskId> for String {
    fn from(value: TaskId) -> Self {
        value.to_string()
    }
}

/// Identifier of a stage: `<task-id>_<seq>`.
///
/// A stage id is shared by every segment the owning task fans out over; the
/// per-segment state lives next to it, keyed by [`SegmentId`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StageId {
    task_id: TaskId,
    seq: u16,
}

impl StageId {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn job_id(&self) -> JobId {
        self.task_id.job_id
    }

    pub fn seq(&self) -> u16 {
        self.seq
    }
}

impl core::fmt::Display for StageId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}_{:02}", self.task_id, self.seq)
    }
}

impl FromStr for StageId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (task, seq) = s
            .rsplit_once('_')
            .ok_or_else(|| DomainError::invalid_id(format!("StageId: missing sequence in '{s}'")))?;
        let seq = seq
            .parse::<u16>()
            .map_err(|e| DomainError::invalid_id(format!("StageId: {e}")))?;
        Ok(Self {
            task_id: task.parse()?,
            seq,
        })
    }
}

impl TryFrom<String> for StageId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StageId> for String {
    fn from(value: StageId) -> Self {
        value.to_string()
    }
}

/// Name of a project (the isolation boundary for jobs, models and offsets).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProjectName(String);

impl ProjectName {
    pub fn new(name: impl Into<String>) -> Result<Self, DomainError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DomainError::validation("project name must not be empty"));
        }
        if name.contains('/') {
            return Err(DomainError::validation(format!(
                "project name must not contain '/': {name}"
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ProjectName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ProjectName {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ProjectName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ProjectName> for String {
    fn from(value: ProjectName) -> Self {
        value.0
    }
}

/// Identifier of a layout (a precomputed aggregate or table index).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayoutId(pub u64);

impl core::fmt::Display for LayoutId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Identifier of a partition inside a multi-partition segment.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub u64);

impl core::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_and_stage_ids_round_trip_through_strings() {
        let job = JobId::new();
        let task = job.task(1);
        let stage = task.stage(3);

        assert_eq!(task.to_string(), format!("{job}_01"));
        assert_eq!(stage.to_string(), format!("{job}_01_03"));

        let parsed: StageId = stage.to_string().parse().unwrap();
        assert_eq!(parsed, stage);
        assert_eq!(parsed.task_id(), task);
        assert_eq!(parsed.job_id(), job);
    }

    #[test]
    fn malformed_task_id_is_rejected() {
        assert!("not-a-task".parse::<TaskId>().is_err());
        assert!(format!("{}_xx", JobId::new()).parse::<TaskId>().is_err());
    }

    #[test]
    fn stage_id_serializes_as_string() {
        let stage = JobId::new().task(0).stage(2);
        let json = serde_json::to_value(stage).unwrap();
        assert_eq!(json, serde_json::Value::String(stage.to_string()));
        let back: StageId = serde_json::from_value(json).unwrap();
        assert_eq!(back, stage);
    }

    #[test]
    fn project_name_rejects_empty_and_slashes() {
        assert!(ProjectName::new("").is_err());
        assert!(ProjectName::new("a/b").is_err());
        assert_eq!(ProjectName::new("sales").unwrap().as_str(), "sales");
    }
}
