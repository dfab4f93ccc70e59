use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use segforge_core::ProjectName;

use super::request::JobParam;

/// Per-project concurrency limits consulted by admission.
pub trait AdmissionPolicy: Send + Sync {
    fn running_job_limit(&self, project: &ProjectName) -> usize;
}

/// Limits from configuration: one default, optional per-project overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticAdmissionPolicy {
    pub default_limit: usize,
    #[serde(default)]
    pub per_project: BTreeMap<String, usize>,
}

impl StaticAdmissionPolicy {
    pub fn new(default_limit: usize) -> Self {
        Self {
            default_limit,
            per_project: BTreeMap::new(),
        }
    }

    pub fn with_project_limit(mut self, project: impl Into<String>, limit: usize) -> Self {
        self.per_project.insert(project.into(), limit);
        self
    }
}

impl AdmissionPolicy for StaticAdmissionPolicy {
    fn running_job_limit(&self, project: &ProjectName) -> usize {
        self.per_project
            .get(project.as_str())
            .copied()
            .unwrap_or(self.default_limit)
    }
}

/// Id the compute engine assigned to a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutorJobId(pub String);

impl core::fmt::Display for ExecutorJobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("compute engine rejected the job: {0}")]
    Rejected(String),

    #[error("compute engine unavailable: {0}")]
    Unavailable(String),
}

impl SubmitError {
    pub fn code(&self) -> &'static str {
        match self {
            SubmitError::Rejected(_) => "SUBMIT_REJECTED",
            SubmitError::Unavailable(_) => "SUBMIT_UNAVAILABLE",
        }
    }
}

/// Hands admitted jobs to the compute engine.
pub trait ComputeSubmitter: Send + Sync {
    fn submit(&self, param: &JobParam) -> Result<ExecutorJobId, SubmitError>;
}

/// In-memory submitter for tests/dev: records every param and hands out
/// sequential executor ids.
#[derive(Debug, Default)]
pub struct RecordingSubmitter {
    submitted: Mutex<Vec<JobParam>>,
    next_id: AtomicU64,
    failing: AtomicBool,
}

impl RecordingSubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent submissions fail with [`SubmitError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn submitted(&self) -> Vec<JobParam> {
        self.submitted
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }
}

impl ComputeSubmitter for RecordingSubmitter {
    fn submit(&self, param: &JobParam) -> Result<ExecutorJobId, SubmitError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SubmitError::Unavailable("cluster is unreachable".to_string()));
        }
        self.submitted
            .lock()
            .map_err(|_| SubmitError::Unavailable("lock poisoned".to_string()))?
            .push(param.clone());
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ExecutorJobId(format!("application_{n:04}")))
    }
}
