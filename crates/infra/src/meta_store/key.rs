use serde::{Deserialize, Serialize};

use segforge_core::{JobId, ProjectName};

/// Path-like key of a metadata record, always scoped under a project.
///
/// Layout:
/// - `/{project}/execute/{job_id}`: executable records
/// - `/{project}/execute_index`: ids and targets of every job in the project
/// - `/{project}/dataflow/{model_id}`: segments and partitions of a model
/// - `/{project}/table/{db.table}`: registered source tables
/// - `/{project}/offset/{offset_type}`: maintenance cursors
/// - `/{project}/layout_usage/{model_id}`: rolled-up layout hit counts
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetaKey(String);

impl MetaKey {
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn executable(project: &ProjectName, job_id: JobId) -> Self {
        Self(format!("{}{job_id}", Self::executables_prefix(project)))
    }

    pub fn executables_prefix(project: &ProjectName) -> String {
        format!("/{project}/execute/")
    }

    pub fn job_index(project: &ProjectName) -> Self {
        Self(format!("/{project}/execute_index"))
    }

    pub fn dataflow(project: &ProjectName, model_id: &str) -> Self {
        Self(format!("{}{model_id}", Self::dataflows_prefix(project)))
    }

    pub fn dataflows_prefix(project: &ProjectName) -> String {
        format!("/{project}/dataflow/")
    }

    pub fn table(project: &ProjectName, table: &str) -> Self {
        Self(format!("/{project}/table/{table}"))
    }

    pub fn offset(project: &ProjectName, offset_type: &str) -> Self {
        Self(format!("/{project}/offset/{offset_type}"))
    }

    pub fn layout_usage(project: &ProjectName, model_id: &str) -> Self {
        Self(format!("/{project}/layout_usage/{model_id}"))
    }
}

impl core::fmt::Display for MetaKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
