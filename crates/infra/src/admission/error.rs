use thiserror::Error;

use segforge_core::{DomainError, JobId, LayoutId, SegmentId};

use crate::executable::ExecutableStoreError;
use crate::transaction::TransactionError;

/// Why a build request was not admitted.
///
/// Every validation variant is raised before anything is persisted.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("model {0} not found")]
    ModelNotFound(String),

    #[error("table {0} not found")]
    TableNotFound(String),

    #[error("segments not found: {segments:?}")]
    SegmentNotFound { segments: Vec<SegmentId> },

    #[error("layouts not found: {layouts:?}")]
    LayoutNotFound { layouts: Vec<LayoutId> },

    #[error("invalid segment range [{start}, {end})")]
    InvalidSegmentRange { start: i64, end: i64 },

    #[error("segment range overlaps existing segments {segments:?}")]
    SegmentRangeOverlap { segments: Vec<String> },

    #[error("a running job {existing} already targets {subject}")]
    JobCreationCheckFailed { subject: String, existing: JobId },

    #[error("{requested} partitions exceed the admission limit of {limit}")]
    TooManyPartitions { requested: usize, limit: usize },

    #[error("partition values required for columns {columns:?}")]
    PartitionColumnMissing { columns: Vec<String> },

    #[error("partition value mismatch: {0}")]
    PartitionValueMismatch(String),

    #[error("duplicate partition values {values:?}")]
    DuplicatePartitionValues { values: Vec<Vec<String>> },

    #[error("partition values not built in segment: {values:?}")]
    PartitionNotFound { values: Vec<Vec<String>> },

    #[error("invalid merge: {0}")]
    InvalidMergeSegments(String),

    #[error(transparent)]
    InvalidRequest(#[from] DomainError),

    #[error("job {job_id} was admitted but submission failed: {reason}")]
    SubmissionFailed { job_id: JobId, reason: String },

    #[error(transparent)]
    Store(#[from] ExecutableStoreError),
}

impl AdmissionError {
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::ModelNotFound(_) => "MODEL_NOT_FOUND",
            AdmissionError::TableNotFound(_) => "TABLE_NOT_FOUND",
            AdmissionError::SegmentNotFound { .. } => "SEGMENT_NOT_FOUND",
            AdmissionError::LayoutNotFound { .. } => "LAYOUT_NOT_FOUND",
            AdmissionError::InvalidSegmentRange { .. } => "INVALID_SEGMENT_RANGE",
            AdmissionError::SegmentRangeOverlap { .. } => "SEGMENT_RANGE_OVERLAP",
            AdmissionError::JobCreationCheckFailed { .. } => "JOB_CREATION_CHECK_FAILED",
            AdmissionError::TooManyPartitions { .. } => "TOO_MANY_PARTITIONS",
            AdmissionError::PartitionColumnMissing { .. } => "PARTITION_COLUMN_MISSING",
            AdmissionError::PartitionValueMismatch(_) => "PARTITION_VALUE_MISMATCH",
            AdmissionError::DuplicatePartitionValues { .. } => "DUPLICATE_PARTITION_VALUES",
            AdmissionError::PartitionNotFound { .. } => "PARTITION_NOT_FOUND",
            AdmissionError::InvalidMergeSegments(_) => "INVALID_MERGE_SEGMENTS",
            AdmissionError::InvalidRequest(e) => e.code(),
            AdmissionError::SubmissionFailed { .. } => "SUBMISSION_FAILED",
            AdmissionError::Store(e) => e.code(),
        }
    }
}

impl From<TransactionError> for AdmissionError {
    fn from(e: TransactionError) -> Self {
        AdmissionError::Store(ExecutableStoreError::Transaction(e))
    }
}
