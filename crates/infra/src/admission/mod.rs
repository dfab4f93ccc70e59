//! Job admission: validate a build request against model metadata, create
//! the job graph, persist it atomically and submit it for execution.

mod dataflow;
mod error;
mod manager;
mod policy;
mod request;

pub use dataflow::{
    Dataflow, MultiPartitionDesc, PartitionValue, Segment, SegmentPartition, SegmentRange,
    SegmentStatus, TableDesc,
};
pub use error::AdmissionError;
pub use manager::{JobManager, DEFAULT_SUBMIT_JOB_MULTIPLIER, SAMPLING_ROWS};
pub use policy::{
    AdmissionPolicy, ComputeSubmitter, ExecutorJobId, RecordingSubmitter, StaticAdmissionPolicy,
    SubmitError,
};
pub use request::{BuildRequest, BuildTarget, JobParam};
