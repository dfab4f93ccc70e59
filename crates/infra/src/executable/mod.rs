//! Persistence of jobs (executables) and their per-project index.

mod po;
mod store;

pub use po::{ExecutablePo, JobIndex, JobIndexEntry};
pub use store::{ExecutableStore, ExecutableStoreError, OutputUpdate, StageUpdate, EXECUTOR_JOB_ID};

pub(crate) use store::{find_contender, index_job, save_job};
