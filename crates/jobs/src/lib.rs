//! `segforge-jobs`: the job model, its state machine and progress ratios.
//!
//! This crate is pure: it never performs IO. The infra layer loads a job,
//! mutates it through the operations defined here, and writes it back inside
//! an optimistic transaction.

pub mod model;
pub mod output;
pub mod progress;
pub mod state_machine;
pub mod status;

pub use model::{
    HasStages, HasStatus, HasSubTasks, Job, JobType, Priority, Stage, StageKind, Task, TaskKind,
    TaskParams,
};
pub use output::{ExecutableOutput, TransitionError, INDEX_SUCCESS_COUNT};
pub use progress::{
    segment_score, stage_contribution, task_progress, task_ratio, wait_times, StepRatioCalculator,
    TaskWaitTime, WaitTimes, DEFAULT_UNFINISHED_RATIO_CAP, MAX_UNFINISHED_RATIO_CAP,
};
pub use state_machine::StageScope;
pub use status::{ExecutableState, JobStatus};
