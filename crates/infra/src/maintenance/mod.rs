//! Periodic, master-gated maintenance tasks.
//!
//! Each task runs on its own thread per project with a fixed delay between
//! iterations. Offset-tracked tasks fold an ordered feed into metadata and
//! advance their cursor in the same transaction as the derived updates.

mod cron;
mod iteration;
mod layout_usage;
mod master;
mod runner;

pub use cron::CronJobSubmitter;
pub use iteration::{
    run_iteration, AbortReason, IterationLimits, IterationOutcome, OffsetTracked,
    OffsetTrackedTask, SkipReason,
};
pub use layout_usage::{
    InMemoryQueryHistory, LayoutHit, LayoutUsage, LayoutUsageRollup, QueryHistoryFeed,
    QueryHistoryRecord, LAYOUT_USAGE_OFFSET,
};
pub use master::{MasterElection, StaticMaster};
pub use runner::{MaintenanceHandle, MaintenanceRunner, MaintenanceTask, RunnerStats};
