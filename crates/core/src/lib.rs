//! `segforge-core`: foundation building blocks for the orchestration core.
//!
//! This crate contains **pure** primitives (no storage or runtime concerns).

pub mod error;
pub mod id;
pub mod version;

pub use error::DomainError;
pub use id::{JobId, LayoutId, PartitionId, ProjectName, SegmentId, StageId, TaskId};
pub use version::{ExpectedVersion, Versioned};
