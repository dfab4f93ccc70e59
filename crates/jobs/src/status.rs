//! Executable states and their external display mapping.

use serde::{Deserialize, Serialize};

/// Internal state of a job, task, or stage×segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutableState {
    Ready,
    Pending,
    Running,
    Succeed,
    Error,
    Paused,
    Discarded,
    Suicidal,
    Skip,
    Warning,
}

impl Default for ExecutableState {
    fn default() -> Self {
        Self::Ready
    }
}

impl ExecutableState {
    pub const ALL: [ExecutableState; 10] = [
        ExecutableState::Ready,
        ExecutableState::Pending,
        ExecutableState::Running,
        ExecutableState::Succeed,
        ExecutableState::Error,
        ExecutableState::Paused,
        ExecutableState::Discarded,
        ExecutableState::Suicidal,
        ExecutableState::Skip,
        ExecutableState::Warning,
    ];

    /// Terminal under normal (non-restart) updates.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            ExecutableState::Succeed
                | ExecutableState::Error
                | ExecutableState::Discarded
                | ExecutableState::Suicidal
                | ExecutableState::Skip
        )
    }

    /// A job in one of these states can never be resumed.
    pub fn is_not_progressing(self) -> bool {
        matches!(self, ExecutableState::Discarded | ExecutableState::Suicidal)
    }

    /// Counts as a successful completion for chaining and progress.
    pub fn is_success(self) -> bool {
        matches!(self, ExecutableState::Succeed | ExecutableState::Skip)
    }

    /// Stage×segment states that swallow stale executor callbacks.
    pub fn is_update_guarded(self) -> bool {
        matches!(
            self,
            ExecutableState::Paused | ExecutableState::Skip | ExecutableState::Discarded
        )
    }

    /// Legal job/task transitions. Same-state updates are handled by callers as
    /// idempotent no-ops and are not listed here.
    pub fn can_transition_to(self, to: ExecutableState) -> bool {
        use ExecutableState::*;
        match self {
            Ready => matches!(
                to,
                Pending | Running | Error | Discarded | Suicidal | Paused | Skip
            ),
            Pending => matches!(
                to,
                Ready | Running | Error | Discarded | Suicidal | Paused
            ),
            Running => matches!(
                to,
                Ready | Succeed | Error | Discarded | Suicidal | Paused | Warning
            ),
            Error => matches!(to, Ready | Discarded | Suicidal),
            Paused => matches!(to, Ready | Error | Discarded | Suicidal),
            Warning => matches!(to, Succeed | Error | Discarded),
            Succeed | Discarded | Suicidal | Skip => false,
        }
    }

    /// External display status.
    pub fn to_job_status(self) -> JobStatus {
        match self {
            ExecutableState::Ready | ExecutableState::Pending => JobStatus::Pending,
            ExecutableState::Running => JobStatus::Running,
            ExecutableState::Succeed => JobStatus::Finished,
            ExecutableState::Error => JobStatus::Error,
            ExecutableState::Paused => JobStatus::Stopped,
            ExecutableState::Suicidal | ExecutableState::Discarded => JobStatus::Discarded,
            ExecutableState::Skip => JobStatus::Skip,
            ExecutableState::Warning => JobStatus::Warning,
        }
    }
}

impl core::fmt::Display for ExecutableState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            ExecutableState::Ready => "READY",
            ExecutableState::Pending => "PENDING",
            ExecutableState::Running => "RUNNING",
            ExecutableState::Succeed => "SUCCEED",
            ExecutableState::Error => "ERROR",
            ExecutableState::Paused => "PAUSED",
            ExecutableState::Discarded => "DISCARDED",
            ExecutableState::Suicidal => "SUICIDAL",
            ExecutableState::Skip => "SKIP",
            ExecutableState::Warning => "WARNING",
        };
        f.write_str(s)
    }
}

/// Status shown to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Finished,
    Error,
    Stopped,
    Discarded,
    Skip,
    Warning,
}
