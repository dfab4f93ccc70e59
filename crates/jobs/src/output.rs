//! Output records attached to jobs, tasks, and stage×segment pairs.
//!
//! [`ExecutableOutput::set_stage_output`] is the primitive stage transition
//! check: it is the only place that decides whether an executor callback is
//! applied or silently swallowed.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::ExecutableState;

/// Info key under which the executor reports how many indexes a running stage
/// has finished.
pub const INDEX_SUCCESS_COUNT: &str = "indexSuccessCount";

const SHORT_ERR_MSG_LEN: usize = 256;

/// Transition failure for job/task outputs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("illegal state transfer: {from} -> {to}")]
    IllegalStateTransfer {
        from: ExecutableState,
        to: ExecutableState,
    },
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("stage not found: {stage} (segment {segment})")]
    StageNotFound { stage: String, segment: String },
}

impl TransitionError {
    pub fn code(&self) -> &'static str {
        match self {
            TransitionError::IllegalStateTransfer { .. } => "ILLEGAL_STATE_TRANSFER",
            TransitionError::TaskNotFound(_) => "TASK_NOT_FOUND",
            TransitionError::StageNotFound { .. } => "STAGE_NOT_FOUND",
        }
    }
}

/// Status record: state, timestamps, free-form info, and failure details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutableOutput {
    pub status: ExecutableState,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub info: BTreeMap<String, String>,
    pub failed_msg: Option<String>,
    pub short_err_msg: Option<String>,
}

impl ExecutableOutput {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            status: ExecutableState::Ready,
            create_time: now,
            start_time: None,
            end_time: None,
            info: BTreeMap::new(),
            failed_msg: None,
            short_err_msg: None,
        }
    }

    pub fn status(&self) -> ExecutableState {
        self.status
    }

    /// Running index success count, if the executor reported a parsable one.
    pub fn index_success_count(&self) -> Option<u64> {
        self.info
            .get(INDEX_SUCCESS_COUNT)
            .and_then(|v| v.trim().parse::<u64>().ok())
    }

    /// Apply a stage×segment status update.
    ///
    /// Returns `true` when the record was mutated.
    ///
    /// - `PAUSED`, `SKIP`, `DISCARDED` swallow non-restart updates.
    /// - `SUCCEED` only accepts non-restart re-reports of `SUCCEED` or `SKIP`.
    /// - A restart clears timestamps, failure details, and accumulated info
    ///   before applying the new status.
    pub fn set_stage_output(
        &mut self,
        new_status: ExecutableState,
        info: Option<&BTreeMap<String, String>>,
        failed_msg: Option<&str>,
        is_restart: bool,
        now: DateTime<Utc>,
    ) -> bool {
        if !is_restart {
            if self.status.is_update_guarded() {
                return false;
            }
            if self.status == ExecutableState::Succeed && !new_status.is_success() {
                return false;
            }
        }

        if is_restart {
            self.start_time = None;
            self.end_time = None;
            self.info.clear();
            self.failed_msg = None;
            self.short_err_msg = None;
        }

        self.status = new_status;
        self.set_failure(failed_msg);
        if let Some(info) = info {
            self.merge_info(info);
        }
        self.stamp(now);
        true
    }

    /// Apply a job/task status update following the legal transition table.
    ///
    /// Same-state updates only merge info and return `Ok(false)`.
    pub fn transition(
        &mut self,
        new_status: ExecutableState,
        info: Option<&BTreeMap<String, String>>,
        failed_msg: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, TransitionError> {
        if self.status == new_status {
            if let Some(info) = info {
                self.merge_info(info);
            }
            self.set_failure(failed_msg);
            return Ok(false);
        }

        if !self.status.can_transition_to(new_status) {
            return Err(TransitionError::IllegalStateTransfer {
                from: self.status,
                to: new_status,
            });
        }

        if new_status == ExecutableState::Ready {
            // Re-queued work starts a fresh attempt.
            self.start_time = None;
            self.end_time = None;
            self.failed_msg = None;
            self.short_err_msg = None;
        }

        self.status = new_status;
        self.set_failure(failed_msg);
        if let Some(info) = info {
            self.merge_info(info);
        }
        self.stamp(now);
        Ok(true)
    }

    /// Force a status bypassing guards (cascading operators only).
    ///
    /// Returns `true` when the status changed.
    pub(crate) fn force(&mut self, new_status: ExecutableState, now: DateTime<Utc>) -> bool {
        if self.status == new_status {
            return false;
        }
        self.status = new_status;
        self.stamp(now);
        true
    }

    /// Reset to `READY` as a restart does.
    pub(crate) fn reset(&mut self) {
        self.status = ExecutableState::Ready;
        self.start_time = None;
        self.end_time = None;
        self.info.clear();
        self.failed_msg = None;
        self.short_err_msg = None;
    }

    fn merge_info(&mut self, info: &BTreeMap<String, String>) {
        for (k, v) in info {
            if k == INDEX_SUCCESS_COUNT {
                // The success count never moves backwards within an attempt.
                let incoming = v.trim().parse::<u64>().ok();
                match (self.index_success_count(), incoming) {
                    (Some(old), Some(new)) if new < old => continue,
                    _ => {}
                }
            }
            self.info.insert(k.clone(), v.clone());
        }
    }

    fn set_failure(&mut self, failed_msg: Option<&str>) {
        if let Some(msg) = failed_msg {
            self.failed_msg = Some(msg.to_string());
            self.short_err_msg = Some(short_error(msg));
        }
    }

    fn stamp(&mut self, now: DateTime<Utc>) {
        match self.status {
            ExecutableState::Running => {
                if self.start_time.is_none() {
                    self.start_time = Some(now);
                }
            }
            s if s.is_final() => {
                if self.start_time.is_none() {
                    self.start_time = Some(now);
                }
                self.end_time = Some(now);
            }
            _ => {}
        }
    }
}

/// First line of a failure message, bounded in length.
fn short_error(msg: &str) -> String {
    let first = msg.lines().next().unwrap_or_default().trim();
    if first.chars().count() <= SHORT_ERR_MSG_LEN {
        first.to_string()
    } else {
        first.chars().take(SHORT_ERR_MSG_LEN).collect()
    }
}
