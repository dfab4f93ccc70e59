//! Errors raised while constructing domain values.

use thiserror::Error;

/// Rejection of a malformed domain value.
///
/// Stateful failures (missing records, version conflicts) are reported by the
/// layers that own the state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier failed to parse.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            DomainError::Validation(_) => "VALIDATION_FAILED",
            DomainError::InvalidId(_) => "INVALID_ID",
        }
    }
}
