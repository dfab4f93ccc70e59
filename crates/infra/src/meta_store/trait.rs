use serde_json::Value as JsonValue;
use thiserror::Error;

use segforge_core::ExpectedVersion;

use super::key::MetaKey;

/// A record as stored: its JSON document and the version it was written at.
///
/// Versions start at 1 for the first write and increase by one on every
/// overwrite and delete, so a key never shows the same version twice. An
/// absent record has version 0.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedValue {
    pub value: JsonValue,
    pub version: u64,
}

/// One entry of an atomic commit batch.
///
/// `value: None` deletes the record.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaWrite {
    pub key: MetaKey,
    pub value: Option<JsonValue>,
    pub expected: ExpectedVersion,
}

impl MetaWrite {
    pub fn put(key: MetaKey, value: JsonValue, expected: ExpectedVersion) -> Self {
        Self {
            key,
            value: Some(value),
            expected,
        }
    }

    pub fn delete(key: MetaKey, expected: ExpectedVersion) -> Self {
        Self {
            key,
            value: None,
            expected,
        }
    }
}

/// Metadata store operation error.
#[derive(Debug, Error)]
pub enum MetaStoreError {
    #[error("version conflict on {key}: expected {expected:?}, found {actual}")]
    Conflict {
        key: MetaKey,
        expected: ExpectedVersion,
        actual: u64,
    },

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl MetaStoreError {
    pub fn code(&self) -> &'static str {
        match self {
            MetaStoreError::Conflict { .. } => "CONFLICT",
            MetaStoreError::Serialization(_) => "SERIALIZATION_FAILED",
            MetaStoreError::Storage(_) => "STORAGE_FAILURE",
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, MetaStoreError::Conflict { .. })
    }
}

impl From<serde_json::Error> for MetaStoreError {
    fn from(e: serde_json::Error) -> Self {
        MetaStoreError::Serialization(e.to_string())
    }
}

/// Versioned key/value store shared by every orchestrator node.
///
/// ## Commit semantics
///
/// `commit()` applies a batch of writes atomically: either every write's
/// `expected` version matches the current version of its key and all writes
/// are applied, or nothing is applied and the first mismatch is reported as
/// [`MetaStoreError::Conflict`]. `ExpectedVersion::Exact(0)` requires the key
/// to be absent; deleting an absent key with it is a no-op.
///
/// A deleted key keeps its version: re-creating it continues the sequence,
/// so a writer still holding a version of the old record conflicts.
///
/// Implementations must be safe to share across threads; callers never hold
/// in-process locks around store calls.
pub trait MetaStore: Send + Sync {
    fn read(&self, key: &MetaKey) -> Result<Option<VersionedValue>, MetaStoreError>;

    /// Every record whose key starts with `prefix`, ordered by key.
    fn scan(&self, prefix: &str) -> Result<Vec<(MetaKey, VersionedValue)>, MetaStoreError>;

    /// Atomically apply `writes`; returns the new version of each written key
    /// (0 for deletes), in batch order.
    fn commit(&self, writes: Vec<MetaWrite>) -> Result<Vec<u64>, MetaStoreError>;

    /// Single-record compare-and-set.
    fn write_if_version(
        &self,
        key: &MetaKey,
        value: JsonValue,
        expected: ExpectedVersion,
    ) -> Result<u64, MetaStoreError> {
        let versions = self.commit(vec![MetaWrite::put(key.clone(), value, expected)])?;
        Ok(versions.first().copied().unwrap_or_default())
    }
}

impl<S: MetaStore + ?Sized> MetaStore for &S {
    fn read(&self, key: &MetaKey) -> Result<Option<VersionedValue>, MetaStoreError> {
        (**self).read(key)
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(MetaKey, VersionedValue)>, MetaStoreError> {
        (**self).scan(prefix)
    }

    fn commit(&self, writes: Vec<MetaWrite>) -> Result<Vec<u64>, MetaStoreError> {
        (**self).commit(writes)
    }
}

impl<S: MetaStore + ?Sized> MetaStore for std::sync::Arc<S> {
    fn read(&self, key: &MetaKey) -> Result<Option<VersionedValue>, MetaStoreError> {
        (**self).read(key)
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(MetaKey, VersionedValue)>, MetaStoreError> {
        (**self).scan(prefix)
    }

    fn commit(&self, writes: Vec<MetaWrite>) -> Result<Vec<u64>, MetaStoreError> {
        (**self).commit(writes)
    }
}
