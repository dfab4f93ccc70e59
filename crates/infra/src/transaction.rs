//! Optimistic read-compute-write transactions over a [`MetaStore`].
//!
//! A [`Transaction`] remembers the version of every key it reads or writes.
//! `commit` turns the staged writes into one atomic batch where each write
//! expects exactly the version first observed, so any concurrent change to a
//! written key fails the whole batch with a conflict.
//!
//! [`run_in_transaction`] wraps the pattern: build a fresh transaction, run
//! the closure, commit, and on conflict back off and start over up to the
//! call site's [`RetryPolicy`].

use std::collections::BTreeMap;
use std::thread;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use segforge_core::{ExpectedVersion, Versioned};

use crate::meta_store::{MetaKey, MetaStore, MetaStoreError, MetaWrite, VersionedValue};
use crate::retry::RetryPolicy;

/// A decoded record with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Stored<T> {
    pub value: T,
    pub version: u64,
}

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("transaction '{name}' gave up after {attempts} attempt(s): {source}")]
    Conflict {
        name: String,
        attempts: u32,
        #[source]
        source: MetaStoreError,
    },

    #[error(transparent)]
    Store(#[from] MetaStoreError),

    #[error("record {key} could not be decoded: {reason}")]
    Corrupt { key: MetaKey, reason: String },
}

impl TransactionError {
    pub fn code(&self) -> &'static str {
        match self {
            TransactionError::Conflict { .. } => "CONFLICT",
            TransactionError::Store(e) => e.code(),
            TransactionError::Corrupt { .. } => "CORRUPT_RECORD",
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            TransactionError::Conflict { .. } => true,
            TransactionError::Store(e) => e.is_conflict(),
            TransactionError::Corrupt { .. } => false,
        }
    }
}

pub struct Transaction<'s, S: MetaStore + ?Sized> {
    store: &'s S,
    /// First version observed per key.
    observed: BTreeMap<MetaKey, u64>,
    staged: BTreeMap<MetaKey, Option<JsonValue>>,
}

impl<'s, S: MetaStore + ?Sized> Transaction<'s, S> {
    pub fn new(store: &'s S) -> Self {
        Self {
            store,
            observed: BTreeMap::new(),
            staged: BTreeMap::new(),
        }
    }

    /// Read a raw record. Staged writes of this transaction are visible.
    pub fn get_raw(&mut self, key: &MetaKey) -> Result<Option<VersionedValue>, TransactionError> {
        if let Some(staged) = self.staged.get(key) {
            let version = self.observed.get(key).copied().unwrap_or(0);
            return Ok(staged
                .clone()
                .map(|value| VersionedValue { value, version }));
        }

        let current = self.store.read(key)?;
        self.observed
            .entry(key.clone())
            .or_insert_with(|| current.as_ref().map(|v| v.version).unwrap_or(0));
        Ok(current)
    }

    pub fn get<T: DeserializeOwned>(
        &mut self,
        key: &MetaKey,
    ) -> Result<Option<Stored<T>>, TransactionError> {
        self.get_raw(key)?
            .map(|raw| decode(key, raw))
            .transpose()
    }

    /// Snapshot of every record under `prefix`.
    ///
    /// Scans are not tracked: a record changed concurrently after the scan
    /// only conflicts if this transaction also reads or writes its key.
    pub fn scan<T: DeserializeOwned>(
        &mut self,
        prefix: &str,
    ) -> Result<Vec<(MetaKey, Stored<T>)>, TransactionError> {
        self.store
            .scan(prefix)?
            .into_iter()
            .map(|(key, raw)| decode(&key, raw).map(|stored| (key, stored)))
            .collect()
    }

    pub fn put<T: Serialize>(&mut self, key: MetaKey, value: &T) -> Result<(), TransactionError> {
        let json = serde_json::to_value(value).map_err(|e| TransactionError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.observe(&key)?;
        self.staged.insert(key, Some(json));
        Ok(())
    }

    /// Stage `value` with its `mvcc` set to the version the commit will
    /// assign. For a key that was deleted before, the store continues past
    /// its tombstone; readers always take the stored version.
    pub fn put_versioned<T>(&mut self, key: MetaKey, value: &mut T) -> Result<(), TransactionError>
    where
        T: Serialize + Versioned,
    {
        self.observe(&key)?;
        value.set_mvcc(self.observed_version(&key).unwrap_or(0) + 1);
        debug_assert!(value.mvcc() > 0);
        self.put(key, value)
    }

    pub fn delete(&mut self, key: MetaKey) -> Result<(), TransactionError> {
        self.observe(&key)?;
        self.staged.insert(key, None);
        Ok(())
    }

    /// Version this transaction expects `key` to still have at commit.
    pub fn observed_version(&self, key: &MetaKey) -> Option<u64> {
        self.observed.get(key).copied()
    }

    pub fn has_writes(&self) -> bool {
        !self.staged.is_empty()
    }

    /// Commit staged writes atomically. Returns the new version per key.
    pub fn commit(self) -> Result<BTreeMap<MetaKey, u64>, MetaStoreError> {
        if self.staged.is_empty() {
            return Ok(BTreeMap::new());
        }

        let writes: Vec<MetaWrite> = self
            .staged
            .into_iter()
            .map(|(key, value)| {
                let expected =
                    ExpectedVersion::Exact(self.observed.get(&key).copied().unwrap_or(0));
                MetaWrite {
                    key,
                    value,
                    expected,
                }
            })
            .collect();
        let keys: Vec<MetaKey> = writes.iter().map(|w| w.key.clone()).collect();
        let versions = self.store.commit(writes)?;
        Ok(keys.into_iter().zip(versions).collect())
    }

    fn observe(&mut self, key: &MetaKey) -> Result<(), TransactionError> {
        if !self.observed.contains_key(key) {
            let version = self.store.read(key)?.map(|v| v.version).unwrap_or(0);
            self.observed.insert(key.clone(), version);
        }
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(
    key: &MetaKey,
    raw: VersionedValue,
) -> Result<Stored<T>, TransactionError> {
    let value = serde_json::from_value(raw.value).map_err(|e| TransactionError::Corrupt {
        key: key.clone(),
        reason: e.to_string(),
    })?;
    Ok(Stored {
        value,
        version: raw.version,
    })
}

/// Run `body` in a fresh transaction and commit it, retrying on conflicts.
///
/// The closure may run several times and must not have side effects outside
/// the transaction. Errors returned by the closure abort immediately.
pub fn run_in_transaction<S, T, E, F>(
    store: &S,
    policy: &RetryPolicy,
    name: &str,
    mut body: F,
) -> Result<T, E>
where
    S: MetaStore + ?Sized,
    E: From<TransactionError>,
    F: FnMut(&mut Transaction<'_, S>) -> Result<T, E>,
{
    // A fresh v7 uuid seeds the jitter of this call.
    let seed = Uuid::now_v7().as_u128() as u64;
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let mut tx = Transaction::new(store);
        let out = body(&mut tx)?;

        match tx.commit() {
            Ok(_) => return Ok(out),
            Err(e) if e.is_conflict() && policy.should_retry(attempt) => {
                let delay = policy.jittered_delay(attempt, seed);
                debug!(
                    transaction = name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "version conflict, retrying"
                );
                thread::sleep(delay);
            }
            Err(e) if e.is_conflict() => {
                return Err(TransactionError::Conflict {
                    name: name.to_string(),
                    attempts: attempt,
                    source: e,
                }
                .into());
            }
            Err(e) => return Err(TransactionError::Store(e).into()),
        }
    }
}
