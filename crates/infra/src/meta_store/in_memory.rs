use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use super::key::MetaKey;
use super::r#trait::{MetaStore, MetaStoreError, MetaWrite, VersionedValue};

/// Live record or tombstone of one key.
#[derive(Debug, Clone)]
struct Slot {
    value: Option<serde_json::Value>,
    version: u64,
}

impl Slot {
    fn live(&self) -> Option<VersionedValue> {
        self.value.as_ref().map(|value| VersionedValue {
            value: value.clone(),
            version: self.version,
        })
    }

    fn live_version(&self) -> u64 {
        if self.value.is_some() { self.version } else { 0 }
    }
}

/// In-memory metadata store.
///
/// Intended for tests/dev. Commits take a single write lock, which makes each
/// batch atomic with respect to concurrent readers and writers. Deleted keys
/// keep a tombstone so their versions never repeat.
#[derive(Debug, Default)]
pub struct InMemoryMetaStore {
    records: RwLock<BTreeMap<MetaKey, Slot>>,
}

impl InMemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .map(|r| r.values().filter(|s| s.value.is_some()).count())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetaStore for InMemoryMetaStore {
    fn read(&self, key: &MetaKey) -> Result<Option<VersionedValue>, MetaStoreError> {
        let records = self
            .records
            .read()
            .map_err(|_| MetaStoreError::Storage("lock poisoned".to_string()))?;
        Ok(records.get(key).and_then(Slot::live))
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(MetaKey, VersionedValue)>, MetaStoreError> {
        let records = self
            .records
            .read()
            .map_err(|_| MetaStoreError::Storage("lock poisoned".to_string()))?;
        Ok(records
            .range(MetaKey::from_raw(prefix)..)
            .take_while(|(k, _)| k.as_str().starts_with(prefix))
            .filter_map(|(k, slot)| slot.live().map(|v| (k.clone(), v)))
            .collect())
    }

    fn commit(&self, writes: Vec<MetaWrite>) -> Result<Vec<u64>, MetaStoreError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| MetaStoreError::Storage("lock poisoned".to_string()))?;

        // Validate the whole batch before touching anything.
        let mut seen = BTreeSet::new();
        for w in &writes {
            if !seen.insert(&w.key) {
                return Err(MetaStoreError::Storage(format!(
                    "key {} written twice in one batch",
                    w.key
                )));
            }
            let current = records.get(&w.key).map_or(0, Slot::live_version);
            if !w.expected.matches(current) {
                return Err(MetaStoreError::Conflict {
                    key: w.key.clone(),
                    expected: w.expected,
                    actual: current,
                });
            }
        }

        let mut versions = Vec::with_capacity(writes.len());
        for w in writes {
            match w.value {
                Some(value) => {
                    let slot = records.entry(w.key).or_insert(Slot {
                        value: None,
                        version: 0,
                    });
                    slot.version += 1;
                    slot.value = Some(value);
                    versions.push(slot.version);
                }
                None => {
                    if let Some(slot) = records.get_mut(&w.key) {
                        if slot.value.take().is_some() {
                            slot.version += 1;
                        }
                    }
                    versions.push(0);
                }
            }
        }
        Ok(versions)
    }
}
