//! Maintenance cursors.
//!
//! Each offset-tracked maintenance task persists the high-water mark of the
//! feed records it has folded into metadata. Advancing the cursor always
//! happens in the same transaction as the derived updates, so a record is
//! applied at most once even when two nodes briefly both believe they are
//! master.

use serde::{Deserialize, Serialize};

use segforge_core::{ProjectName, Versioned};

use crate::meta_store::{MetaKey, MetaStore};
use crate::transaction::{Transaction, TransactionError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OffsetPo {
    pub project: ProjectName,
    pub offset_type: String,
    pub offset: i64,
    #[serde(default)]
    pub mvcc: u64,
}

impl OffsetPo {
    pub fn new(project: ProjectName, offset_type: impl Into<String>, offset: i64) -> Self {
        Self {
            project,
            offset_type: offset_type.into(),
            offset,
            mvcc: 0,
        }
    }

    pub fn key(&self) -> MetaKey {
        MetaKey::offset(&self.project, &self.offset_type)
    }
}

impl Versioned for OffsetPo {
    fn mvcc(&self) -> u64 {
        self.mvcc
    }

    fn set_mvcc(&mut self, mvcc: u64) {
        self.mvcc = mvcc;
    }
}

#[derive(Debug, Clone)]
pub struct OffsetStore<S> {
    store: S,
}

impl<S: MetaStore> OffsetStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn get(
        &self,
        project: &ProjectName,
        offset_type: &str,
    ) -> Result<Option<OffsetPo>, TransactionError> {
        read_offset(&mut Transaction::new(&self.store), project, offset_type)
    }

    /// Current cursor value, 0 when the task never committed.
    pub fn current(&self, project: &ProjectName, offset_type: &str) -> Result<i64, TransactionError> {
        Ok(self.get(project, offset_type)?.map(|o| o.offset).unwrap_or(0))
    }
}

pub(crate) fn read_offset<S: MetaStore + ?Sized>(
    tx: &mut Transaction<'_, S>,
    project: &ProjectName,
    offset_type: &str,
) -> Result<Option<OffsetPo>, TransactionError> {
    Ok(tx
        .get::<OffsetPo>(&MetaKey::offset(project, offset_type))?
        .map(|stored| OffsetPo {
            mvcc: stored.version,
            ..stored.value
        }))
}

pub(crate) fn stage_offset<S: MetaStore + ?Sized>(
    tx: &mut Transaction<'_, S>,
    offset: &OffsetPo,
) -> Result<(), TransactionError> {
    tx.put_versioned(offset.key(), &mut offset.clone())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::meta_store::InMemoryMetaStore;

    #[test]
    fn offset_record_uses_camel_case() {
        let po = OffsetPo::new(ProjectName::new("retail").unwrap(), "layout_usage", 42);
        let json = serde_json::to_value(&po).unwrap();
        assert_eq!(json["offsetType"], "layout_usage");
        assert_eq!(json["offset"], 42);
    }

    #[test]
    fn staged_offset_carries_next_version() {
        let meta = Arc::new(InMemoryMetaStore::new());
        let project = ProjectName::new("retail").unwrap();
        let offsets = OffsetStore::new(meta.clone());
        assert_eq!(offsets.current(&project, "feed").unwrap(), 0);

        for expected in [1u64, 2] {
            let mut tx = Transaction::new(&*meta);
            stage_offset(&mut tx, &OffsetPo::new(project.clone(), "feed", expected as i64 * 10))
                .unwrap();
            tx.commit().unwrap();
            let po = offsets.get(&project, "feed").unwrap().unwrap();
            assert_eq!(po.mvcc, expected);
        }
        assert_eq!(offsets.current(&project, "feed").unwrap(), 20);
    }
}
