//! Layout usage roll-up: folds the query history feed into per-model,
//! per-day layout hit counts.

use std::collections::BTreeMap;
use std::sync::RwLock;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use segforge_core::{LayoutId, ProjectName};

use super::iteration::OffsetTrackedTask;
use crate::meta_store::{MetaKey, MetaStore};
use crate::transaction::{Transaction, TransactionError};

/// Cursor name of the roll-up.
pub const LAYOUT_USAGE_OFFSET: &str = "layout_usage";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutHit {
    pub model_id: String,
    pub layout_id: LayoutId,
}

/// One answered query. `id` is the feed's monotonically increasing offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryHistoryRecord {
    pub id: i64,
    pub project: ProjectName,
    pub query_time: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default)]
    pub hits: Vec<LayoutHit>,
}

/// Ordered source of answered queries.
pub trait QueryHistoryFeed: Send + Sync {
    /// Up to `limit` records of `project` with `id > offset`, ascending.
    fn fetch_after(
        &self,
        project: &ProjectName,
        offset: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<QueryHistoryRecord>>;
}

/// In-memory feed for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryQueryHistory {
    records: RwLock<Vec<QueryHistoryRecord>>,
}

impl InMemoryQueryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: QueryHistoryRecord) {
        let mut records = match self.records.write() {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        records.push(record);
        records.sort_by_key(|r| r.id);
    }
}

impl QueryHistoryFeed for InMemoryQueryHistory {
    fn fetch_after(
        &self,
        project: &ProjectName,
        offset: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<QueryHistoryRecord>> {
        let records = self
            .records
            .read()
            .map_err(|_| anyhow!("query history lock poisoned"))?;
        Ok(records
            .iter()
            .filter(|r| &r.project == project && r.id > offset)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Hit counts of one model's layouts, keyed by UTC day (`YYYY-MM-DD`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutUsage {
    pub project: ProjectName,
    pub model_id: String,
    #[serde(default)]
    pub daily_hits: BTreeMap<String, BTreeMap<LayoutId, u64>>,
}

impl LayoutUsage {
    pub fn new(project: ProjectName, model_id: impl Into<String>) -> Self {
        Self {
            project,
            model_id: model_id.into(),
            daily_hits: BTreeMap::new(),
        }
    }

    pub fn total_hits(&self, layout_id: LayoutId) -> u64 {
        self.daily_hits
            .values()
            .filter_map(|day| day.get(&layout_id))
            .sum()
    }

    fn merge(&mut self, delta: &BTreeMap<String, BTreeMap<LayoutId, u64>>) {
        for (day, layouts) in delta {
            let entry = self.daily_hits.entry(day.clone()).or_default();
            for (layout_id, hits) in layouts {
                *entry.entry(*layout_id).or_default() += hits;
            }
        }
    }
}

/// Per model: day → layout → hits.
pub type LayoutUsageDelta = BTreeMap<String, BTreeMap<String, BTreeMap<LayoutId, u64>>>;

pub struct LayoutUsageRollup<F> {
    feed: F,
}

impl<F: QueryHistoryFeed> LayoutUsageRollup<F> {
    pub fn new(feed: F) -> Self {
        Self { feed }
    }

    /// Read the rolled-up usage of a model.
    pub fn usage<S: MetaStore + ?Sized>(
        store: &S,
        project: &ProjectName,
        model_id: &str,
    ) -> Result<Option<LayoutUsage>, TransactionError> {
        Ok(Transaction::new(store)
            .get::<LayoutUsage>(&MetaKey::layout_usage(project, model_id))?
            .map(|s| s.value))
    }
}

impl<F> OffsetTrackedTask for LayoutUsageRollup<F>
where
    F: QueryHistoryFeed + 'static,
{
    type Record = QueryHistoryRecord;
    type Update = LayoutUsageDelta;

    fn name(&self) -> &str {
        "layout_usage_rollup"
    }

    fn offset_type(&self) -> &str {
        LAYOUT_USAGE_OFFSET
    }

    fn fetch(&self, project: &ProjectName, after: i64, limit: usize) -> anyhow::Result<Vec<QueryHistoryRecord>> {
        self.feed.fetch_after(project, after, limit)
    }

    fn offset_of(&self, record: &QueryHistoryRecord) -> i64 {
        record.id
    }

    fn process(&self, _project: &ProjectName, batch: &[QueryHistoryRecord]) -> anyhow::Result<LayoutUsageDelta> {
        let mut delta = LayoutUsageDelta::new();
        for record in batch {
            let day = record.query_time.format("%Y-%m-%d").to_string();
            for hit in &record.hits {
                *delta
                    .entry(hit.model_id.clone())
                    .or_default()
                    .entry(day.clone())
                    .or_default()
                    .entry(hit.layout_id)
                    .or_default() += 1;
            }
        }
        Ok(delta)
    }

    fn apply<S: MetaStore + ?Sized>(
        &self,
        tx: &mut Transaction<'_, S>,
        project: &ProjectName,
        update: &LayoutUsageDelta,
    ) -> Result<(), TransactionError> {
        for (model_id, days) in update {
            let key = MetaKey::layout_usage(project, model_id);
            let mut usage = tx
                .get::<LayoutUsage>(&key)?
                .map(|s| s.value)
                .unwrap_or_else(|| LayoutUsage::new(project.clone(), model_id.clone()));
            usage.merge(days);
            tx.put(key, &usage)?;
        }
        Ok(())
    }
}

impl<F: QueryHistoryFeed + ?Sized> QueryHistoryFeed for std::sync::Arc<F> {
    fn fetch_after(
        &self,
        project: &ProjectName,
        offset: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<QueryHistoryRecord>> {
        (**self).fetch_after(project, offset, limit)
    }
}
