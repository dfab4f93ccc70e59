//! Model-side metadata that admission validates against and updates.
//!
//! These records are owned by the metadata model layer; admission only reads
//! them and, for builds that create segments or partitions, writes the new
//! entries in the same transaction as the job.

use std::collections::BTreeSet;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use segforge_core::{ExpectedVersion, LayoutId, PartitionId, ProjectName, SegmentId};

use crate::meta_store::{MetaKey, MetaStore, MetaStoreError};

/// Half-open time range `[start, end)` in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentRange {
    pub start: i64,
    pub end: i64,
}

impl SegmentRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    pub fn overlaps(&self, other: &SegmentRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// `yyyyMMddHHmmss_yyyyMMddHHmmss`, the conventional segment name.
    pub fn segment_name(&self) -> String {
        format!("{}_{}", compact(self.start), compact(self.end))
    }
}

fn compact(millis: i64) -> String {
    match Utc.timestamp_millis_opt(millis).single() {
        Some(ts) => ts.format("%Y%m%d%H%M%S").to_string(),
        None => millis.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentStatus {
    /// Created by an admitted job, not yet built.
    New,
    Ready,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentPartition {
    pub id: PartitionId,
    pub status: SegmentStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: SegmentId,
    pub name: String,
    pub range: SegmentRange,
    pub status: SegmentStatus,
    #[serde(default)]
    pub partitions: Vec<SegmentPartition>,
    pub create_time: DateTime<Utc>,
}

impl Segment {
    pub fn new(range: SegmentRange, status: SegmentStatus, now: DateTime<Utc>) -> Self {
        Self {
            id: SegmentId::new(),
            name: range.segment_name(),
            range,
            status,
            partitions: Vec::new(),
            create_time: now,
        }
    }

    pub fn has_partition(&self, id: PartitionId) -> bool {
        self.partitions.iter().any(|p| p.id == id)
    }
}

/// One known value tuple of a multi-partition model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionValue {
    pub id: PartitionId,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiPartitionDesc {
    pub columns: Vec<String>,
    #[serde(default)]
    pub partitions: Vec<PartitionValue>,
}

impl MultiPartitionDesc {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            partitions: Vec::new(),
        }
    }

    pub fn find(&self, values: &[String]) -> Option<PartitionId> {
        self.partitions
            .iter()
            .find(|p| p.values == values)
            .map(|p| p.id)
    }

    /// Id of `values`, registering the tuple when unseen.
    pub fn resolve_or_add(&mut self, values: &[String]) -> PartitionId {
        if let Some(id) = self.find(values) {
            return id;
        }
        let next = self.partitions.iter().map(|p| p.id.0).max().map_or(0, |m| m + 1);
        let id = PartitionId(next);
        self.partitions.push(PartitionValue {
            id,
            values: values.to_vec(),
        });
        id
    }
}

/// Build state of one model: its layouts, segments and partition values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataflow {
    pub project: ProjectName,
    pub model_id: String,
    pub layout_ids: BTreeSet<LayoutId>,
    #[serde(default)]
    pub segments: Vec<Segment>,
    #[serde(default)]
    pub multi_partition: Option<MultiPartitionDesc>,
}

impl Dataflow {
    pub fn new(project: ProjectName, model_id: impl Into<String>, layout_ids: BTreeSet<LayoutId>) -> Self {
        Self {
            project,
            model_id: model_id.into(),
            layout_ids,
            segments: Vec::new(),
            multi_partition: None,
        }
    }

    pub fn with_multi_partition(mut self, columns: Vec<String>) -> Self {
        self.multi_partition = Some(MultiPartitionDesc::new(columns));
        self
    }

    pub fn with_segment(mut self, segment: Segment) -> Self {
        self.segments.push(segment);
        self
    }

    pub fn key(&self) -> MetaKey {
        MetaKey::dataflow(&self.project, &self.model_id)
    }

    pub fn segment(&self, id: SegmentId) -> Option<&Segment> {
        self.segments.iter().find(|s| s.id == id)
    }

    pub fn segment_mut(&mut self, id: SegmentId) -> Option<&mut Segment> {
        self.segments.iter_mut().find(|s| s.id == id)
    }

    pub fn overlapping(&self, range: &SegmentRange) -> Vec<&Segment> {
        self.segments
            .iter()
            .filter(|s| s.range.overlaps(range))
            .collect()
    }

    /// Publish this record unconditionally (metadata-layer writes, fixtures).
    pub fn register<S: MetaStore + ?Sized>(&self, store: &S) -> Result<u64, MetaStoreError> {
        store.write_if_version(&self.key(), serde_json::to_value(self)?, ExpectedVersion::Any)
    }
}

/// A registered source table (`db.table`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDesc {
    pub project: ProjectName,
    pub name: String,
    #[serde(default)]
    pub properties: JsonValue,
}

impl TableDesc {
    pub fn new(project: ProjectName, name: impl Into<String>) -> Self {
        Self {
            project,
            name: name.into(),
            properties: JsonValue::Null,
        }
    }

    pub fn key(&self) -> MetaKey {
        MetaKey::table(&self.project, &self.name)
    }

    pub fn register<S: MetaStore + ?Sized>(&self, store: &S) -> Result<u64, MetaStoreError> {
        store.write_if_version(&self.key(), serde_json::to_value(self)?, ExpectedVersion::Any)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_are_half_open() {
        let a = SegmentRange::new(0, 10);
        assert!(!a.overlaps(&SegmentRange::new(10, 20)));
        assert!(a.overlaps(&SegmentRange::new(9, 20)));
        assert!(a.overlaps(&SegmentRange::new(2, 3)));
        assert!(!SegmentRange::new(5, 5).is_valid());
    }

    #[test]
    fn segment_name_is_compact_utc() {
        // 2024-01-01T00:00:00Z .. 2024-01-02T00:00:00Z
        let range = SegmentRange::new(1_704_067_200_000, 1_704_153_600_000);
        assert_eq!(range.segment_name(), "20240101000000_20240102000000");
    }

    #[test]
    fn partition_ids_are_stable() {
        let mut desc = MultiPartitionDesc::new(vec!["region".into()]);
        let us = desc.resolve_or_add(&["us".to_string()]);
        let eu = desc.resolve_or_add(&["eu".to_string()]);
        assert_ne!(us, eu);
        assert_eq!(desc.resolve_or_add(&["us".to_string()]), us);
        assert_eq!(desc.find(&["eu".to_string()]), Some(eu));
    }
}
