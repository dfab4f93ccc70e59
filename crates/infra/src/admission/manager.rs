use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use segforge_core::{DomainError, JobId, LayoutId, PartitionId, ProjectName, SegmentId};
use segforge_jobs::{Job, JobType, TaskParams};

use super::dataflow::{Dataflow, MultiPartitionDesc, Segment, SegmentPartition, SegmentRange, SegmentStatus};
use super::error::AdmissionError;
use super::policy::{AdmissionPolicy, ComputeSubmitter};
use super::request::{BuildRequest, BuildTarget, JobParam};
use crate::executable::{find_contender, index_job, save_job, ExecutableStore, OutputUpdate};
use crate::meta_store::{MetaKey, MetaStore};
use crate::transaction::{run_in_transaction, Transaction};

/// Partition builds may request at most `running_job_limit × this` values.
pub const DEFAULT_SUBMIT_JOB_MULTIPLIER: usize = 5;

/// Job param key holding the requested sampling row count.
pub const SAMPLING_ROWS: &str = "samplingRows";

/// Validates build requests, creates jobs and hands them to the compute
/// engine.
///
/// Validation, the job write, the dataflow change and the project job index
/// update happen in one optimistic transaction: a rejected request leaves
/// no trace, and two racing requests for the same target serialize on the
/// project job index so only one passes the duplicate guard.
pub struct JobManager<S> {
    jobs: ExecutableStore<S>,
    policy: Arc<dyn AdmissionPolicy>,
    submitter: Arc<dyn ComputeSubmitter>,
    submit_job_multiplier: usize,
}

impl<S: MetaStore> JobManager<S> {
    pub fn new(
        jobs: ExecutableStore<S>,
        policy: Arc<dyn AdmissionPolicy>,
        submitter: Arc<dyn ComputeSubmitter>,
    ) -> Self {
        Self {
            jobs,
            policy,
            submitter,
            submit_job_multiplier: DEFAULT_SUBMIT_JOB_MULTIPLIER,
        }
    }

    pub fn with_submit_job_multiplier(mut self, multiplier: usize) -> Self {
        self.submit_job_multiplier = multiplier;
        self
    }

    pub fn executables(&self) -> &ExecutableStore<S> {
        &self.jobs
    }

    pub fn submit_build(&self, request: &BuildRequest) -> Result<JobId, AdmissionError> {
        let partition_limit = self
            .policy
            .running_job_limit(&request.project)
            .saturating_mul(self.submit_job_multiplier);

        let job = run_in_transaction(
            self.jobs.meta_store(),
            self.jobs.retry_policy(),
            "submit_build",
            |tx| {
                let mut job = plan_job(tx, request, partition_limit, Utc::now())?;
                save_job(tx, &mut job)?;
                index_job(tx, &job)?;
                Ok::<_, AdmissionError>(job)
            },
        )
        .inspect_err(|e| {
            debug!(
                project = %request.project,
                subject = request.target.subject(),
                code = e.code(),
                error = %e,
                "build request rejected"
            )
        })?;

        info!(
            project = %job.project,
            job_id = %job.id,
            job_type = %job.job_type,
            subject = %job.target_subject,
            segments = job.target_segments.len(),
            "job admitted"
        );

        self.dispatch(&job, request)?;
        Ok(job.id)
    }

    /// Hand an admitted job to the compute engine.
    ///
    /// Runs after the admission commit so a retried transaction can never
    /// submit twice.
    fn dispatch(&self, job: &Job, request: &BuildRequest) -> Result<(), AdmissionError> {
        let param = JobParam::for_job(job, request);
        match self.submitter.submit(&param) {
            Ok(executor_job_id) => {
                self.jobs
                    .record_executor_job_id(&job.project, job.id, &executor_job_id.0)?;
                debug!(job_id = %job.id, executor_job_id = %executor_job_id, "job submitted");
                Ok(())
            }
            Err(e) => {
                warn!(
                    project = %job.project,
                    job_id = %job.id,
                    code = e.code(),
                    error = %e,
                    "job submission failed"
                );
                self.jobs
                    .update_job_output(&job.project, job.id, &OutputUpdate::failed(e.to_string()))?;
                Err(AdmissionError::SubmissionFailed {
                    job_id: job.id,
                    reason: e.to_string(),
                })
            }
        }
    }
}

/// Validate `request` against current metadata and build its job graph,
/// staging any dataflow change in `tx`.
fn plan_job<S: MetaStore + ?Sized>(
    tx: &mut Transaction<'_, S>,
    request: &BuildRequest,
    partition_limit: usize,
    now: DateTime<Utc>,
) -> Result<Job, AdmissionError> {
    let project = &request.project;
    let job_type = request.target.job_type();
    let subject = request.target.subject();

    let mut extra_targets: Vec<SegmentId> = Vec::new();
    let params = match &request.target {
        BuildTarget::IncrementalSegment {
            model_id,
            range,
            layout_ids,
            partition_values,
        } => {
            if !range.is_valid() {
                return Err(AdmissionError::InvalidSegmentRange {
                    start: range.start,
                    end: range.end,
                });
            }
            let mut df = load_dataflow(tx, project, model_id)?;
            let overlapping: Vec<String> =
                df.overlapping(range).iter().map(|s| s.name.clone()).collect();
            if !overlapping.is_empty() {
                return Err(AdmissionError::SegmentRangeOverlap {
                    segments: overlapping,
                });
            }
            let layouts = resolve_layouts(&df, layout_ids)?;
            validate_partition_values(df.multi_partition.as_ref(), partition_values, partition_limit)?;

            let partition_ids: BTreeSet<PartitionId> = match df.multi_partition.as_mut() {
                Some(desc) => partition_values
                    .iter()
                    .map(|v| desc.resolve_or_add(v))
                    .collect(),
                None => BTreeSet::new(),
            };
            let mut segment = Segment::new(*range, SegmentStatus::New, now);
            segment.partitions = partition_ids
                .iter()
                .map(|id| SegmentPartition {
                    id: *id,
                    status: SegmentStatus::New,
                })
                .collect();
            let segment_id = segment.id;
            df.segments.push(segment);
            tx.put(df.key(), &df)?;

            TaskParams {
                segment_ids: vec![segment_id],
                index_count: layouts.len() as u64,
                layout_ids: layouts,
                partition_ids,
                partial_build: request.partial_build,
            }
        }

        BuildTarget::Indexes {
            model_id,
            segment_ids,
            layout_ids,
        } => {
            let df = load_dataflow(tx, project, model_id)?;
            let segment_ids = require_segments(&df, segment_ids)?;
            if layout_ids.is_empty() {
                return Err(DomainError::validation("no layouts requested").into());
            }
            let layouts = resolve_layouts(&df, layout_ids)?;
            segment_params(segment_ids, layouts, request.partial_build)
        }

        BuildTarget::Refresh {
            model_id,
            segment_ids,
        } => {
            let df = load_dataflow(tx, project, model_id)?;
            let segment_ids = require_segments(&df, segment_ids)?;
            segment_params(segment_ids, df.layout_ids.clone(), request.partial_build)
        }

        BuildTarget::Merge {
            model_id,
            segment_ids,
        } => {
            let mut df = load_dataflow(tx, project, model_id)?;
            let sources = require_segments(&df, segment_ids)?;
            let range = merge_range(&df, &sources)?;
            let merged = Segment::new(range, SegmentStatus::New, now);
            let merged_id = merged.id;
            df.segments.push(merged);
            tx.put(df.key(), &df)?;

            extra_targets = sources;
            segment_params(vec![merged_id], df.layout_ids.clone(), request.partial_build)
        }

        BuildTarget::Partitions {
            model_id,
            segment_id,
            partition_values,
            refresh,
        } => {
            let mut df = load_dataflow(tx, project, model_id)?;
            let Some(desc) = df.multi_partition.as_ref() else {
                return Err(AdmissionError::PartitionValueMismatch(format!(
                    "model {model_id} is not multi-partitioned"
                )));
            };
            validate_partition_values(Some(desc), partition_values, partition_limit)?;
            let segment = df
                .segment(*segment_id)
                .ok_or_else(|| AdmissionError::SegmentNotFound {
                    segments: vec![*segment_id],
                })?;

            let built = |values: &Vec<String>| {
                desc.find(values)
                    .is_some_and(|id| segment.has_partition(id))
            };

            let partition_ids: BTreeSet<PartitionId> = if *refresh {
                let missing: Vec<Vec<String>> =
                    partition_values.iter().filter(|v| !built(v)).cloned().collect();
                if !missing.is_empty() {
                    return Err(AdmissionError::PartitionNotFound { values: missing });
                }
                partition_values.iter().filter_map(|v| desc.find(v)).collect()
            } else {
                let duplicates: Vec<Vec<String>> =
                    partition_values.iter().filter(|v| built(v)).cloned().collect();
                if !duplicates.is_empty() {
                    return Err(AdmissionError::DuplicatePartitionValues { values: duplicates });
                }
                let ids = register_partitions(&mut df, *segment_id, partition_values);
                tx.put(df.key(), &df)?;
                ids
            };

            TaskParams {
                segment_ids: vec![*segment_id],
                index_count: df.layout_ids.len() as u64,
                layout_ids: df.layout_ids.clone(),
                partition_ids,
                partial_build: request.partial_build,
            }
        }

        BuildTarget::Snapshot { table, .. } | BuildTarget::Sampling { table, .. } => {
            require_table(tx, project, table)?;
            TaskParams::default()
        }

        BuildTarget::LayoutCleanup { model_id } => {
            load_dataflow(tx, project, model_id)?;
            TaskParams::default()
        }
    };

    let mut target_segments = params.segment_ids.clone();
    target_segments.extend(extra_targets);
    check_duplicates(tx, project, job_type, subject, &target_segments, &params.partition_ids)?;

    let mut job = Job::plan(
        project.clone(),
        job_type,
        subject,
        request.submitter.clone(),
        params,
        now,
    )
    .with_priority(request.priority)
    .with_tag(request.tag.clone());
    job.target_segments = target_segments;

    if let BuildTarget::Sampling { rows, .. } = &request.target {
        job = job.with_param(SAMPLING_ROWS, rows.to_string());
    }
    if let Some(queue) = &request.yarn_queue {
        job = job.with_param("yarnQueue", queue.clone());
    }
    Ok(job)
}

fn segment_params(
    segment_ids: Vec<SegmentId>,
    layout_ids: BTreeSet<LayoutId>,
    partial_build: bool,
) -> TaskParams {
    TaskParams {
        segment_ids,
        index_count: layout_ids.len() as u64,
        layout_ids,
        partition_ids: BTreeSet::new(),
        partial_build,
    }
}

fn load_dataflow<S: MetaStore + ?Sized>(
    tx: &mut Transaction<'_, S>,
    project: &ProjectName,
    model_id: &str,
) -> Result<Dataflow, AdmissionError> {
    tx.get::<Dataflow>(&MetaKey::dataflow(project, model_id))?
        .map(|stored| stored.value)
        .ok_or_else(|| AdmissionError::ModelNotFound(model_id.to_string()))
}

fn require_table<S: MetaStore + ?Sized>(
    tx: &mut Transaction<'_, S>,
    project: &ProjectName,
    table: &str,
) -> Result<(), AdmissionError> {
    match tx.get_raw(&MetaKey::table(project, table))? {
        Some(_) => Ok(()),
        None => Err(AdmissionError::TableNotFound(table.to_string())),
    }
}

/// Deduplicated ids, all of which must exist in the dataflow.
fn require_segments(df: &Dataflow, requested: &[SegmentId]) -> Result<Vec<SegmentId>, AdmissionError> {
    if requested.is_empty() {
        return Err(DomainError::validation("no segments requested").into());
    }
    let mut seen = BTreeSet::new();
    let ids: Vec<SegmentId> = requested.iter().copied().filter(|id| seen.insert(*id)).collect();
    let missing: Vec<SegmentId> = ids.iter().copied().filter(|id| df.segment(*id).is_none()).collect();
    if !missing.is_empty() {
        return Err(AdmissionError::SegmentNotFound { segments: missing });
    }
    Ok(ids)
}

fn resolve_layouts(
    df: &Dataflow,
    requested: &BTreeSet<LayoutId>,
) -> Result<BTreeSet<LayoutId>, AdmissionError> {
    if requested.is_empty() {
        return Ok(df.layout_ids.clone());
    }
    let missing: Vec<LayoutId> = requested.difference(&df.layout_ids).copied().collect();
    if !missing.is_empty() {
        return Err(AdmissionError::LayoutNotFound { layouts: missing });
    }
    Ok(requested.clone())
}

/// Merged range of `sources`: at least two ready segments whose ranges
/// chain end-to-start.
fn merge_range(df: &Dataflow, sources: &[SegmentId]) -> Result<SegmentRange, AdmissionError> {
    if sources.len() < 2 {
        return Err(AdmissionError::InvalidMergeSegments(
            "at least two segments are required".to_string(),
        ));
    }
    let mut segments: Vec<&Segment> = sources.iter().filter_map(|id| df.segment(*id)).collect();
    if let Some(not_ready) = segments.iter().find(|s| s.status != SegmentStatus::Ready) {
        return Err(AdmissionError::InvalidMergeSegments(format!(
            "segment {} is not ready",
            not_ready.name
        )));
    }
    segments.sort_by_key(|s| s.range.start);
    for pair in segments.windows(2) {
        if pair[0].range.end != pair[1].range.start {
            return Err(AdmissionError::InvalidMergeSegments(format!(
                "segments {} and {} are not contiguous",
                pair[0].name, pair[1].name
            )));
        }
    }
    match (segments.first(), segments.last()) {
        (Some(first), Some(last)) => Ok(SegmentRange::new(first.range.start, last.range.end)),
        _ => Err(AdmissionError::InvalidMergeSegments("no segments".to_string())),
    }
}

fn validate_partition_values(
    desc: Option<&MultiPartitionDesc>,
    values: &[Vec<String>],
    limit: usize,
) -> Result<(), AdmissionError> {
    let Some(desc) = desc else {
        if values.is_empty() {
            return Ok(());
        }
        return Err(AdmissionError::PartitionValueMismatch(
            "partition values given for a model without multi-partition columns".to_string(),
        ));
    };

    if values.is_empty() {
        return Err(AdmissionError::PartitionColumnMissing {
            columns: desc.columns.clone(),
        });
    }
    if values.len() > limit {
        return Err(AdmissionError::TooManyPartitions {
            requested: values.len(),
            limit,
        });
    }
    if let Some(bad) = values.iter().find(|v| v.len() != desc.columns.len()) {
        return Err(AdmissionError::PartitionValueMismatch(format!(
            "expected {} value(s) per partition for {:?}, got {:?}",
            desc.columns.len(),
            desc.columns,
            bad
        )));
    }

    let mut seen = BTreeSet::new();
    let repeated: Vec<Vec<String>> = values
        .iter()
        .filter(|v| !seen.insert(v.as_slice()))
        .cloned()
        .collect();
    if !repeated.is_empty() {
        return Err(AdmissionError::DuplicatePartitionValues { values: repeated });
    }
    Ok(())
}

/// Register new partition tuples on the model and attach them to the
/// segment as `NEW`.
fn register_partitions(
    df: &mut Dataflow,
    segment_id: SegmentId,
    values: &[Vec<String>],
) -> BTreeSet<PartitionId> {
    let ids: BTreeSet<PartitionId> = match df.multi_partition.as_mut() {
        Some(desc) => values.iter().map(|v| desc.resolve_or_add(v)).collect(),
        None => BTreeSet::new(),
    };
    if let Some(segment) = df.segment_mut(segment_id) {
        for id in &ids {
            if !segment.has_partition(*id) {
                segment.partitions.push(SegmentPartition {
                    id: *id,
                    status: SegmentStatus::New,
                });
            }
        }
    }
    ids
}

/// Reject the request when a non-final job already works on the same target.
fn check_duplicates<S: MetaStore + ?Sized>(
    tx: &mut Transaction<'_, S>,
    project: &ProjectName,
    job_type: JobType,
    subject: &str,
    segments: &[SegmentId],
    partitions: &BTreeSet<PartitionId>,
) -> Result<(), AdmissionError> {
    match find_contender(tx, project, job_type, subject, segments, partitions, None)? {
        Some(existing) => Err(AdmissionError::JobCreationCheckFailed {
            subject: subject.to_string(),
            existing,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::admission::{RecordingSubmitter, StaticAdmissionPolicy};
    use crate::meta_store::{InMemoryMetaStore, VersionedValue};
    use crate::retry::RetryPolicy;

    const MODEL: &str = "orders_by_region";

    type Store = Arc<InMemoryMetaStore>;

    fn project() -> ProjectName {
        ProjectName::new("retail").unwrap()
    }

    fn region(v: &str) -> Vec<String> {
        vec![v.to_string()]
    }

    fn regions(values: &[&str]) -> Vec<Vec<String>> {
        values.iter().map(|v| region(v)).collect()
    }

    struct Fixture {
        store: Store,
        submitter: Arc<RecordingSubmitter>,
        manager: JobManager<Store>,
        /// `[0, 10)`, ready, partition `us` built.
        first: SegmentId,
        /// `[10, 20)`, ready, no partitions.
        second: SegmentId,
    }

    /// Multi-partition model on `region` with a running job limit of 1, so
    /// partition requests are capped at `DEFAULT_SUBMIT_JOB_MULTIPLIER`.
    fn fixture() -> Fixture {
        let store: Store = Arc::new(InMemoryMetaStore::new());
        let now = Utc::now();
        let mut df = Dataflow::new(project(), MODEL, BTreeSet::from([LayoutId(1), LayoutId(2)]))
            .with_multi_partition(vec!["region".to_string()]);
        let us = df
            .multi_partition
            .as_mut()
            .unwrap()
            .resolve_or_add(&region("us"));
        let mut first = Segment::new(SegmentRange::new(0, 10), SegmentStatus::Ready, now);
        first.partitions.push(SegmentPartition {
            id: us,
            status: SegmentStatus::Ready,
        });
        let second = Segment::new(SegmentRange::new(10, 20), SegmentStatus::Ready, now);
        let (first_id, second_id) = (first.id, second.id);
        df.with_segment(first).with_segment(second).register(&*store).unwrap();

        let submitter = Arc::new(RecordingSubmitter::new());
        let manager = JobManager::new(
            ExecutableStore::new(store.clone(), RetryPolicy::fixed(5, Duration::from_millis(1))),
            Arc::new(StaticAdmissionPolicy::new(1)),
            submitter.clone(),
        );
        Fixture {
            store,
            submitter,
            manager,
            first: first_id,
            second: second_id,
        }
    }

    impl Fixture {
        fn submit(&self, target: BuildTarget) -> Result<JobId, AdmissionError> {
            self.manager
                .submit_build(&BuildRequest::new(project(), "analyst", target))
        }

        fn dump(&self) -> Vec<(String, VersionedValue)> {
            self.store
                .scan("/")
                .unwrap()
                .into_iter()
                .map(|(k, v)| (k.as_str().to_string(), v))
                .collect()
        }

        fn dataflow(&self) -> Dataflow {
            let raw = self
                .store
                .read(&MetaKey::dataflow(&project(), MODEL))
                .unwrap()
                .unwrap();
            serde_json::from_value(raw.value).unwrap()
        }

        fn job(&self, id: JobId) -> Job {
            self.manager.executables().get_job(&project(), id).unwrap()
        }

        /// Assert `target` is rejected with `code` and nothing was written.
        fn assert_rejected(&self, target: BuildTarget, code: &str) {
            let before = self.dump();
            let submitted = self.submitter.submitted().len();
            let err = self.submit(target).unwrap_err();
            assert_eq!(err.code(), code, "error: {err}");
            assert_eq!(self.dump(), before);
            assert_eq!(self.submitter.submitted().len(), submitted);
        }
    }

    fn partitions(segment_id: SegmentId, values: &[&str], refresh: bool) -> BuildTarget {
        BuildTarget::Partitions {
            model_id: MODEL.to_string(),
            segment_id,
            partition_values: regions(values),
            refresh,
        }
    }

    #[test]
    fn partition_build_is_capped_by_running_job_limit() {
        let f = fixture();
        let six = ["eu", "apac", "latam", "mena", "anz", "nordics"];

        let before = f.dump();
        let err = f.submit(partitions(f.second, &six, false)).unwrap_err();
        assert!(matches!(
            err,
            AdmissionError::TooManyPartitions {
                requested: 6,
                limit: DEFAULT_SUBMIT_JOB_MULTIPLIER
            }
        ));
        assert_eq!(f.dump(), before);
        assert!(f.submitter.submitted().is_empty());

        let job_id = f.submit(partitions(f.second, &six[..5], false)).unwrap();
        let job = f.job(job_id);
        assert_eq!(job.job_type, JobType::SubPartitionBuild);
        assert_eq!(job.target_segments, vec![f.second]);
        assert_eq!(job.target_partitions.len(), 5);

        let df = f.dataflow();
        let segment = df.segment(f.second).unwrap();
        assert_eq!(segment.partitions.len(), 5);
        assert!(segment.partitions.iter().all(|p| p.status == SegmentStatus::New));
        assert_eq!(f.submitter.submitted()[0].target_partitions, job.target_partitions);
    }

    #[test]
    fn partition_build_rejects_built_and_repeated_values() {
        let f = fixture();
        f.assert_rejected(partitions(f.first, &["us"], false), "DUPLICATE_PARTITION_VALUES");
        f.assert_rejected(partitions(f.second, &["eu", "eu"], false), "DUPLICATE_PARTITION_VALUES");
        f.assert_rejected(partitions(f.second, &[], false), "PARTITION_COLUMN_MISSING");
        f.assert_rejected(partitions(SegmentId::new(), &["eu"], false), "SEGMENT_NOT_FOUND");
    }

    #[test]
    fn partition_refresh_requires_built_partitions() {
        let f = fixture();
        f.assert_rejected(partitions(f.first, &["us", "eu"], true), "PARTITION_NOT_FOUND");

        let job_id = f.submit(partitions(f.first, &["us"], true)).unwrap();
        let job = f.job(job_id);
        assert_eq!(job.job_type, JobType::SubPartitionRefresh);
        assert_eq!(job.target_partitions.len(), 1);
        // A refresh registers nothing new on the model.
        assert_eq!(f.dataflow().multi_partition.unwrap().partitions.len(), 1);
    }

    #[test]
    fn incremental_segment_resolves_partition_values() {
        let f = fixture();
        let incremental = |values: &[&str]| BuildTarget::IncrementalSegment {
            model_id: MODEL.to_string(),
            range: SegmentRange::new(20, 30),
            layout_ids: BTreeSet::new(),
            partition_values: regions(values),
        };
        f.assert_rejected(incremental(&[]), "PARTITION_COLUMN_MISSING");

        let job_id = f.submit(incremental(&["us", "eu"])).unwrap();
        let job = f.job(job_id);
        let df = f.dataflow();
        let desc = df.multi_partition.as_ref().unwrap();
        let (us, eu) = (desc.find(&region("us")).unwrap(), desc.find(&region("eu")).unwrap());
        assert_eq!(job.target_partitions, BTreeSet::from([us, eu]));

        let segment = df.segment(job.target_segments[0]).unwrap();
        assert_eq!(segment.range, SegmentRange::new(20, 30));
        assert!(segment.has_partition(us) && segment.has_partition(eu));
    }

    #[test]
    fn merge_targets_the_new_segment_and_its_sources() {
        let f = fixture();
        let job_id = f
            .submit(BuildTarget::Merge {
                model_id: MODEL.to_string(),
                segment_ids: vec![f.second, f.first],
            })
            .unwrap();
        let job = f.job(job_id);
        assert_eq!(job.job_type, JobType::IndexMerge);
        assert_eq!(job.target_segments.len(), 3);
        let merged = job.target_segments[0];
        assert!(job.target_segments.contains(&f.first) && job.target_segments.contains(&f.second));
        assert_eq!(
            f.dataflow().segment(merged).unwrap().range,
            SegmentRange::new(0, 20)
        );

        // Sources stay locked while the merge runs.
        f.assert_rejected(
            BuildTarget::Refresh {
                model_id: MODEL.to_string(),
                segment_ids: vec![f.first],
            },
            "JOB_CREATION_CHECK_FAILED",
        );
    }

    #[test]
    fn indexes_and_refresh_build_requested_layouts() {
        let f = fixture();
        f.assert_rejected(
            BuildTarget::Indexes {
                model_id: MODEL.to_string(),
                segment_ids: vec![f.first],
                layout_ids: BTreeSet::from([LayoutId(9)]),
            },
            "LAYOUT_NOT_FOUND",
        );

        let job_id = f
            .submit(BuildTarget::Indexes {
                model_id: MODEL.to_string(),
                segment_ids: vec![f.first, f.first],
                layout_ids: BTreeSet::from([LayoutId(2)]),
            })
            .unwrap();
        let job = f.job(job_id);
        assert_eq!(job.job_type, JobType::IndexBuild);
        assert_eq!(job.target_segments, vec![f.first]);
        assert!(job
            .tasks
            .iter()
            .all(|t| t.params.layout_ids == BTreeSet::from([LayoutId(2)]) && t.params.index_count == 1));

        let job_id = f
            .submit(BuildTarget::Refresh {
                model_id: MODEL.to_string(),
                segment_ids: vec![f.second],
            })
            .unwrap();
        let job = f.job(job_id);
        assert_eq!(job.job_type, JobType::IndexRefresh);
        assert_eq!(job.target_segments, vec![f.second]);
        assert!(job.tasks.iter().all(|t| t.params.index_count == 2));
        assert_eq!(f.submitter.submitted().len(), 2);
    }

    #[test]
    fn partition_values_are_validated_before_limits_matter() {
        let desc = MultiPartitionDesc::new(vec!["region".into(), "channel".into()]);
        let v = |a: &str, b: &str| vec![a.to_string(), b.to_string()];

        let err = validate_partition_values(Some(&desc), &[], 10).unwrap_err();
        assert_eq!(err.code(), "PARTITION_COLUMN_MISSING");

        let err = validate_partition_values(Some(&desc), &[vec!["us".to_string()]], 10).unwrap_err();
        assert_eq!(err.code(), "PARTITION_VALUE_MISMATCH");

        let err = validate_partition_values(Some(&desc), &[v("us", "web"), v("us", "web")], 10)
            .unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_PARTITION_VALUES");

        let err = validate_partition_values(Some(&desc), &[v("us", "web"), v("eu", "web")], 1)
            .unwrap_err();
        assert!(matches!(err, AdmissionError::TooManyPartitions { requested: 2, limit: 1 }));

        let err = validate_partition_values(None, &[v("us", "web")], 10).unwrap_err();
        assert_eq!(err.code(), "PARTITION_VALUE_MISMATCH");
        assert!(validate_partition_values(None, &[], 10).is_ok());
    }

    #[test]
    fn merge_requires_contiguous_ready_segments() {
        let project = ProjectName::new("retail").unwrap();
        let now = Utc::now();
        let s1 = Segment::new(SegmentRange::new(0, 10), SegmentStatus::Ready, now);
        let s2 = Segment::new(SegmentRange::new(10, 20), SegmentStatus::Ready, now);
        let s3 = Segment::new(SegmentRange::new(30, 40), SegmentStatus::Ready, now);
        let s4 = Segment::new(SegmentRange::new(40, 50), SegmentStatus::New, now);
        let (id1, id2, id3, id4) = (s1.id, s2.id, s3.id, s4.id);
        let df = Dataflow::new(project, "m", BTreeSet::new())
            .with_segment(s1)
            .with_segment(s2)
            .with_segment(s3)
            .with_segment(s4);

        assert_eq!(merge_range(&df, &[id2, id1]).unwrap(), SegmentRange::new(0, 20));
        assert_eq!(merge_range(&df, &[id1]).unwrap_err().code(), "INVALID_MERGE_SEGMENTS");
        assert_eq!(merge_range(&df, &[id2, id3]).unwrap_err().code(), "INVALID_MERGE_SEGMENTS");
        assert_eq!(merge_range(&df, &[id3, id4]).unwrap_err().code(), "INVALID_MERGE_SEGMENTS");
    }
}
