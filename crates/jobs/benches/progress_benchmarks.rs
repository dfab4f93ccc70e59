use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::collections::BTreeMap;

use chrono::Utc;
use segforge_core::{ProjectName, SegmentId};
use segforge_jobs::{
    ExecutableState, Job, JobType, StepRatioCalculator, TaskParams, INDEX_SUCCESS_COUNT,
};

/// Build job with `segments` fanned-out segments, half of each segment's
/// stages finished and one stage running.
fn job_with_progress(segments: usize) -> Job {
    let segment_ids: Vec<SegmentId> = (0..segments).map(|_| SegmentId::new()).collect();
    let mut job = Job::plan(
        ProjectName::new("bench").unwrap(),
        JobType::IndexBuild,
        "model-bench",
        "bench",
        TaskParams {
            segment_ids: segment_ids.clone(),
            index_count: 100,
            ..Default::default()
        },
        Utc::now(),
    );
    let task_id = job.tasks[1].id;
    let running = BTreeMap::from([(INDEX_SUCCESS_COUNT.to_string(), "42".to_string())]);
    for seg in segment_ids {
        for seq in 0..4 {
            job.update_stage_status(task_id.stage(seq), seg, ExecutableState::Succeed, None, None, false, Utc::now())
                .unwrap();
        }
        job.update_stage_status(task_id.stage(4), seg, ExecutableState::Running, Some(&running), None, false, Utc::now())
            .unwrap();
    }
    job
}

fn bench_step_ratio(c: &mut Criterion) {
    let mut group = c.benchmark_group("step_ratio");
    let calc = StepRatioCalculator::default();

    for segments in [1usize, 16, 256] {
        let job = job_with_progress(segments);
        group.throughput(Throughput::Elements(segments as u64));
        group.bench_with_input(BenchmarkId::from_parameter(segments), &job, |b, job| {
            b.iter(|| black_box(calc.step_ratio(black_box(job))))
        });
    }

    group.finish();
}

fn bench_job_serialization(c: &mut Criterion) {
    let job = job_with_progress(64);
    c.bench_function("job_to_json_64_segments", |b| {
        b.iter(|| black_box(serde_json::to_vec(black_box(&job)).unwrap()))
    });
}

criterion_group!(benches, bench_step_ratio, bench_job_serialization);
criterion_main!(benches);
