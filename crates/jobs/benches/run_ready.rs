use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;

use backlog_core::{JobType, Metadata, TargetId};
use backlog_jobs::{
    DerivedJob, InMemoryJobStore, JobExecutionError, JobHandler, JobRegistry, JobRunner,
    JobSource, TargetLoader,
};

const HEAT: JobType = JobType::from_static("bug-heat-update");

/// Every bug exists; its heat is derived from the id.
struct Bugs;

impl TargetLoader for Bugs {
    type Target = i64;

    fn family(&self) -> &str {
        "bug"
    }

    fn load(&self, id: TargetId) -> anyhow::Result<Option<i64>> {
        Ok(Some(id.get() % 97))
    }
}

struct UpdateHeat;

impl JobHandler<i64> for UpdateHeat {
    fn run(&self, job: &mut DerivedJob<'_, i64>) -> Result<(), JobExecutionError> {
        let heat = *job.target();
        job.metadata_mut().insert("heat", heat);
        Ok(())
    }
}

fn registry() -> Arc<JobRegistry> {
    let mut registry = JobRegistry::new();
    registry
        .register(HEAT, || UpdateHeat, Bugs)
        .expect("register bug-heat-update");
    Arc::new(registry)
}

/// Store pre-filled with `n` waiting jobs.
fn filled_store(registry: &Arc<JobRegistry>, n: i64) -> Arc<InMemoryJobStore> {
    let store = InMemoryJobStore::arc();
    let source = JobSource::new(store.clone(), registry.clone(), HEAT).expect("source");
    for id in 0..n {
        source
            .create(TargetId::new(id), Metadata::new().with("reason", "new comment"))
            .expect("create");
    }
    store
}

fn bench_create(c: &mut Criterion) {
    let registry = registry();
    let mut group = c.benchmark_group("create");

    group.bench_function("new_target", |b| {
        b.iter_batched(
            || JobSource::new(InMemoryJobStore::arc(), registry.clone(), HEAT).expect("source"),
            |source| {
                for id in 0..100 {
                    black_box(source.create(TargetId::new(id), Metadata::new()).expect("create"));
                }
            },
            BatchSize::SmallInput,
        );
    });

    group.bench_function("dedup_hit", |b| {
        let source = JobSource::new(InMemoryJobStore::arc(), registry.clone(), HEAT).expect("source");
        source.create(TargetId::new(1), Metadata::new()).expect("create");
        b.iter(|| black_box(source.create(TargetId::new(1), Metadata::new()).expect("create")));
    });

    group.finish();
}

fn bench_run_ready(c: &mut Criterion) {
    let registry = registry();
    let mut group = c.benchmark_group("run_ready");

    for size in [10_i64, 100, 1_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || JobRunner::new(filled_store(&registry, size), registry.clone()),
                |runner| black_box(runner.run_ready(&[HEAT], None).expect("run_ready")),
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_create, bench_run_ready);
criterion_main!(benches);
