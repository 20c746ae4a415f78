//! Benchmarks for registry and admission operations using criterion.
//!
//! These benchmarks measure:
//! - Claim + complete of one task in an otherwise empty region
//! - Status updates against a region filled to capacity
//! - `list_active` snapshots as the region grows
//! - Admission acquire/release round trips

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use flowjob::{admit, SemaphoreAdmission, TaskId, TaskRecord};
use flowjob_testkit::TempRegistry;
use tokio::runtime::Runtime;

fn record(id: &str) -> TaskRecord {
    TaskRecord::new(
        TaskId::parse(id).expect("valid task id"),
        8,
        "/exports/bench/output-with-a-fairly-long-destination-path.ipfix",
        50,
    )
}

/// Benchmark: claim a slot and free it again.
fn bench_claim_complete(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_complete");
    group.sample_size(100);
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("empty_region", |b| {
        let fixture = TempRegistry::new(15);
        let registry = fixture.registry();
        let task = record("bench-task");

        b.iter(|| {
            assert!(registry.add(&task));
            assert!(registry.complete(&task.task_id, true));
        });
    });

    group.finish();
}

/// Benchmark: rewrite the status of the last slot in a full region.
fn bench_update_status(c: &mut Criterion) {
    let mut group = c.benchmark_group("update_status");

    for size in [15usize, 128, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let fixture = TempRegistry::new(size);
            let registry = fixture.registry();
            for i in 0..size {
                registry.add(&record(&format!("task-{i}")));
            }
            let last = TaskId::parse(format!("task-{}", size - 1)).expect("valid task id");

            b.iter(|| registry.update_status(&last, "step_4_converting_ipfix"));
        });
    }

    group.finish();
}

/// Benchmark: snapshot every active record.
fn bench_list_active(c: &mut Criterion) {
    let mut group = c.benchmark_group("list_active");

    for size in [15usize, 128, 1024] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let fixture = TempRegistry::new(size);
            let registry = fixture.registry();
            for i in 0..size / 2 {
                registry.add(&record(&format!("task-{i}")));
            }

            b.iter(|| registry.list_active());
        });
    }

    group.finish();
}

/// Benchmark: uncontended admission round trip through the RAII permit.
fn bench_admission(c: &mut Criterion) {
    let rt = Runtime::new().expect("Failed to create tokio runtime");
    let admission = Arc::new(SemaphoreAdmission::new(4));

    c.bench_function("admission_round_trip", |b| {
        b.to_async(&rt).iter(|| {
            let admission = admission.clone();
            async move {
                let permit = admit(admission.as_ref(), Duration::from_millis(100)).await;
                assert!(permit.is_some());
            }
        });
    });
}

criterion_group!(
    benches,
    bench_claim_complete,
    bench_update_status,
    bench_list_active,
    bench_admission
);
criterion_main!(benches);
