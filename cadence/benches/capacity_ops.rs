//! Benchmarks for the capacity assignment hot path using criterion.
//!
//! These benchmarks measure:
//! - Assign then release of a single node
//! - Assignment with many concurrent contenders for a small pool
//! - A reconcile pass against a pool that is already at target
//! - Full launch, poll and release through the task executor

#![allow(missing_docs)]

use std::sync::Arc;

use cadence::*;
use cadence_testkit::{ScriptedPlatform, test_job};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tokio::runtime::Runtime;

/// Creates a tokio runtime for async benchmarks.
fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

fn pool(
    rt: &Runtime,
    size: usize,
) -> (Arc<ScriptedPlatform>, Arc<CapacityManager<ScriptedPlatform>>) {
    let platform = Arc::new(ScriptedPlatform::new());
    let capacity = Arc::new(CapacityManager::new(
        "bench-cluster",
        CapacityTarget::new(1, size, size).expect("valid target"),
        platform.clone(),
        Arc::new(InProcEventBus::new(16)),
    ));
    rt.block_on(capacity.ensure_capacity());
    (platform, capacity)
}

/// Benchmark: assign any node, then release it.
fn bench_assign_release(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("assign_release");
    group.sample_size(100);

    for size in [1usize, 16, 128] {
        let (_, capacity) = pool(&rt, size);
        group.bench_with_input(BenchmarkId::new("pool", size), &size, |b, _| {
            b.to_async(&rt).iter(|| async {
                let node = capacity.assign_any().await.expect("node available");
                capacity.release(node.id).await.expect("release should succeed");
            });
        });
    }

    group.finish();
}

/// Benchmark: many tasks racing for a small pool.
///
/// Each iteration spawns contenders that each try one assignment; winners
/// release immediately.
fn bench_contended_assign(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("contended_assign");
    group.sample_size(50);

    for contenders in [8usize, 64] {
        let (_, capacity) = pool(&rt, 4);
        group.throughput(Throughput::Elements(contenders as u64));
        group.bench_with_input(
            BenchmarkId::new("contenders", contenders),
            &contenders,
            |b, &contenders| {
                b.to_async(&rt).iter(|| {
                    let capacity = capacity.clone();
                    async move {
                        let tasks: Vec<_> = (0..contenders)
                            .map(|_| {
                                let capacity = capacity.clone();
                                tokio::spawn(async move {
                                    if let Some(node) = capacity.assign_any().await {
                                        let _ = capacity.release(node.id).await;
                                    }
                                })
                            })
                            .collect();
                        for task in tasks {
                            task.await.expect("contender panicked");
                        }
                    }
                });
            },
        );
    }

    group.finish();
}

/// Benchmark: reconcile pass with nothing to do.
fn bench_reconcile_at_target(c: &mut Criterion) {
    let rt = create_runtime();
    let (_, capacity) = pool(&rt, 32);

    c.bench_function("reconcile_at_target", |b| {
        b.to_async(&rt).iter(|| async {
            let report = capacity.ensure_capacity().await;
            assert!(report.is_noop());
        });
    });
}

/// Benchmark: launch, poll to completion, and release through the executor.
fn bench_launch_poll(c: &mut Criterion) {
    let rt = create_runtime();
    let (platform, capacity) = pool(&rt, 4);
    let executor = TaskExecutor::new(platform, capacity);
    let job = test_job();

    c.bench_function("launch_poll_release", |b| {
        b.to_async(&rt).iter(|| async {
            let handle = executor.launch_on_pool(&job).await.expect("launch");
            let outcome = executor.poll(&handle).await;
            assert!(outcome.is_terminal());
        });
    });
}

criterion_group!(
    benches,
    bench_assign_release,
    bench_contended_assign,
    bench_reconcile_at_target,
    bench_launch_poll
);
criterion_main!(benches);
