//! Benchmark for the local resource pool
//!
//! Measures acquire/release round trips against pools of growing size.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use router_broker::{LocalPoolConfig, LocalPoolPolicy, PolicyDriver, RequestContext};

fn pool_with(instances: usize) -> LocalPoolPolicy {
    let config = LocalPoolConfig {
        instances: (0..instances)
            .map(|i| (format!("inst-{:05}", i), format!("10.0.{}.{}", i / 256, i % 256)))
            .collect(),
        ..Default::default()
    };
    LocalPoolPolicy::new(config).expect("valid pool config")
}

fn bench_acquire_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_pool");
    group.throughput(Throughput::Elements(1));
    let ctx = RequestContext::new("bench");

    for size in [16usize, 256, 4096] {
        let pool = pool_with(size);

        group.bench_with_input(BenchmarkId::new("acquire_release", size), &size, |b, _| {
            b.iter(|| {
                tokio_test::block_on(async {
                    let resource = pool
                        .acquire_resource(&ctx, black_box("router"))
                        .await
                        .expect("pool never drains");
                    pool.release_resource(&ctx, &resource.resource_id)
                        .await
                        .expect("resource was just acquired");
                })
            });
        });
    }

    group.finish();
}

fn bench_acquire_nearly_full(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_pool");
    group.throughput(Throughput::Elements(1));
    let ctx = RequestContext::new("bench");

    // Only the last entry stays free, so every acquire scans the whole pool
    let pool = pool_with(1024);
    tokio_test::block_on(async {
        for _ in 0..1023 {
            let _ = pool.acquire_resource(&ctx, "router").await;
        }
    });

    group.bench_function("acquire_last_free", |b| {
        b.iter(|| {
            tokio_test::block_on(async {
                let resource = pool
                    .acquire_resource(&ctx, black_box("router"))
                    .await
                    .expect("one resource is free");
                pool.release_resource(&ctx, &resource.resource_id)
                    .await
                    .expect("resource was just acquired");
            })
        });
    });

    group.finish();
}

criterion_group!(benches, bench_acquire_release, bench_acquire_nearly_full);
criterion_main!(benches);
