use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use kitsu_infra::coordinator::{Coordinator, InMemoryCoordinator};
use kitsu_infra::jobs::GLOBAL_JOB_COUNTER_KEY;
use kitsu_infra::rate_limit::RateLimitKey;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

/// Admission path: check-and-increment against the ceiling, then release.
fn bench_admission(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("admission");

    for ceiling in [1_i64, 20, 1_000] {
        group.bench_with_input(BenchmarkId::new("increment_if_below", ceiling), &ceiling, |b, &ceiling| {
            let store = InMemoryCoordinator::new();
            b.iter(|| {
                rt.block_on(async {
                    if store
                        .increment_if_below(GLOBAL_JOB_COUNTER_KEY, black_box(ceiling))
                        .await
                        .unwrap()
                    {
                        store.decrement_counter(GLOBAL_JOB_COUNTER_KEY).await.unwrap();
                    }
                })
            });
        });
    }

    group.bench_function("saturated_rejection", |b| {
        let store = InMemoryCoordinator::new();
        rt.block_on(store.set_value(GLOBAL_JOB_COUNTER_KEY, "20", None)).unwrap();
        b.iter(|| {
            let admitted = rt
                .block_on(store.increment_if_below(GLOBAL_JOB_COUNTER_KEY, 20))
                .unwrap();
            assert!(!admitted);
        });
    });

    group.finish();
}

fn bench_rate_limit_keys(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limit_key");

    for len in [16_usize, 256] {
        let identity = format!("{}@example.com", "u".repeat(len));
        group.throughput(Throughput::Bytes(identity.len() as u64));
        group.bench_with_input(BenchmarkId::new("derive", len), &identity, |b, identity| {
            b.iter(|| RateLimitKey::derive("login", black_box(identity), Some("10.0.0.1")).unwrap());
        });
    }

    group.bench_function("derive_without_ip", |b| {
        b.iter(|| RateLimitKey::derive("refresh", black_box("token-123"), None).unwrap());
    });

    group.finish();
}

criterion_group!(benches, bench_admission, bench_rate_limit_keys);
criterion_main!(benches);
