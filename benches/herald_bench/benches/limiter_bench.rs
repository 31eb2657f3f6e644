//! Rate limiter benchmarks
//!
//! Token bucket checks sit on the hot path of every transport call.

use chrono::{DateTime, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use herald_jobs::{BucketConfig, Destination, ManualClock, RateLimiter};
use std::sync::Arc;
use std::time::Duration;

fn limiter(clock: &ManualClock) -> RateLimiter {
    RateLimiter::new(
        BucketConfig::new(3, 1.0),
        BucketConfig::new(30, 30.0),
        Arc::new(clock.clone()),
    )
}

fn start() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

/// Benchmark acquiring across many distinct destinations
fn bench_acquire(c: &mut Criterion) {
    let mut group = c.benchmark_group("acquire");

    for destinations in [1usize, 100, 10_000] {
        let keys: Vec<Destination> = (0..destinations)
            .map(|i| Destination::from(format!("chat-{}", i)))
            .collect();

        group.bench_with_input(
            BenchmarkId::from_parameter(destinations),
            &keys,
            |b, keys| {
                let clock = ManualClock::new(start());
                let limiter = limiter(&clock);
                let mut i = 0usize;
                b.iter(|| {
                    i = (i + 1) % keys.len();
                    clock.advance(Duration::from_millis(10));
                    black_box(limiter.acquire(black_box(&keys[i])))
                })
            },
        );
    }

    group.finish();
}

/// Benchmark pruning a limiter full of idle buckets
fn bench_prune(c: &mut Criterion) {
    c.bench_function("prune_idle_10k", |b| {
        b.iter_batched(
            || {
                let clock = ManualClock::new(start());
                let limiter = limiter(&clock);
                for i in 0..10_000 {
                    limiter.try_acquire(&Destination::from(format!("chat-{}", i)));
                }
                clock.advance(Duration::from_secs(10));
                (limiter, clock)
            },
            |(limiter, _clock)| black_box(limiter.prune_idle()),
            criterion::BatchSize::LargeInput,
        )
    });
}

criterion_group!(benches, bench_acquire, bench_prune);
criterion_main!(benches);
