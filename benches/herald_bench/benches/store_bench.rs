//! Job store benchmarks
//!
//! Measures the due-time index under growing job counts, and a full
//! lease/update/release cycle on the in-memory store.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use herald_jobs::{
    Destination, DestinationOutcome, InMemoryStore, JobRecord, JobStore, MessageHandle,
    OutcomeDelta, Payload,
};
use std::time::Duration;
use tokio::runtime::Runtime;

fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn job(due: DateTime<Utc>, destinations: usize) -> JobRecord {
    JobRecord::publish(
        Payload::new(serde_json::json!({"text": "benchmark"})),
        (0..destinations).map(|i| Destination::from(format!("chat-{}", i))),
        due,
        3,
        None,
        t0(),
    )
    .unwrap()
}

fn filled_store(rt: &Runtime, jobs: usize) -> InMemoryStore {
    let store = InMemoryStore::new();
    rt.block_on(async {
        for i in 0..jobs {
            let due = t0() + ChronoDuration::seconds(i as i64);
            store.submit(job(due, 1)).await.unwrap();
        }
    });
    store
}

/// Benchmark `due_before` against stores of increasing size
fn bench_due_before(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("due_before");

    for size in [100usize, 1_000, 10_000] {
        let store = filled_store(&rt, size);
        let halfway = t0() + ChronoDuration::seconds(size as i64 / 2);

        group.bench_with_input(BenchmarkId::new("batch_100", size), &size, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    black_box(store.due_before(black_box(halfway), 100).await.unwrap())
                })
            })
        });

        group.bench_with_input(BenchmarkId::new("next_due_at", size), &size, |b, _| {
            b.iter(|| rt.block_on(async { black_box(store.next_due_at().await.unwrap()) }))
        });
    }

    group.finish();
}

/// Benchmark one dispatch pass worth of store traffic
fn bench_lease_cycle(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("lease_cycle");

    for destinations in [1usize, 5, 20] {
        group.bench_with_input(
            BenchmarkId::from_parameter(destinations),
            &destinations,
            |b, &destinations| {
                let store = InMemoryStore::new();
                b.iter(|| {
                    rt.block_on(async {
                        let id = store.submit(job(t0(), destinations)).await.unwrap();
                        let leased = store
                            .lease(&id, "bench", Duration::from_secs(60), t0())
                            .await
                            .unwrap();
                        let token = leased.lease_token().unwrap();
                        for destination in leased.destinations() {
                            let outcome = DestinationOutcome::Delivered {
                                handle: MessageHandle::from("1"),
                                delivered_at: t0(),
                                attempts: 1,
                            };
                            store
                                .update(
                                    &id,
                                    &token,
                                    OutcomeDelta::new(destination.clone(), outcome),
                                    t0(),
                                )
                                .await
                                .unwrap();
                        }
                        black_box(store.release(&id, &token, t0()).await.unwrap())
                    })
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_due_before, bench_lease_cycle);
criterion_main!(benches);
