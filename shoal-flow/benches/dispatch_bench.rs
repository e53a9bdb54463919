//! Fair queue dispatch benchmarks.
//!
//! Measures queue/dispatch throughput across class counts and request
//! sizes.

#![allow(missing_docs)]

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use shoal_core::{ClassId, IoTicket};
use shoal_flow::{FairGroup, FairGroupConfig, FairQueue, FairQueueConfig};

/// A group deep enough that the bucket never backpressures the benchmark.
fn unconstrained_group() -> Arc<FairGroup> {
    let config = FairGroupConfig {
        rate_limit_duration_us: 100_000_000,
        ..FairGroupConfig::for_testing()
    };
    Arc::new(FairGroup::new(&config, 0).expect("benchmark group config is valid"))
}

fn bench_queue_dispatch(c: &mut Criterion) {
    let mut group_bench = c.benchmark_group("queue_dispatch");

    for classes in [1_u32, 4, 16] {
        let batch = 1024_u64;
        group_bench.throughput(Throughput::Elements(batch));
        group_bench.bench_with_input(
            BenchmarkId::new("classes", classes),
            &classes,
            |b, &classes| {
                let group = unconstrained_group();
                let mut q: FairQueue<u64> = FairQueue::new(
                    Arc::clone(&group),
                    FairQueueConfig::for_testing(),
                    0,
                );
                for id in 0..classes {
                    q.register_priority_class(ClassId::new(id), 100);
                }

                let ticket = IoTicket::new(1, 512);
                let mut now = 0_u64;
                b.iter(|| {
                    for i in 0..batch {
                        #[allow(clippy::cast_possible_truncation)]
                        let class = ClassId::new((i % u64::from(classes)) as u32);
                        q.queue(class, ticket, i);
                    }
                    let mut dispatched = 0_u64;
                    while dispatched < batch {
                        let mut finished = Vec::new();
                        q.dispatch_requests(now, |t, payload| {
                            black_box(payload);
                            finished.push(t);
                        });
                        dispatched += finished.len() as u64;
                        // Completions release capacity straight back.
                        for t in finished {
                            q.notify_request_finished(t);
                        }
                        now += 1_000;
                    }
                    black_box(dispatched)
                });
            },
        );
    }

    group_bench.finish();
}

fn bench_cancellation(c: &mut Criterion) {
    c.bench_function("cancel_queued", |b| {
        let group = unconstrained_group();
        let mut q: FairQueue<u64> =
            FairQueue::new(Arc::clone(&group), FairQueueConfig::for_testing(), 0);
        q.register_priority_class(ClassId::new(0), 100);
        let ticket = IoTicket::new(1, 4096);

        b.iter(|| {
            let ids: Vec<_> = (0..256_u64)
                .map(|i| q.queue(ClassId::new(0), ticket, i))
                .collect();
            for id in ids {
                black_box(q.notify_request_cancelled(id));
            }
            // Reap the tombstones.
            q.dispatch_requests(0, |_, _| {});
        });
    });
}

criterion_group!(benches, bench_queue_dispatch, bench_cancellation);
criterion_main!(benches);
