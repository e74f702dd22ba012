//! End-to-end job throughput: fixed vs. balancing loops over a short job.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::atomic::{AtomicUsize, Ordering};

use myriad::Config;

static SUM: AtomicUsize = AtomicUsize::new(0);

fn bench_forall(c: &mut Criterion) {
    let cores = num_cpus::get().clamp(2, 4);
    let n: i64 = 1 << 16;

    let mut group = c.benchmark_group("forall");
    group.sample_size(10);
    group.throughput(Throughput::Elements(n as u64));

    group.bench_with_input(BenchmarkId::new("fixed", n), &n, |b, &n| {
        b.iter(|| {
            let cfg = Config::with_cores(cores);
            myriad::run(cfg, move || {
                myriad::forall(0, n, |_, iters| {
                    SUM.fetch_add(iters as usize, Ordering::Relaxed);
                });
            })
            .unwrap();
        });
    });

    group.bench_with_input(BenchmarkId::new("balancing", n), &n, |b, &n| {
        b.iter(|| {
            let cfg = Config::with_cores(cores);
            myriad::run(cfg, move || {
                myriad::forall_balanced(0, n, |_, iters| {
                    SUM.fetch_add(iters as usize, Ordering::Relaxed);
                });
            })
            .unwrap();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_forall);
criterion_main!(benches);
