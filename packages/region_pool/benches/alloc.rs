//! Allocation-path benchmarks: bump hits, block rollover and remnant
//! reuse.

use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use region_pool::Context;

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc");

    group.bench_function("bump_64", |b| {
        let ctx = Context::new();
        b.iter_batched(
            || ctx.root_pool(),
            |pool| {
                for _ in 0..64 {
                    black_box(pool.alloc(64));
                }
                // SAFETY: The allocations are dropped with the pool.
                unsafe { pool.destroy() };
            },
            criterion::BatchSize::SmallInput,
        );
    });

    group.bench_function("clear_and_refill", |b| {
        let ctx = Context::new();
        let pool = ctx.root_pool();
        b.iter(|| {
            for _ in 0..32 {
                black_box(pool.alloc(256));
            }
            // SAFETY: No allocation is reused across iterations.
            unsafe { pool.clear() };
        });
    });

    group.bench_function("oversized_cached", |b| {
        let ctx = Context::builder().stdsize(1024).build();
        let pool = ctx.root_pool();
        b.iter(|| {
            black_box(pool.alloc(16 * 1024));
            // SAFETY: No allocation is reused across iterations.
            unsafe { pool.clear() };
        });
    });

    group.finish();
}

criterion_group!(benches, entrypoint);
criterion_main!(benches);
