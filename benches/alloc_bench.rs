//! Allocation and scheduling benchmarks using criterion.
//!
//! Run with: cargo bench --bench alloc_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use nodal::task::Priority;
use nodal::{spawn, MemSource, NodeList};

fn bench_msource_alloc_free(c: &mut Criterion) {
    let node = NodeList::logical()[0];
    let ms = MemSource::create(node, 64 << 20, "bench-alloc");
    assert!(ms.valid());

    let mut group = c.benchmark_group("msource_alloc_free");
    for size in [64usize, 1024, 16 * 1024, 256 * 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let p = ms.alloc(black_box(size));
                assert!(!p.is_null());
                MemSource::free(p);
            });
        });
    }
    group.finish();
}

fn bench_aligned_alloc(c: &mut Criterion) {
    let node = NodeList::logical()[0];
    let ms = MemSource::create(node, 64 << 20, "bench-aligned");
    assert!(ms.valid());

    c.bench_function("msource_alloc_aligned_4k", |b| {
        b.iter(|| {
            let p = ms.alloc_aligned(4096, black_box(8 * 1024));
            assert!(!p.is_null());
            MemSource::free(p);
        });
    });
}

fn bench_spawn_join(c: &mut Criterion) {
    let node = NodeList::logical_with_cpus()[0];

    c.bench_function("spawn_join_single", |b| {
        b.iter(|| {
            let handle = spawn(|| black_box(1u64) + 1, Priority::new(0), node);
            assert_eq!(handle.join(), 2);
        });
    });

    c.bench_function("spawn_join_batch_100", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..100)
                .map(|i| spawn(move || black_box(i), Priority::new(0), node))
                .collect();
            let refs: Vec<_> = handles.iter().map(|h| h.triggerable()).collect();
            nodal::wait(&refs);
            for h in handles {
                let _ = h.join();
            }
        });
    });
}

criterion_group!(
    benches,
    bench_msource_alloc_free,
    bench_aligned_alloc,
    bench_spawn_join
);
criterion_main!(benches);
