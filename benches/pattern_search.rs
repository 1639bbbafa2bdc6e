//! Benchmarks for pattern search.
//!
//! - Raw ANN search: HNSW against the exact flat scan
//! - Full `PatternIndex::search`, which re-loads rows from `SQLite`

// Criterion macros generate items without docs - this is expected for benchmarks
// Benchmarks use expect/unwrap for simplicity - panics are acceptable in benchmarks
#![allow(missing_docs)]
#![allow(clippy::expect_used, clippy::unwrap_used)]

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::time::Duration;
use swarmkernel::vector::{AnnIndex, FlatIndex, HnswIndex};
use swarmkernel::{AnnIndexParams, Kernel, KernelConfig, NewPattern};

const DIMENSIONS: usize = 128;

/// Deterministic pseudo-random embedding.
fn embedding(seed: u64) -> Vec<f32> {
    let mut state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;
    (0..DIMENSIONS)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            #[allow(clippy::cast_precision_loss)]
            let unit = (state >> 40) as f32 / (1u64 << 24) as f32;
            unit.mul_add(2.0, -1.0)
        })
        .collect()
}

fn bench_ann(c: &mut Criterion) {
    let mut group = c.benchmark_group("ann_search");
    group.measurement_time(Duration::from_secs(5));

    for size in [1_000u64, 10_000] {
        let params = AnnIndexParams::default();
        let mut hnsw = HnswIndex::new(DIMENSIONS, &params);
        let mut flat = FlatIndex::new(DIMENSIONS);
        for i in 0..size {
            let v = embedding(i);
            hnsw.insert(&format!("p{i}"), &v).unwrap();
            flat.insert(&format!("p{i}"), &v).unwrap();
        }
        let query = embedding(size + 1);

        group.bench_with_input(BenchmarkId::new("hnsw", size), &query, |b, q| {
            b.iter(|| black_box(hnsw.search(q, 10).unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("flat", size), &query, |b, q| {
            b.iter(|| black_box(flat.search(q, 10).unwrap()));
        });
    }
    group.finish();
}

fn bench_pattern_index(c: &mut Criterion) {
    let config = KernelConfig::default().with_embedding_dimension(DIMENSIONS);
    let kernel = Kernel::open(config).unwrap();
    for i in 0..5_000 {
        kernel
            .patterns()
            .store(NewPattern::new("bench", embedding(i)))
            .unwrap();
    }
    let query = embedding(99_999);

    let mut group = c.benchmark_group("pattern_index");
    for k in [1usize, 10, 50] {
        group.bench_with_input(BenchmarkId::new("search", k), &k, |b, &k| {
            b.iter(|| black_box(kernel.patterns().search(&query, k).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_ann, bench_pattern_index);
criterion_main!(benches);
