//! Benchmark suite for the per-tensor sweep
//!
//! Measures the hot path: decoding and histogramming one tensor's worth
//! of elements per supported dtype, plus the codec table against the
//! algorithmic path.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use medir::analyze::analyze_tensor;
use medir::floatx::BF16;
use medir::safetensors::Dtype;

fn pseudo_random_words(n: usize) -> Vec<u8> {
    let mut state = 0x9E37_79B9_7F4A_7C15u64;
    let mut out = Vec::with_capacity(n * 2);
    for _ in 0..n {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        out.extend_from_slice(&((state >> 32) as u16).to_le_bytes());
    }
    out
}

fn bench_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("sweep");
    for n in [1usize << 12, 1 << 16, 1 << 20] {
        let data = pseudo_random_words(n);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("bf16", n), &data, |b, data| {
            b.iter(|| analyze_tensor("bench", Dtype::BF16, black_box(data)).expect("analyze"));
        });
        group.bench_with_input(BenchmarkId::new("f16", n), &data, |b, data| {
            b.iter(|| analyze_tensor("bench", Dtype::F16, black_box(data)).expect("analyze"));
        });
    }
    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Elements(u64::from(u16::MAX) + 1));
    group.bench_function("bf16_algorithmic", |b| {
        b.iter(|| {
            let mut acc = 0.0f32;
            for v in 0..=u16::MAX {
                acc += BF16::from_bits(black_box(v)).to_f32();
            }
            acc
        });
    });
    group.bench_function("bf16_table", |b| {
        b.iter(|| {
            let mut acc = 0.0f32;
            for v in 0..=u16::MAX {
                acc += BF16::from_bits(black_box(v)).lookup();
            }
            acc
        });
    });
    group.finish();
}

criterion_group!(benches, bench_sweep, bench_codec);
criterion_main!(benches);
