//! Compilation cache benchmarks
//!
//! Key hashing, entry store/load on disk, and the in-memory overlay.

use std::path::Path;

use anydsl_runtime::cache::{default_key_hash, CompilationCache, DEFAULT_EXTENSION};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;

const PAYLOAD_SIZES: [usize; 3] = [1_024, 65_536, 1_048_576];

const SOURCE_LINE: &[u8] = b"__global__ void k(float* x) { x[threadIdx.x] *= 2.0f; }\n";

fn source_key(len: usize) -> Vec<u8> {
    let mut key = b"sm_80".to_vec();
    key.extend((0..len).map(|i| SOURCE_LINE[i % SOURCE_LINE.len()]));
    key
}

fn benchmark_key_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_hash");

    for len in [64, 4_096, 262_144] {
        let key = source_key(len);
        group.throughput(Throughput::Bytes(key.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &key, |b, key| {
            b.iter(|| default_key_hash(black_box(key)));
        });
    }

    group.finish();
}

fn benchmark_store_load(c: &mut Criterion) {
    let dir = TempDir::new().expect("temp dir");
    let cache = CompilationCache::new(Some(dir.path().to_path_buf()));
    let key = source_key(4_096);
    let mut group = c.benchmark_group("cache_entry");

    for size in PAYLOAD_SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        let payload = vec![0x5Au8; size];

        group.bench_with_input(BenchmarkId::new("store", size), &payload, |b, payload| {
            b.iter(|| cache.store_to_cache(&key, black_box(payload), DEFAULT_EXTENSION).expect("store"));
        });

        cache.store_to_cache(&key, &payload, DEFAULT_EXTENSION).expect("store");
        group.bench_with_input(BenchmarkId::new("load_hit", size), &size, |b, _| {
            b.iter(|| black_box(cache.load_from_cache(&key, DEFAULT_EXTENSION)));
        });
    }

    group.bench_function("load_miss", |b| {
        let missing = source_key(17);
        b.iter(|| black_box(cache.load_from_cache(&missing, DEFAULT_EXTENSION)));
    });

    group.finish();
}

fn benchmark_overlay(c: &mut Criterion) {
    let cache = CompilationCache::new(None);
    cache.register_file("jit_0123456789abcdef.cu", source_key(16_384));
    let name = Path::new("jit_0123456789abcdef.cu");

    c.bench_function("overlay_load", |b| {
        b.iter(|| black_box(cache.load_file(black_box(name)).expect("overlay")));
    });
}

criterion_group!(benches, benchmark_key_hash, benchmark_store_load, benchmark_overlay);
criterion_main!(benches);
