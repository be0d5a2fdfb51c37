//! Bulk copy throughput through the bound operations
//!
//! Maps a temporary file at cache-line granularity (forced, so the flushing
//! kernels run on any filesystem) and compares unhinted, temporal and
//! non-temporal copies across sizes around the streaming threshold.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::io::Write;

use durable_pmem::{Granularity, MapConfig, MemFlags, Source, Tunables, map};

const SIZES: &[usize] = &[64, 255, 256, 4096, 64 * 1024, 1024 * 1024];

fn bench_memcpy(c: &mut Criterion) {
    durable_pmem::init_with(Tunables {
        force_granularity: Some(Granularity::CacheLine),
        ..Tunables::default()
    })
    .unwrap();

    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(&vec![0u8; 2 * 1024 * 1024]).unwrap();
    let file = std::fs::OpenOptions::new().read(true).write(true).open(tmp.path()).unwrap();
    let source = Source::from_file(file).unwrap();
    let mapping = map(&MapConfig::new(Granularity::CacheLine), &source).unwrap();
    let src = vec![0xA5u8; 1024 * 1024];

    let mut group = c.benchmark_group("memcpy");
    for &size in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        for (name, flags) in [
            ("auto", MemFlags::empty()),
            ("temporal", MemFlags::TEMPORAL),
            ("nontemporal", MemFlags::NONTEMPORAL),
        ] {
            group.bench_with_input(BenchmarkId::new(name, size), &size, |b, &size| {
                b.iter(|| unsafe {
                    mapping
                        .ops()
                        .memcpy(mapping.address(), black_box(src.as_ptr()), size, flags);
                });
            });
        }
    }
    group.finish();
}

fn bench_persist(c: &mut Criterion) {
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(&vec![0u8; 64 * 1024]).unwrap();
    let file = std::fs::OpenOptions::new().read(true).write(true).open(tmp.path()).unwrap();
    let source = Source::from_file(file).unwrap();
    let mapping = map(&MapConfig::new(Granularity::Page), &source).unwrap();

    let mut group = c.benchmark_group("persist");
    for size in [64usize, 4096, 64 * 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| mapping.persist(0, black_box(size)).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_memcpy, bench_persist);
criterion_main!(benches);
