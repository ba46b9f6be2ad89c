//! Storage and file layout benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;
use tessera_bench::{bench_partition, generate_ids, random_payload};
use tessera_core::commit::{Commit, CommitDraft, ItemChange};
use tessera_core::layout::{Block, LogFile, LogScan};
use tessera_core::{DigestAlgorithm, ElementId};
use tessera_storage::{DirStore, FileStore, InMemoryBackend, MemoryStore, StorageBackend};

const ALGORITHM: DigestAlgorithm = DigestAlgorithm::Sha256;

/// A sealed single-change commit record for `id`.
fn record(id: ElementId, body_size: usize) -> Vec<u8> {
    let change = ItemChange::full(ALGORITHM, id, random_payload(body_size)).unwrap();
    let (_, bytes) = CommitDraft {
        changes: vec![change],
        ..CommitDraft::default()
    }
    .seal(ALGORITHM)
    .unwrap();
    bytes
}

/// Benchmark sealing and parsing commit records.
fn bench_commit_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit_record");

    for size in [64, 1024, 4096].iter() {
        let bytes = record(ElementId::new(), *size);
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::new("parse", size), &bytes, |b, bytes| {
            b.iter(|| black_box(Commit::decode(black_box(bytes), ALGORITHM).unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("seal", size), size, |b, &size| {
            let change = ItemChange::full(ALGORITHM, ElementId::new(), random_payload(size)).unwrap();
            b.iter(|| {
                let draft = CommitDraft {
                    changes: vec![change.clone()],
                    ..CommitDraft::default()
                };
                black_box(draft.seal(ALGORITHM).unwrap());
            });
        });
    }
    group.finish();
}

/// Benchmark block framing.
fn bench_block_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("block");
    let block = Block::imported(record(ElementId::new(), 1024));
    let encoded = block.encode().unwrap();
    group.throughput(Throughput::Bytes(encoded.len() as u64));

    group.bench_function("encode_1k", |b| {
        b.iter(|| black_box(block.encode().unwrap()));
    });
    group.bench_function("decode_1k", |b| {
        b.iter(|| black_box(Block::decode(black_box(&encoded)).unwrap()));
    });
    group.finish();
}

/// Benchmark publishing blocks into an in-memory log.
fn bench_log_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("log_append");
    let partition = bench_partition();

    for size in [256, 4096].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let ids = generate_ids(128);
            let records: Vec<_> = ids.iter().map(|id| record(*id, size)).collect();
            let mut log = LogFile::create(
                Box::new(InMemoryBackend::new()),
                &partition,
                ALGORITHM,
                256,
                0,
                &[],
                false,
            )
            .unwrap();
            let mut i = 0usize;

            b.iter(|| {
                let n = i % ids.len();
                black_box(log.append(records[n].clone(), true, &[ids[n]]).unwrap());
                i += 1;
            });
        });
    }
    group.finish();
}

/// Benchmark scanning a populated log, as done on every open.
fn bench_log_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("log_scan");
    group.sample_size(20);
    let partition = bench_partition();

    for blocks in [100, 1000].iter() {
        group.throughput(Throughput::Elements(*blocks as u64));
        group.bench_with_input(BenchmarkId::from_parameter(blocks), blocks, |b, &blocks| {
            let store = MemoryStore::new();
            let backend = store.open("bench/g000000.log").unwrap();
            let mut log = LogFile::create(backend, &partition, ALGORITHM, 128, 0, &[], false).unwrap();
            let ids = generate_ids(100);
            for i in 0..blocks {
                let id = ids[i % ids.len()];
                log.append(record(id, 256), true, &[id]).unwrap();
            }
            drop(log);
            let bytes = store.buffer("bench/g000000.log").unwrap().read().clone();
            let snapshot = InMemoryBackend::with_data(bytes);

            b.iter(|| black_box(LogScan::read(&snapshot).unwrap().blocks.len()));
        });
    }
    group.finish();
}

/// Benchmark file-backed appends with and without sync.
fn bench_file_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("file_append");
    group.sample_size(20);

    for sync in [false, true] {
        let name = if sync { "synced_1k" } else { "buffered_1k" };
        group.bench_function(name, |b| {
            let temp_dir = TempDir::new().unwrap();
            let store = DirStore::new(temp_dir.path()).unwrap();
            let mut backend = store.open("bench/g000000.log").unwrap();
            let data = vec![0xA5u8; 1024];

            b.iter(|| {
                black_box(backend.append(black_box(&data)).unwrap());
                if sync {
                    backend.sync().unwrap();
                }
            });
        });
    }
    group.finish();
}

/// Benchmark the atomic replacement used to publish `CURRENT`.
fn bench_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_current");
    group.sample_size(20);

    group.bench_function("replace", |b| {
        b.iter_batched(
            || TempDir::new().unwrap(),
            |temp_dir| {
                let store = DirStore::new(temp_dir.path()).unwrap();
                store.replace("bench/CURRENT", b"1\n").unwrap();
                black_box(temp_dir);
            },
            BatchSize::SmallInput,
        );
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_commit_codec,
    bench_block_codec,
    bench_log_append,
    bench_log_scan,
    bench_file_append,
    bench_publish,
);

criterion_main!(benches);
