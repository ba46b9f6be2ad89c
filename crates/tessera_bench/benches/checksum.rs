//! Checksum benchmarks: digest algorithms, full pyramid builds and
//! incremental maintenance.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tessera_bench::{generate_ids, random_payload, random_text};
use tessera_core::checksum::{item_checksum, Pyramid, DEFAULT_GROUP_SIZE};
use tessera_core::commit::{Entry, State, Status, TrackedState};
use tessera_core::DigestAlgorithm;

const ALGORITHMS: [DigestAlgorithm; 2] = [DigestAlgorithm::Sha256, DigestAlgorithm::Blake3];

/// Benchmark raw digest throughput.
fn bench_digest(c: &mut Criterion) {
    let mut group = c.benchmark_group("digest");

    for size in [64, 1024, 16384].iter() {
        let data = random_text(*size).into_bytes();
        group.throughput(Throughput::Bytes(*size as u64));
        for algorithm in ALGORITHMS {
            group.bench_with_input(BenchmarkId::new(algorithm.to_string(), size), &data, |b, data| {
                b.iter(|| black_box(algorithm.digest(black_box(data))));
            });
        }
    }
    group.finish();
}

fn populated_state(algorithm: DigestAlgorithm, count: usize) -> State {
    let mut state = State::new();
    for id in generate_ids(count) {
        let payload = random_payload(64);
        let bytes = payload.encode().unwrap();
        let checksum = item_checksum(algorithm, &id, &bytes);
        state.set_status(id, Status::Live(Entry { payload, checksum }));
    }
    state
}

/// Benchmark building the state checksum from scratch.
fn bench_full_checksum(c: &mut Criterion) {
    let mut group = c.benchmark_group("state_checksum_full");

    for count in [100, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        for algorithm in ALGORITHMS {
            let state = populated_state(algorithm, *count);
            group.bench_with_input(BenchmarkId::new(algorithm.to_string(), count), &state, |b, state| {
                b.iter(|| black_box(state.checksum(algorithm, DEFAULT_GROUP_SIZE)));
            });
        }
    }
    group.finish();
}

/// Benchmark updating one element of a large state incrementally.
fn bench_incremental_checksum(c: &mut Criterion) {
    let mut group = c.benchmark_group("state_checksum_incremental");
    let algorithm = DigestAlgorithm::Blake3;

    for count in [1000, 10000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let state = populated_state(algorithm, count);
            let ids: Vec<_> = state.iter().map(|(id, _)| *id).collect();
            let mut tracked = TrackedState::new(state, algorithm, DEFAULT_GROUP_SIZE);
            let payload = random_payload(64);
            let bytes = payload.encode().unwrap();
            let mut i = 0usize;

            b.iter(|| {
                let id = ids[i % ids.len()];
                let checksum = item_checksum(algorithm, &id, &bytes);
                tracked.set_status(
                    id,
                    Status::Live(Entry {
                        payload: payload.clone(),
                        checksum,
                    }),
                );
                black_box(tracked.checksum());
                i += 1;
            });
        });
    }
    group.finish();
}

/// Benchmark pyramid leaf updates against a rebuild.
fn bench_pyramid(c: &mut Criterion) {
    let mut group = c.benchmark_group("pyramid");
    let algorithm = DigestAlgorithm::Sha256;
    let leaves: Vec<_> = (0..4096u32)
        .map(|i| algorithm.digest(&i.to_le_bytes()))
        .collect();

    group.bench_function("build_4096", |b| {
        b.iter(|| black_box(Pyramid::build(algorithm, DEFAULT_GROUP_SIZE, leaves.clone()).root()));
    });

    group.bench_function("update_4096", |b| {
        let mut pyramid = Pyramid::build(algorithm, DEFAULT_GROUP_SIZE, leaves.clone());
        let mut i = 0usize;
        b.iter(|| {
            pyramid.update(i % leaves.len(), leaves[(i * 7) % leaves.len()]);
            black_box(pyramid.root());
            i += 1;
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_digest,
    bench_full_checksum,
    bench_incremental_checksum,
    bench_pyramid,
);

criterion_main!(benches);
