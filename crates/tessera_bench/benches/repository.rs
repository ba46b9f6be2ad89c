//! Repository operation benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use tessera_bench::{bench_partition, generate_ids, memory_repo, random_payload};
use tessera_core::{last_writer_wins, Change, RetentionPolicy, Timestamp};

/// Benchmark single-element commits rewriting a fixed pool of elements.
fn bench_single_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_put");
    let partition = bench_partition();

    for size in [64, 1024, 4096].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let (repo, _) = memory_repo(1024);
            let ids = generate_ids(256);
            let payloads: Vec<_> = (0..16).map(|_| random_payload(size)).collect();
            let mut i = 0usize;

            b.iter(|| {
                let head = repo.head(&partition).unwrap();
                let change = Change::Put(ids[i % ids.len()], payloads[i % payloads.len()].clone());
                black_box(repo.append(&partition, head, vec![change]).unwrap());
                i += 1;
            });
        });
    }
    group.finish();
}

/// Benchmark commits touching many elements at once.
fn bench_batch_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_put");
    let partition = bench_partition();

    for batch_size in [10, 100, 500].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            batch_size,
            |b, &batch_size| {
                b.iter_batched(
                    || {
                        let (repo, _) = memory_repo(1024);
                        let changes: Vec<_> = generate_ids(batch_size)
                            .into_iter()
                            .map(|id| Change::Put(id, random_payload(256)))
                            .collect();
                        (repo, changes)
                    },
                    |(repo, changes)| {
                        black_box(repo.append(&partition, None, changes).unwrap());
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }
    group.finish();
}

/// Benchmark opening a partition by replaying its log.
fn bench_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("replay_on_open");
    group.sample_size(20);
    let partition = bench_partition();

    for commits in [100, 1000].iter() {
        group.throughput(Throughput::Elements(*commits as u64));
        group.bench_with_input(BenchmarkId::from_parameter(commits), commits, |b, &commits| {
            let temp = tempfile::tempdir().unwrap();
            {
                let repo = tessera_core::Repository::open(temp.path()).unwrap();
                repo.create_partition(&partition).unwrap();
                let ids = generate_ids(64);
                let mut head = None;
                for i in 0..commits {
                    let change = Change::Put(ids[i % ids.len()], random_payload(128));
                    head = Some(repo.append(&partition, head, vec![change]).unwrap());
                }
            }

            b.iter(|| {
                let repo = tessera_core::Repository::open(temp.path()).unwrap();
                black_box(repo.state_checksum(&partition).unwrap());
            });
        });
    }
    group.finish();
}

/// Benchmark a three-way merge of two diverged replicas.
fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");
    let partition = bench_partition();

    for diverged in [10, 100].iter() {
        group.throughput(Throughput::Elements(*diverged as u64 * 2));
        group.bench_with_input(BenchmarkId::from_parameter(diverged), diverged, |b, &diverged| {
            b.iter_batched(
                || {
                    let (ours, clock) = memory_repo(4096);
                    let (theirs, _) = memory_repo(4096);
                    let shared = ours
                        .append(&partition, None, vec![Change::Put(generate_ids(1)[0], random_payload(64))])
                        .unwrap();
                    let record = ours.export_commit(&partition, &shared).unwrap();
                    theirs.import_commits(&partition, &[record]).unwrap();
                    let base = theirs.merge(&partition, shared, last_writer_wins).unwrap();

                    let mut ours_head = shared;
                    let mut theirs_head = base.commit_id;
                    let mut exported = vec![theirs.export_commit(&partition, &theirs_head).unwrap()];
                    for _ in 0..diverged {
                        clock.advance(Timestamp::SECOND);
                        ours_head = ours
                            .append(&partition, Some(ours_head), vec![Change::Put(generate_ids(1)[0], random_payload(64))])
                            .unwrap();
                        theirs_head = theirs
                            .append(&partition, Some(theirs_head), vec![Change::Put(generate_ids(1)[0], random_payload(64))])
                            .unwrap();
                        exported.push(theirs.export_commit(&partition, &theirs_head).unwrap());
                    }
                    ours.import_commits(&partition, &exported).unwrap();
                    (ours, theirs_head)
                },
                |(ours, remote)| {
                    black_box(ours.merge(&partition, remote, last_writer_wins).unwrap());
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

/// Benchmark snapshot and compaction of a long history.
fn bench_snapshot_and_compact(c: &mut Criterion) {
    let mut group = c.benchmark_group("maintenance");
    group.sample_size(20);
    let partition = bench_partition();

    let build = || {
        let (repo, clock) = memory_repo(1024);
        let ids = generate_ids(100);
        let mut head = None;
        for i in 0..500 {
            let change = Change::Put(ids[i % ids.len()], random_payload(128));
            head = Some(repo.append(&partition, head, vec![change]).unwrap());
            clock.advance(Timestamp::DAY / 10);
        }
        let as_of = clock_now(&clock);
        (repo, as_of)
    };

    group.bench_function("snapshot_500", |b| {
        b.iter_batched(
            build,
            |(repo, _)| black_box(repo.snapshot(&partition).unwrap()),
            BatchSize::SmallInput,
        );
    });

    group.bench_function("compact_500", |b| {
        b.iter_batched(
            build,
            |(repo, as_of)| {
                black_box(repo.compact(&partition, &RetentionPolicy::new(as_of)).unwrap())
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn clock_now(clock: &tessera_core::ManualClock) -> Timestamp {
    use tessera_core::Clock;
    clock.now()
}

criterion_group!(
    benches,
    bench_single_put,
    bench_batch_put,
    bench_replay,
    bench_merge,
    bench_snapshot_and_compact,
);

criterion_main!(benches);
