//! Stress tests for Tessera.
//!
//! These helpers drive a repository under sustained and concurrent load
//! and report throughput alongside failure counts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tessera_core::{Change, ElementId, FnClassifier, PartitionId, Payload, Repository};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of commits to append.
    pub operations: usize,
    /// Number of concurrent threads, one partition each.
    pub threads: usize,
    /// Size of the body field in bytes.
    pub body_size: usize,
    /// Number of distinct elements rewritten by the update test.
    pub element_count: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 2_000,
            threads: 4,
            body_size: 256,
            element_count: 100,
        }
    }
}

fn body(config: &StressConfig, i: usize) -> Payload {
    Payload::new()
        .with("subject", format!("message {i}"))
        .with("body", "x".repeat(config.body_size))
}

/// Appends `operations` single-put commits to one partition.
pub fn stress_sequential_appends(
    repo: &Repository,
    partition: &PartitionId,
    config: &StressConfig,
) -> StressTestResult {
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        let head = repo.head(partition).ok().flatten();
        match repo.append(partition, head, vec![Change::Put(ElementId::new(), body(config, i))]) {
            Ok(_) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Rewrites a fixed set of elements over and over, exercising patches and
/// incremental checksum maintenance.
pub fn stress_updates(
    repo: &Repository,
    partition: &PartitionId,
    config: &StressConfig,
) -> StressTestResult {
    let ids: Vec<ElementId> = (0..config.element_count.max(1))
        .map(|_| ElementId::new())
        .collect();
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        let id = ids[i % ids.len()];
        let head = repo.head(partition).ok().flatten();
        let payload = body(config, i / ids.len()).with("revision", i as i64);
        match repo.append(partition, head, vec![Change::Put(id, payload)]) {
            Ok(_) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Inserts from several threads at once, each routed to its own partition
/// by a `worker` field.
pub fn stress_concurrent_inserts(repo: Arc<Repository>, config: &StressConfig) -> StressTestResult {
    repo.register_classifier(Arc::new(FnClassifier::new("worker", |payload: &Payload| {
        payload
            .get("worker")
            .and_then(|field| field.as_int())
            .and_then(|n| PartitionId::new(format!("worker-{n}")).ok())
    })));

    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let per_thread = config.operations / config.threads.max(1);
    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|worker| {
            let repo = Arc::clone(&repo);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let config = config.clone();
            thread::spawn(move || {
                for i in 0..per_thread {
                    let payload = body(&config, i).with("worker", worker as i64);
                    match repo.insert(payload) {
                        Ok(_) => successful.fetch_add(1, Ordering::Relaxed),
                        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
            })
        })
        .collect();

    for handle in handles {
        if handle.join().is_err() {
            failed.fetch_add(per_thread, Ordering::Relaxed);
        }
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Reads state and checksums from several threads while one thread appends.
pub fn stress_readers_during_writes(
    repo: Arc<Repository>,
    partition: PartitionId,
    config: &StressConfig,
) -> StressTestResult {
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let writer = {
        let repo = Arc::clone(&repo);
        let partition = partition.clone();
        let successful = Arc::clone(&successful);
        let failed = Arc::clone(&failed);
        let config = config.clone();
        thread::spawn(move || {
            for i in 0..config.operations {
                let head = repo.head(&partition).ok().flatten();
                let change = Change::Put(ElementId::new(), body(&config, i));
                match repo.append(&partition, head, vec![change]) {
                    Ok(_) => successful.fetch_add(1, Ordering::Relaxed),
                    Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                };
            }
        })
    };

    let readers: Vec<_> = (0..config.threads.saturating_sub(1))
        .map(|_| {
            let repo = Arc::clone(&repo);
            let partition = partition.clone();
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let reads = config.operations / 4;
            thread::spawn(move || {
                for _ in 0..reads {
                    match repo.read_state(&partition) {
                        Ok(_) => successful.fetch_add(1, Ordering::Relaxed),
                        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
            })
        })
        .collect();

    if writer.join().is_err() {
        failed.fetch_add(1, Ordering::Relaxed);
    }
    for reader in readers {
        if reader.join().is_err() {
            failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{inbox, TestRepo};
    use tessera_core::Config;

    fn small() -> StressConfig {
        StressConfig {
            operations: 200,
            threads: 4,
            body_size: 64,
            element_count: 10,
        }
    }

    #[test]
    fn sequential_appends_all_succeed() {
        let test_repo = TestRepo::memory();
        test_repo.create_partition(&inbox()).unwrap();
        let result = stress_sequential_appends(&test_repo, &inbox(), &small());
        assert_eq!(result.failed_ops, 0);
        assert_eq!(test_repo.read_state(&inbox()).unwrap().len(), 200);
    }

    #[test]
    fn updates_keep_element_count() {
        let test_repo = TestRepo::memory();
        test_repo.create_partition(&inbox()).unwrap();
        let result = stress_updates(&test_repo, &inbox(), &small());
        assert_eq!(result.failed_ops, 0);
        assert_eq!(test_repo.read_state(&inbox()).unwrap().len(), 10);
    }

    #[test]
    fn concurrent_inserts_land_in_their_partitions() {
        let repo = Arc::new(Repository::in_memory(Config::new().sync_on_commit(false)).unwrap());
        let config = small();
        let result = stress_concurrent_inserts(Arc::clone(&repo), &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(repo.partitions().len(), config.threads);
        for partition in repo.partitions() {
            assert_eq!(repo.read_state(&partition).unwrap().len(), 50);
        }
    }

    #[test]
    fn readers_never_fail_during_writes() {
        let repo = Arc::new(Repository::in_memory(Config::new().sync_on_commit(false)).unwrap());
        repo.create_partition(&inbox()).unwrap();
        let result = stress_readers_during_writes(Arc::clone(&repo), inbox(), &small());
        assert_eq!(result.failed_ops, 0);
    }
}
