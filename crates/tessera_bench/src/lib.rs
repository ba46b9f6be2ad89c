//! Benchmark utilities.

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use tessera_core::{Config, ElementId, ManualClock, Payload, PartitionId, Repository, Timestamp};

/// Generate random text of the specified length.
pub fn random_text(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Generate a mail-like payload whose body has `body_size` bytes.
pub fn random_payload(body_size: usize) -> Payload {
    Payload::new()
        .with("subject", random_text(24))
        .with("from", "bench@example.com")
        .with("size", rand::thread_rng().gen_range(0..1_000_000_i64))
        .with("body", random_text(body_size))
}

/// Generate a batch of element ids.
pub fn generate_ids(count: usize) -> Vec<ElementId> {
    (0..count).map(|_| ElementId::new()).collect()
}

/// The partition every benchmark writes to.
pub fn bench_partition() -> PartitionId {
    PartitionId::new("bench").expect("valid partition id")
}

/// An in-memory repository with one empty partition and a manual clock.
pub fn memory_repo(header_capacity: u32) -> (Repository, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_700_000_000_000)));
    let config = Config::new()
        .header_capacity(header_capacity)
        .sync_on_commit(false)
        .clock(clock.clone());
    let repo = Repository::in_memory(config).expect("in-memory repository");
    repo.create_partition(&bench_partition())
        .expect("bench partition");
    (repo, clock)
}
