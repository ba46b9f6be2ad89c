//! Compact command implementation.

use super::{open_repository, select_partitions, CliError};
use std::path::Path;
use tessera_core::{PartitionId, Repository, RetentionPolicy, Timestamp};
use tracing::info;

/// Compaction statistics for one partition.
#[derive(Debug)]
pub struct CompactStats {
    /// Commits on the head line back to the oldest retained snapshot.
    pub chain_before: usize,
    /// Commits that survive.
    pub retained: usize,
    /// Generation after compaction.
    pub generation: u64,
}

/// Timestamps of the commits compaction folds, oldest first.
fn head_line(repo: &Repository, id: &PartitionId) -> Result<Vec<Timestamp>, CliError> {
    let chain = repo.open_partition(id)?.write().compaction_chain()?;
    Ok(chain.iter().map(|commit| commit.timestamp).collect())
}

/// Runs the compact command.
pub fn run(
    path: &Path,
    partition: Option<&str>,
    as_of: Option<i64>,
    dry_run: bool,
) -> Result<(), CliError> {
    let repo = open_repository(path)?;
    let as_of = as_of.map_or_else(Timestamp::now, Timestamp::from_millis);
    let policy = RetentionPolicy::new(as_of);

    println!("Compacting repository at {} as of {}", path.display(), as_of.as_millis());
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    for id in select_partitions(&repo, partition)? {
        let timestamps = head_line(&repo, &id)?;
        let retained = policy.retained(&timestamps).into_iter().filter(|k| *k).count();
        let generation = if dry_run {
            repo.open_partition(&id)?.read().generation()
        } else {
            repo.compact(&id, &policy)?
        };
        let stats = CompactStats {
            chain_before: timestamps.len(),
            retained,
            generation,
        };
        info!(partition = %id, retained = stats.retained, generation, "compaction finished");
        print_stats(&id, &stats, dry_run);
    }
    Ok(())
}

fn print_stats(id: &PartitionId, stats: &CompactStats, dry_run: bool) {
    let verb = if dry_run { "would keep" } else { "kept" };
    println!(
        "{id}: {verb} {} of {} commits on the head line (generation {})",
        stats.retained, stats.chain_before, stats.generation
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tessera_core::{Change, CoreError, ElementId, Payload};

    fn inbox() -> PartitionId {
        PartitionId::new("inbox").unwrap()
    }

    /// Appends two commits, snapshots, then appends a third.
    fn spanning_history(path: &Path) {
        let repo = Repository::open(path).unwrap();
        repo.create_partition(&inbox()).unwrap();
        let put = |n: i64| vec![Change::Put(ElementId::from_bytes([1; 16]), Payload::new().with("n", n))];
        let c1 = repo.append(&inbox(), None, put(1)).unwrap();
        let c2 = repo.append(&inbox(), Some(c1), put(2)).unwrap();
        repo.snapshot(&inbox()).unwrap();
        repo.append(&inbox(), Some(c2), put(3)).unwrap();
    }

    #[test]
    fn head_line_reaches_the_oldest_snapshot() {
        let temp = tempfile::tempdir().unwrap();
        spanning_history(temp.path());
        let repo = open_repository(temp.path()).unwrap();
        assert_eq!(head_line(&repo, &inbox()).unwrap().len(), 3);
    }

    #[test]
    fn head_line_reports_damaged_commits() {
        let temp = tempfile::tempdir().unwrap();
        spanning_history(temp.path());

        // Flip a timestamp byte of the first commit in generation 0.
        let log = temp.path().join("inbox").join("g000000.log");
        let mut bytes = fs::read(&log).unwrap();
        let start = bytes.windows(4).position(|w| w == b"TCMT").unwrap();
        bytes[start + 10] ^= 0x01;
        fs::write(&log, bytes).unwrap();

        let repo = open_repository(temp.path()).unwrap();
        assert!(matches!(
            head_line(&repo, &inbox()),
            Err(CliError::Core(CoreError::CorruptCommit { .. }))
        ));
    }
}
