//! Snapshot command implementation.

use super::{open_repository, CliError};
use std::path::Path;
use tessera_core::PartitionId;

/// Runs the snapshot command.
pub fn run(path: &Path, partition: &str) -> Result<(), CliError> {
    let repo = open_repository(path)?;
    let id = PartitionId::new(partition)?;
    let generation = repo.snapshot(&id)?;
    println!("{id}: now at generation {generation}");
    Ok(())
}
