//! History command implementation.

use super::{open_repository, CliError};
use std::path::Path;
use tessera_core::{ElementId, Location, PartitionId, Status};

/// Runs the history command.
pub fn run(path: &Path, partition: &str, element: &str) -> Result<(), CliError> {
    let repo = open_repository(path)?;
    let id = PartitionId::new(partition)?;
    let element: ElementId = element.parse()?;

    let versions = repo.history(&id, &element)?;
    if versions.is_empty() {
        println!("{element}: no versions in {id}");
        return Ok(());
    }
    println!("{element} in {id}, newest first:");
    for version in versions {
        let commit = version
            .commit
            .map_or_else(|| "(snapshot)".to_string(), |c| c.short());
        let location = match version.location {
            Location::Snapshot { generation } => format!("g{generation:06} snapshot"),
            Location::Block { generation, offset } => format!("g{generation:06} @{offset}"),
        };
        let status = match &version.status {
            Status::Live(entry) => format!("live ({} fields)", entry.payload.len()),
            Status::Moved(tombstone) => format!("moved to {}", tombstone.destination),
            Status::Absent => "deleted".to_string(),
        };
        println!("  {commit} t={} {location}: {status}", version.timestamp.as_millis());
    }
    Ok(())
}
