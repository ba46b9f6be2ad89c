//! Inspect command implementation.

use super::{open_repository, select_partitions, CliError, OutputFormat};
use serde::Serialize;
use std::path::Path;
use tessera_core::{PartitionId, Repository};

/// Repository inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Repository path.
    pub path: String,
    /// Per-partition summaries.
    pub partitions: Vec<PartitionSummary>,
}

/// Summary of one partition.
#[derive(Debug, Serialize)]
pub struct PartitionSummary {
    /// Partition id.
    pub id: String,
    /// Current generation.
    pub generation: u64,
    /// Digest algorithm.
    pub algorithm: String,
    /// Head commit, hex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<String>,
    /// Head timestamp in milliseconds.
    pub head_timestamp: i64,
    /// State checksum, hex.
    pub state_checksum: String,
    /// Live elements.
    pub live_elements: usize,
    /// Tombstoned (moved) elements.
    pub moved_elements: usize,
    /// Header slots in use.
    pub slots_used: usize,
    /// Header slot capacity.
    pub slots_capacity: u32,
    /// Published log bytes.
    pub log_bytes: u64,
    /// Commits known in the loaded generations.
    pub known_commits: usize,
}

fn summarize(repo: &Repository, id: &PartitionId) -> Result<PartitionSummary, CliError> {
    let handle = repo.open_partition(id)?;
    let partition = handle.read();
    let header = partition.log().header();
    Ok(PartitionSummary {
        id: id.to_string(),
        generation: partition.generation(),
        algorithm: partition.algorithm().to_string(),
        head: partition.head().map(|h| h.to_hex()),
        head_timestamp: partition.head_timestamp().as_millis(),
        state_checksum: partition.state_checksum().to_hex(),
        live_elements: partition.state().len(),
        moved_elements: partition.state().moved().count(),
        slots_used: header.used(),
        slots_capacity: header.capacity,
        log_bytes: partition.log().end(),
        known_commits: partition.known_commits(),
    })
}

/// Runs the inspect command.
pub fn run(path: &Path, partition: Option<&str>, format: OutputFormat) -> Result<(), CliError> {
    let repo = open_repository(path)?;
    let partitions = select_partitions(&repo, partition)?
        .iter()
        .map(|id| summarize(&repo, id))
        .collect::<Result<Vec<_>, _>>()?;
    let result = InspectResult {
        path: path.display().to_string(),
        partitions,
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Text => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("Repository: {}", result.path);
    println!("Partitions: {}", result.partitions.len());
    for p in &result.partitions {
        println!();
        println!("[{}]", p.id);
        println!("  Generation:     {}", p.generation);
        println!("  Algorithm:      {}", p.algorithm);
        println!("  Head:           {}", p.head.as_deref().unwrap_or("(none)"));
        println!("  Head time:      {}", p.head_timestamp);
        println!("  State checksum: {}", p.state_checksum);
        println!("  Live elements:  {}", p.live_elements);
        println!("  Moved elements: {}", p.moved_elements);
        println!("  Header slots:   {}/{}", p.slots_used, p.slots_capacity);
        println!("  Log bytes:      {}", p.log_bytes);
        println!("  Known commits:  {}", p.known_commits);
    }
}
