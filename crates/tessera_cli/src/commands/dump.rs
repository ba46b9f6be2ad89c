//! Dump command implementation.
//!
//! Reads a partition log straight from disk without taking the repository
//! lock, so it also works on partitions that fail to open.

use super::{CliError, OutputFormat};
use serde::Serialize;
use std::path::Path;
use tessera_core::commit::{ChangeKind, Commit};
use tessera_core::layout::{LogScan, PartitionFiles};
use tessera_core::{CoreError, FileNames, PartitionId};
use tessera_storage::{DirStore, FileStore};

/// One dumped block.
#[derive(Debug, Serialize)]
pub struct BlockDump {
    /// File offset.
    pub offset: u64,
    /// Block length.
    pub len: u64,
    /// Whether the block is on the replica's own line of history.
    pub mainline: bool,
    /// Commit id stored in the record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    /// Whether the stored id matches the content.
    pub intact: bool,
    /// Parent ids.
    pub parents: Vec<String>,
    /// Commit timestamp in milliseconds.
    pub timestamp: i64,
    /// Branch tag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// One line per item change.
    pub changes: Vec<String>,
    /// Number of rejected merge candidates.
    pub rejected: usize,
    /// Why the record could not be parsed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn describe_change(kind: &ChangeKind) -> String {
    match kind {
        ChangeKind::FullState(payload) => format!("full ({} fields)", payload.len()),
        ChangeKind::Patch(_) => "patch".to_string(),
        ChangeKind::Deletion => "delete".to_string(),
        ChangeKind::MovedTo(destination) => format!("moved to {destination}"),
        ChangeKind::MovedFrom { source, .. } => format!("moved from {source}"),
    }
}

fn dump_commit(offset: u64, len: u64, mainline: bool, commit: &Commit, intact: bool) -> BlockDump {
    BlockDump {
        offset,
        len,
        mainline,
        commit: Some(commit.id.to_hex()),
        intact,
        parents: commit.parents.iter().map(|p| p.to_hex()).collect(),
        timestamp: commit.timestamp.as_millis(),
        branch: commit.branch.clone(),
        changes: commit
            .changes
            .iter()
            .map(|c| format!("{} {}", c.element, describe_change(&c.kind)))
            .collect(),
        rejected: commit.rejected.len(),
        error: None,
    }
}

/// Runs the dump command.
pub fn run(
    path: &Path,
    partition: &str,
    generation: Option<u64>,
    limit: Option<usize>,
    format: OutputFormat,
) -> Result<(), CliError> {
    if !path.is_dir() {
        return Err(CliError::NotARepository(path.to_path_buf()));
    }
    let id = PartitionId::new(partition)?;
    let store = DirStore::new(path)?;
    let names = FileNames::for_partition(&id);
    let files = PartitionFiles::new(std::sync::Arc::new(store.clone()), names.clone());
    let generation = match generation {
        Some(g) => g,
        None => files
            .current()?
            .ok_or_else(|| CoreError::not_found(format!("partition {id}")))?,
    };
    if !store.exists(&names.log(generation))? {
        return Err(CoreError::not_found(format!("generation {generation} of {id}")).into());
    }
    let backend = store.open(&names.log(generation))?;
    let scan = LogScan::read(backend.as_ref())?;
    let algorithm = scan.header.algorithm;

    let blocks: Vec<BlockDump> = scan
        .blocks
        .iter()
        .take(limit.unwrap_or(usize::MAX))
        .map(|b| match Commit::parse(&b.block.record, algorithm) {
            Ok(parsed) => {
                let intact = parsed.is_intact();
                dump_commit(b.offset, b.len, b.block.mainline, &parsed.commit, intact)
            }
            Err(e) => BlockDump {
                offset: b.offset,
                len: b.len,
                mainline: b.block.mainline,
                commit: None,
                intact: false,
                parents: Vec::new(),
                timestamp: 0,
                branch: None,
                changes: Vec::new(),
                rejected: 0,
                error: Some(e.to_string()),
            },
        })
        .collect();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&blocks)?),
        OutputFormat::Text => {
            println!(
                "{id} g{generation:06}: {} blocks, {} published bytes, {} on disk, algorithm {algorithm}",
                scan.blocks.len(),
                scan.end,
                scan.size
            );
            for block in &blocks {
                print_block(block);
            }
            if let Some((offset, message)) = &scan.broken {
                println!("@{offset}: broken framing: {message}");
            }
        }
    }
    Ok(())
}

fn print_block(block: &BlockDump) {
    let marker = if block.mainline { "main" } else { "import" };
    match (&block.commit, &block.error) {
        (Some(commit), _) => {
            let flag = if block.intact { "" } else { " CORRUPT" };
            println!(
                "@{} [{marker}] commit {}{flag} t={} parents={}",
                block.offset,
                &commit[..12.min(commit.len())],
                block.timestamp,
                block.parents.len()
            );
            if let Some(branch) = &block.branch {
                println!("    branch {branch}");
            }
            for change in &block.changes {
                println!("    {change}");
            }
            if block.rejected > 0 {
                println!("    {} rejected", block.rejected);
            }
        }
        (None, error) => {
            println!(
                "@{} [{marker}] unreadable record: {}",
                block.offset,
                error.as_deref().unwrap_or("unknown")
            );
        }
    }
}
