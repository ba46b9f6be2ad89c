//! CLI command implementations.

pub mod compact;
pub mod dump;
pub mod history;
pub mod inspect;
pub mod snapshot;
pub mod verify;

use clap::ValueEnum;
use std::path::{Path, PathBuf};
use tessera_core::{CoreError, PartitionId, Repository};
use thiserror::Error;

/// Errors reported by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// A command needs `--path`.
    #[error("repository path required for {0}")]
    MissingPath(&'static str),

    /// The path does not hold a repository.
    #[error("no repository found at {}", .0.display())]
    NotARepository(PathBuf),

    /// Verification found damaged regions.
    #[error("verification failed: {damaged} damaged region(s)")]
    VerificationFailed {
        /// Number of damaged regions.
        damaged: usize,
    },

    /// Engine error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Storage error outside the engine.
    #[error(transparent)]
    Storage(#[from] tessera_storage::StorageError),

    /// JSON output failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Output format of reporting commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// Opens an existing repository, never creating one.
pub fn open_repository(path: &Path) -> Result<Repository, CliError> {
    if !path.is_dir() {
        return Err(CliError::NotARepository(path.to_path_buf()));
    }
    Ok(Repository::open(path)?)
}

/// Resolves `--partition` or falls back to every stored partition.
pub fn select_partitions(
    repo: &Repository,
    partition: Option<&str>,
) -> Result<Vec<PartitionId>, CliError> {
    match partition {
        Some(name) => Ok(vec![PartitionId::new(name)?]),
        None => Ok(repo.stored_partitions()?),
    }
}
