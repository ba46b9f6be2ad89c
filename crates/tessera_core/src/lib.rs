//! # Tessera Core
//!
//! Partitioned, append-only, versioned storage engine.
//!
//! This crate provides:
//! - Partition addressing through an ordered classifier chain
//! - Log files with a fixed slot header and an atomic publish word
//! - Content-addressed commits forming a history DAG
//! - Pyramid state checksums, maintained incrementally
//! - Three-way merges with pluggable conflict resolvers
//! - Deterministic compaction of history into retention points
//!
//! ## Example
//!
//! ```rust,ignore
//! use tessera_core::{Change, Config, ElementId, Payload, PartitionId, Repository};
//!
//! let repo = Repository::in_memory(Config::default())?;
//! let inbox = PartitionId::new("inbox")?;
//! repo.create_partition(&inbox)?;
//! let id = ElementId::new();
//! let head = repo.append(&inbox, None, vec![Change::Put(id, Payload::new().with("subject", "hi"))])?;
//! assert_eq!(repo.head(&inbox)?, Some(head));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod addressing;
mod cancel;
pub mod checksum;
mod clock;
pub(crate) mod codec;
pub mod commit;
pub mod compaction;
mod config;
#[cfg(feature = "std")]
mod dir;
mod error;
pub mod layout;
pub mod merge;
pub mod partition;
mod payload;
mod repository;
mod types;

pub use addressing::{Classifier, ClassifierChain, Fallback, FieldClassifier, FileNames, FnClassifier};
pub use cancel::CancelToken;
pub use checksum::{Digest, DigestAlgorithm};
pub use clock::{Clock, ManualClock, SystemClock};
pub use commit::{Change, Commit, CommitId, CommitSource, State, Status};
pub use compaction::{RetentionPolicy, Tier};
pub use config::Config;
#[cfg(feature = "std")]
pub use dir::RepoDir;
pub use error::{CoreError, CoreResult};
pub use layout::Location;
pub use merge::{last_writer_wins, prefer_local, reject_all, MergeOutcome, MergeSide, Resolution};
pub use partition::{ElementVersion, ImportReport, Partition, Region, RegionReport, RegionStatus};
pub use payload::{Field, Payload, PayloadPatch};
pub use repository::{PartitionHandle, Repository};
pub use types::{ElementId, PartitionId, Timestamp};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
