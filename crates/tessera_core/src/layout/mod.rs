//! File layout engine.
//!
//! Each partition is a set of generations. A generation is a snapshot file
//! (the full state at some commit) and a log file (a fixed header of
//! element slots followed by appended commit blocks). Existing bytes are
//! never rewritten except for the 8-byte header words.
//!
//! ```text
//! <partition>/
//! ├─ CURRENT          # active generation number, replaced atomically
//! ├─ g000000.snap     # snapshot of generation 0 (the empty state)
//! ├─ g000000.log      # header + blocks of generation 0
//! ├─ g000001.snap
//! └─ g000001.log
//! ```

mod block;
mod files;
mod header;
mod log;
mod snapshot;

pub use block::{Block, Link, BLOCK_FLAG_MAINLINE, BLOCK_MAGIC};
pub use files::PartitionFiles;
pub use header::{
    Header, FLAG_NEEDS_REPAIR, HEADER_FIXED, HEADER_MAGIC, HEADER_VERSION, SLOT_EMPTY,
    SLOT_IN_SNAPSHOT, SLOT_SIZE, TIP_POSITION,
};
pub use log::{LogFile, LogScan, ScannedBlock};
pub use snapshot::{Snapshot, SNAPSHOT_MAGIC, SNAPSHOT_VERSION};

/// Where the latest version of an element is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// In the snapshot of the given generation.
    Snapshot {
        /// Generation of the snapshot.
        generation: u64,
    },
    /// In the block at `offset` of the given generation's log.
    Block {
        /// Generation of the log.
        generation: u64,
        /// Offset of the block.
        offset: u64,
    },
}
