//! # Tessera Storage
//!
//! Byte-store backends for Tessera partitions.
//!
//! Backends are **opaque byte stores**: they know nothing about headers,
//! snapshots or commit blocks. The partition file format is owned entirely
//! by `tessera_core`.
//!
//! ## Design Principles
//!
//! - Backends append, read at an offset, and overwrite bytes that already
//!   exist (`write_at`); they never grow a file except through `append`
//! - A [`FileStore`] is a flat namespace of named backends, so a partition's
//!   files are located by name alone and never by scanning a directory
//! - Everything is `Send + Sync`
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] / [`MemoryStore`] - tests and ephemeral repositories
//! - [`FileBackend`] / [`DirStore`] - persistent storage on the OS file system
//!
//! ## Example
//!
//! ```rust
//! use tessera_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"hello world").unwrap();
//! backend.write_at(offset, b"HELLO").unwrap();
//! assert_eq!(backend.read_at(0, 11).unwrap(), b"HELLO world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;
mod store;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
pub use store::{DirStore, FileStore, MemoryStore};
