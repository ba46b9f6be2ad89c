//! Checksum engine.
//!
//! Every stored payload carries an *item checksum*; every commit carries a
//! *state checksum* of the full state it produces. The state checksum is a
//! pyramid reduction of the item checksums in element-id order, so a single
//! changed element only re-hashes one branch of the pyramid.
//!
//! The digest algorithm is fixed per partition and recorded in every file.

mod crc;
mod pyramid;

pub use crc::{crc32, Crc32};
pub use pyramid::Pyramid;

use crate::types::ElementId;
use sha2::{Digest as _, Sha256};
use std::fmt;

/// Default fan-in of the state checksum pyramid.
pub const DEFAULT_GROUP_SIZE: usize = 64;

/// A 256-bit digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Digest([u8; 32]);

impl Digest {
    /// The all-zero digest. Never produced by hashing; used as "no commit".
    pub const ZERO: Self = Self([0; 32]);

    /// Size of a digest in bytes.
    pub const LEN: usize = 32;

    /// Creates a digest from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns the full lowercase hex form.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Returns the first 8 hex digits, for logs and display.
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parses a 64-digit hex string.
    #[must_use]
    pub fn from_hex(text: &str) -> Option<Self> {
        let bytes = hex::decode(text).ok()?;
        <[u8; 32]>::try_from(bytes.as_slice()).ok().map(Self)
    }

    /// Returns true for [`Digest::ZERO`].
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 32]
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Hash function used for item, state and commit digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum DigestAlgorithm {
    /// SHA-256.
    #[default]
    Sha256 = 1,
    /// BLAKE3 in its default 256-bit mode.
    Blake3 = 2,
}

impl DigestAlgorithm {
    /// Every supported algorithm.
    pub const ALL: [Self; 2] = [Self::Sha256, Self::Blake3];

    /// Converts a stored byte to an algorithm.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Sha256),
            2 => Some(Self::Blake3),
            _ => None,
        }
    }

    /// Returns the stored byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Starts an incremental hash.
    #[must_use]
    pub fn hasher(self) -> Hasher {
        match self {
            Self::Sha256 => Hasher::Sha256(Sha256::new()),
            Self::Blake3 => Hasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    /// Hashes a single buffer.
    #[must_use]
    pub fn digest(self, data: &[u8]) -> Digest {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize()
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => f.write_str("sha256"),
            Self::Blake3 => f.write_str("blake3"),
        }
    }
}

/// An in-progress hash computation.
pub enum Hasher {
    /// SHA-256 state.
    Sha256(Sha256),
    /// BLAKE3 state.
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    /// Feeds bytes into the hash.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Blake3(h) => {
                h.update(data);
            }
        }
    }

    /// Finishes the hash.
    #[must_use]
    pub fn finalize(self) -> Digest {
        match self {
            Self::Sha256(h) => {
                let mut out = [0u8; 32];
                out.copy_from_slice(&h.finalize());
                Digest(out)
            }
            Self::Blake3(h) => Digest(*h.finalize().as_bytes()),
        }
    }
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256(_) => f.write_str("Hasher(sha256)"),
            Self::Blake3(_) => f.write_str("Hasher(blake3)"),
        }
    }
}

/// Computes the checksum of one element's payload.
///
/// The element id is hashed together with the encoded payload, so two
/// elements holding equal values still contribute distinct leaves.
#[must_use]
pub fn item_checksum(algorithm: DigestAlgorithm, id: &ElementId, payload: &[u8]) -> Digest {
    let mut hasher = algorithm.hasher();
    hasher.update(id.as_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Computes the state checksum of item checksums given in element-id order.
#[must_use]
pub fn state_checksum(algorithm: DigestAlgorithm, group_size: usize, items: &[Digest]) -> Digest {
    Pyramid::build(algorithm, group_size, items.to_vec()).root()
}
