//! Core type definitions for Tessera.

use crate::error::{CoreError, CoreResult};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Unique identifier for an element.
///
/// Element IDs are 128-bit UUIDs that are:
/// - Globally unique within a partition namespace
/// - Immutable once assigned
/// - Never reused, even after deletion
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ElementId([u8; 16]);

impl ElementId {
    /// Creates an element ID from raw bytes.
    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Creates a new random element ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    /// Returns the raw bytes.
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Converts to a UUID.
    #[must_use]
    pub fn to_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.0)
    }

    /// Creates an element ID from a slice.
    ///
    /// Returns `None` if the slice is not exactly 16 bytes.
    #[must_use]
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        <[u8; 16]>::try_from(slice).ok().map(Self)
    }
}

impl Default for ElementId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ElementId({})", self.to_uuid())
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_uuid())
    }
}

impl std::str::FromStr for ElementId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(|uuid| Self(uuid.into_bytes()))
            .map_err(|e| CoreError::invalid_argument(format!("invalid element id {s:?}: {e}")))
    }
}

/// Identifier of a partition.
///
/// Partition IDs double as directory names, so they are restricted to
/// 1-64 characters of `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionId(String);

impl PartitionId {
    /// Maximum length of a partition name.
    pub const MAX_LEN: usize = 64;

    /// Creates a partition ID, validating the name.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the name is empty, too long, or
    /// contains characters other than ASCII alphanumerics, `_` and `-`.
    pub fn new(name: impl Into<String>) -> CoreResult<Self> {
        let name = name.into();
        let valid = !name.is_empty()
            && name.len() <= Self::MAX_LEN
            && name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if !valid {
            return Err(CoreError::configuration(format!(
                "invalid partition id {name:?}"
            )));
        }
        Ok(Self(name))
    }

    /// Returns the name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(i64);

impl Timestamp {
    /// One second.
    pub const SECOND: i64 = 1000;
    /// One day.
    pub const DAY: i64 = 24 * 60 * 60 * Self::SECOND;

    /// Creates a timestamp from milliseconds since the epoch.
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0);
        Self(millis)
    }

    /// Returns milliseconds since the epoch.
    #[must_use]
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Returns this timestamp shifted by `millis`.
    #[must_use]
    pub const fn plus_millis(self, millis: i64) -> Self {
        Self(self.0.saturating_add(millis))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_ids_are_unique() {
        assert_ne!(ElementId::new(), ElementId::new());
    }

    #[test]
    fn element_id_from_slice() {
        let id = ElementId::from_bytes([7; 16]);
        assert_eq!(ElementId::from_slice(&[7; 16]), Some(id));
        assert_eq!(ElementId::from_slice(&[7; 15]), None);
    }

    #[test]
    fn element_id_parses_its_display_form() {
        let id = ElementId::new();
        assert_eq!(id.to_string().parse::<ElementId>().unwrap(), id);
        assert!("not-a-uuid".parse::<ElementId>().is_err());
    }

    #[test]
    fn partition_id_validation() {
        assert!(PartitionId::new("inbox").is_ok());
        assert!(PartitionId::new("archive-2015_q3").is_ok());
        assert!(PartitionId::new("").is_err());
        assert!(PartitionId::new("a/b").is_err());
        assert!(PartitionId::new("..").is_err());
        assert!(PartitionId::new("x".repeat(65)).is_err());
    }

    #[test]
    fn timestamp_ordering() {
        let t = Timestamp::from_millis(1_000);
        assert!(t < t.plus_millis(1));
        assert_eq!(format!("{t}"), "t:1000");
    }
}
