//! Element payloads and the patches between them.
//!
//! A payload is an ordered key-value map. Keys are kept in a `BTreeMap`,
//! so the CBOR encoding of equal payloads is always byte-identical, which
//! the item checksums rely on.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A single payload value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Field {
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl Field {
    /// Returns the text value, if this is a text field.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer value, if this is an integer field.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<bool> for Field {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Field {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for Field {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Field {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for Field {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

fn to_cbor<T: Serialize>(value: &T) -> CoreResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|e| CoreError::encoding(e.to_string()))?;
    Ok(buf)
}

fn from_cbor<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> CoreResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| CoreError::encoding(e.to_string()))
}

/// The value of an element.
///
/// # Example
///
/// ```rust
/// use tessera_core::Payload;
///
/// let mail = Payload::new()
///     .with("subject", "hello")
///     .with("unread", true);
/// let bytes = mail.encode().unwrap();
/// assert_eq!(Payload::decode(&bytes).unwrap(), mail);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(BTreeMap<String, Field>);

impl Payload {
    /// Creates an empty payload.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the payload with `key` set to `value`.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Field>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Sets `key` to `value`, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Field>) -> Option<Field> {
        self.0.insert(key.into(), value.into())
    }

    /// Removes `key`.
    pub fn remove(&mut self, key: &str) -> Option<Field> {
        self.0.remove(key)
    }

    /// Returns the value of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Field> {
        self.0.get(key)
    }

    /// Returns the text value of `key`.
    #[must_use]
    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Field::as_text)
    }

    /// Iterates over fields in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Field)> {
        self.0.iter()
    }

    /// Returns the number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serializes to canonical CBOR.
    ///
    /// # Errors
    ///
    /// Returns an encoding error if serialization fails.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Deserializes from CBOR.
    ///
    /// # Errors
    ///
    /// Returns an encoding error if the bytes are not a payload.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        from_cbor(bytes)
    }
}

impl FromIterator<(String, Field)> for Payload {
    fn from_iter<I: IntoIterator<Item = (String, Field)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Difference between two payloads: fields to set and fields to drop.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PayloadPatch {
    /// Fields whose value changed or that were added.
    pub set: BTreeMap<String, Field>,
    /// Fields that were removed.
    pub unset: BTreeSet<String>,
}

impl PayloadPatch {
    /// Computes the patch turning `old` into `new`.
    #[must_use]
    pub fn diff(old: &Payload, new: &Payload) -> Self {
        let set = new
            .0
            .iter()
            .filter(|(k, v)| old.0.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let unset = old
            .0
            .keys()
            .filter(|k| !new.0.contains_key(*k))
            .cloned()
            .collect();
        Self { set, unset }
    }

    /// Applies the patch to `base`.
    #[must_use]
    pub fn apply(&self, base: &Payload) -> Payload {
        let mut out = base.clone();
        for key in &self.unset {
            out.0.remove(key);
        }
        for (key, value) in &self.set {
            out.0.insert(key.clone(), value.clone());
        }
        out
    }

    /// Returns true if the patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }

    /// Serializes to CBOR.
    ///
    /// # Errors
    ///
    /// Returns an encoding error if serialization fails.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Deserializes from CBOR.
    ///
    /// # Errors
    ///
    /// Returns an encoding error if the bytes are not a patch.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        from_cbor(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn encoding_is_key_ordered() {
        let a = Payload::new().with("b", 1i64).with("a", 2i64);
        let b = Payload::new().with("a", 2i64).with("b", 1i64);
        assert_eq!(a.encode().unwrap(), b.encode().unwrap());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Payload::decode(&[0xff, 0x00]).is_err());
    }

    #[test]
    fn patch_tracks_set_and_unset() {
        let old = Payload::new().with("subject", "hi").with("unread", true);
        let new = Payload::new().with("subject", "hi").with("flag", "red");
        let patch = PayloadPatch::diff(&old, &new);
        assert_eq!(patch.set.len(), 1);
        assert!(patch.unset.contains("unread"));
        assert_eq!(patch.apply(&old), new);
        assert!(PayloadPatch::diff(&new, &new).is_empty());
    }

    fn field() -> impl Strategy<Value = Field> {
        prop_oneof![
            Just(Field::Null),
            any::<bool>().prop_map(Field::Bool),
            any::<i64>().prop_map(Field::Int),
            "[a-z]{0,8}".prop_map(Field::Text),
        ]
    }

    fn payload() -> impl Strategy<Value = Payload> {
        prop::collection::btree_map("[a-e]", field(), 0..5).prop_map(Payload)
    }

    proptest! {
        #[test]
        fn diff_then_apply_reproduces_target(old in payload(), new in payload()) {
            let patch = PayloadPatch::diff(&old, &new);
            prop_assert_eq!(patch.apply(&old), new);
            let decoded = PayloadPatch::decode(&patch.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded, patch);
        }
    }
}
