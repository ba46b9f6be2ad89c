//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random test data that keeps the
//! invariants the engine requires: commits never name an element twice
//! and never delete an element that is not live.

use proptest::prelude::*;
use std::collections::BTreeMap;
use tessera_core::{Change, ElementId, Field, PartitionId, Payload};

/// Strategy for generating element IDs.
pub fn element_id_strategy() -> impl Strategy<Value = ElementId> {
    prop::array::uniform16(any::<u8>()).prop_map(ElementId::from_bytes)
}

/// Strategy for generating valid partition ids.
pub fn partition_id_strategy() -> impl Strategy<Value = PartitionId> {
    prop::string::string_regex("[a-z][a-z0-9_-]{0,15}")
        .expect("Invalid regex")
        .prop_map(|name| PartitionId::new(name).expect("regex yields valid ids"))
}

/// Strategy for generating a single field value.
pub fn field_strategy() -> impl Strategy<Value = Field> {
    prop_oneof![
        Just(Field::Null),
        any::<bool>().prop_map(Field::Bool),
        any::<i64>().prop_map(Field::Int),
        "[a-zA-Z0-9 ]{0,40}".prop_map(Field::Text),
        prop::collection::vec(any::<u8>(), 0..64).prop_map(Field::Bytes),
    ]
}

/// Strategy for generating payloads with up to `max_fields` fields drawn
/// from a small key set, so successive versions share keys and patches
/// get exercised.
pub fn payload_strategy(max_fields: usize) -> impl Strategy<Value = Payload> {
    prop::collection::vec(
        (
            prop::sample::select(vec!["subject", "from", "to", "body", "flags", "size"]),
            field_strategy(),
        ),
        0..=max_fields,
    )
    .prop_map(|fields| {
        fields
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect()
    })
}

/// One requested change against a fixed pool of elements.
#[derive(Debug, Clone)]
pub enum ChangeOp {
    /// Store a payload in the element at `slot`.
    Put {
        /// Index into the element pool.
        slot: usize,
        /// The payload.
        payload: Payload,
    },
    /// Delete the element at `slot`.
    Delete {
        /// Index into the element pool.
        slot: usize,
    },
}

/// Strategy for generating change operations over `pool` elements.
pub fn change_op_strategy(pool: usize) -> impl Strategy<Value = ChangeOp> {
    prop_oneof![
        3 => (0..pool, payload_strategy(4))
            .prop_map(|(slot, payload)| ChangeOp::Put { slot, payload }),
        1 => (0..pool).prop_map(|slot| ChangeOp::Delete { slot }),
    ]
}

/// Strategy for generating a script of commits, each a batch of change
/// operations.
pub fn commit_script_strategy(
    pool: usize,
    commits: std::ops::Range<usize>,
) -> impl Strategy<Value = Vec<Vec<ChangeOp>>> {
    prop::collection::vec(prop::collection::vec(change_op_strategy(pool), 1..5), commits)
}

/// Turns generated operations into valid changes while tracking the
/// expected state in a plain map.
#[derive(Debug, Clone)]
pub struct ScriptModel {
    pool: Vec<ElementId>,
    expected: BTreeMap<ElementId, Payload>,
}

impl ScriptModel {
    /// Creates a model over `pool` fresh element ids.
    pub fn new(pool: usize) -> Self {
        Self {
            pool: (0..pool).map(|_| ElementId::new()).collect(),
            expected: BTreeMap::new(),
        }
    }

    /// Converts one batch into changes and applies it to the model.
    ///
    /// Later operations on the same element win; deletions of elements
    /// that are not live are dropped, as are puts of an unchanged payload.
    pub fn changes(&mut self, ops: &[ChangeOp]) -> Vec<Change> {
        let mut last: BTreeMap<usize, &ChangeOp> = BTreeMap::new();
        for op in ops {
            let slot = match op {
                ChangeOp::Put { slot, .. } | ChangeOp::Delete { slot } => *slot,
            };
            last.insert(slot % self.pool.len(), op);
        }
        let mut out = Vec::new();
        for (slot, op) in last {
            let id = self.pool[slot];
            match op {
                ChangeOp::Put { payload, .. } => {
                    if self.expected.get(&id) != Some(payload) {
                        self.expected.insert(id, payload.clone());
                        out.push(Change::Put(id, payload.clone()));
                    }
                }
                ChangeOp::Delete { .. } => {
                    if self.expected.remove(&id).is_some() {
                        out.push(Change::Delete(id));
                    }
                }
            }
        }
        out
    }

    /// Returns the expected state.
    pub fn expected(&self) -> &BTreeMap<ElementId, Payload> {
        &self.expected
    }
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
