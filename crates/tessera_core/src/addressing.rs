//! Partition addressing.
//!
//! An element's partition is a pure function of its attributes, computed by
//! an ordered chain of classifiers. The first classifier with a definite
//! answer wins; when none answers, the fallback does. Re-partitioning means
//! putting a finer classifier at the front of the chain. Existing elements
//! stay where they are until moved explicitly.

use crate::error::{CoreError, CoreResult};
use crate::payload::Payload;
use crate::types::PartitionId;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Maps element attributes to a partition.
pub trait Classifier: fmt::Debug + Send + Sync {
    /// Returns the partition for `attributes`, or `None` to defer to the
    /// next classifier in the chain.
    fn classify(&self, attributes: &Payload) -> Option<PartitionId>;
}

/// Routes on the text value of one field.
#[derive(Debug, Clone)]
pub struct FieldClassifier {
    field: String,
    routes: BTreeMap<String, PartitionId>,
}

impl FieldClassifier {
    /// Creates a classifier reading `field`.
    #[must_use]
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            routes: BTreeMap::new(),
        }
    }

    /// Routes elements whose field equals `value` to `partition`.
    #[must_use]
    pub fn route(mut self, value: impl Into<String>, partition: PartitionId) -> Self {
        self.routes.insert(value.into(), partition);
        self
    }
}

impl Classifier for FieldClassifier {
    fn classify(&self, attributes: &Payload) -> Option<PartitionId> {
        attributes
            .text(&self.field)
            .and_then(|value| self.routes.get(value))
            .cloned()
    }
}

/// A classifier backed by a closure.
pub struct FnClassifier<F> {
    name: &'static str,
    f: F,
}

impl<F> FnClassifier<F>
where
    F: Fn(&Payload) -> Option<PartitionId> + Send + Sync,
{
    /// Wraps `f`. The name only appears in debug output.
    pub fn new(name: &'static str, f: F) -> Self {
        Self { name, f }
    }
}

impl<F> fmt::Debug for FnClassifier<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnClassifier").field("name", &self.name).finish()
    }
}

impl<F> Classifier for FnClassifier<F>
where
    F: Fn(&Payload) -> Option<PartitionId> + Send + Sync,
{
    fn classify(&self, attributes: &Payload) -> Option<PartitionId> {
        (self.f)(attributes)
    }
}

/// A classifier that always answers with one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fallback(pub PartitionId);

impl Classifier for Fallback {
    fn classify(&self, _attributes: &Payload) -> Option<PartitionId> {
        Some(self.0.clone())
    }
}

/// Ordered list of classifiers plus a fallback.
#[derive(Debug, Clone, Default)]
pub struct ClassifierChain {
    classifiers: Vec<Arc<dyn Classifier>>,
    fallback: Option<Fallback>,
}

impl ClassifierChain {
    /// Creates an empty chain with no fallback.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a chain that sends everything to `partition` unless a later
    /// registered classifier says otherwise.
    #[must_use]
    pub fn with_fallback(partition: PartitionId) -> Self {
        Self {
            classifiers: Vec::new(),
            fallback: Some(Fallback(partition)),
        }
    }

    /// Appends a classifier after the existing ones.
    pub fn push(&mut self, classifier: Arc<dyn Classifier>) {
        self.classifiers.push(classifier);
    }

    /// Inserts a classifier before all existing ones.
    pub fn register_front(&mut self, classifier: Arc<dyn Classifier>) {
        self.classifiers.insert(0, classifier);
    }

    /// Sets the fallback partition.
    pub fn set_fallback(&mut self, partition: PartitionId) {
        self.fallback = Some(Fallback(partition));
    }

    /// Returns the number of classifiers, not counting the fallback.
    #[must_use]
    pub fn len(&self) -> usize {
        self.classifiers.len()
    }

    /// Returns true if the chain has no classifiers besides the fallback.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classifiers.is_empty()
    }

    /// Resolves the partition for `attributes`.
    ///
    /// # Errors
    ///
    /// Returns `NoMatchingClassifier` if nothing matched and no fallback is
    /// registered.
    pub fn resolve(&self, attributes: &Payload) -> CoreResult<PartitionId> {
        self.classifiers
            .iter()
            .find_map(|c| c.classify(attributes))
            .or_else(|| self.fallback.as_ref().and_then(|f| f.classify(attributes)))
            .ok_or(CoreError::NoMatchingClassifier)
    }
}

/// Names of the files belonging to one partition.
///
/// Every name is derived from the partition id and a generation number, so
/// no directory listing is needed to find a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNames {
    partition: PartitionId,
}

impl FileNames {
    /// Names for `partition`.
    #[must_use]
    pub fn for_partition(partition: &PartitionId) -> Self {
        Self {
            partition: partition.clone(),
        }
    }

    /// The file holding the current generation number.
    #[must_use]
    pub fn current(&self) -> String {
        format!("{}/CURRENT", self.partition)
    }

    /// The snapshot of `generation`.
    #[must_use]
    pub fn snapshot(&self, generation: u64) -> String {
        format!("{}/g{generation:06}.snap", self.partition)
    }

    /// The log of `generation`.
    #[must_use]
    pub fn log(&self, generation: u64) -> String {
        format!("{}/g{generation:06}.log", self.partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(name: &str) -> PartitionId {
        PartitionId::new(name).unwrap()
    }

    #[test]
    fn first_definite_answer_wins() {
        let mut chain = ClassifierChain::with_fallback(pid("misc"));
        chain.push(Arc::new(FieldClassifier::new("kind").route("mail", pid("mail"))));
        chain.push(Arc::new(FnClassifier::new("everything", |_: &Payload| {
            Some(pid("catchall"))
        })));

        let mail = Payload::new().with("kind", "mail");
        let note = Payload::new().with("kind", "note");
        assert_eq!(chain.resolve(&mail).unwrap(), pid("mail"));
        assert_eq!(chain.resolve(&note).unwrap(), pid("catchall"));
    }

    #[test]
    fn fallback_answers_when_nothing_matches() {
        let mut chain = ClassifierChain::with_fallback(pid("misc"));
        chain.push(Arc::new(FieldClassifier::new("kind").route("mail", pid("mail"))));
        assert_eq!(chain.resolve(&Payload::new()).unwrap(), pid("misc"));
    }

    #[test]
    fn missing_fallback_is_an_error() {
        let chain = ClassifierChain::new();
        assert!(matches!(
            chain.resolve(&Payload::new()),
            Err(CoreError::NoMatchingClassifier)
        ));
    }

    #[test]
    fn register_front_refines_routing() {
        let mut chain = ClassifierChain::with_fallback(pid("mail"));
        let item = Payload::new().with("year", "2015");
        assert_eq!(chain.resolve(&item).unwrap(), pid("mail"));

        chain.register_front(Arc::new(
            FieldClassifier::new("year").route("2015", pid("mail-2015")),
        ));
        assert_eq!(chain.resolve(&item).unwrap(), pid("mail-2015"));
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn resolution_is_deterministic() {
        let mut chain = ClassifierChain::with_fallback(pid("misc"));
        chain.push(Arc::new(FieldClassifier::new("kind").route("mail", pid("mail"))));
        let item = Payload::new().with("kind", "mail");
        let first = chain.resolve(&item).unwrap();
        for _ in 0..10 {
            assert_eq!(chain.resolve(&item).unwrap(), first);
        }
    }

    #[test]
    fn file_names() {
        let names = FileNames::for_partition(&pid("inbox"));
        assert_eq!(names.current(), "inbox/CURRENT");
        assert_eq!(names.snapshot(3), "inbox/g000003.snap");
        assert_eq!(names.log(12), "inbox/g000012.log");
    }
}
