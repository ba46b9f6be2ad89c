//! The commit DAG.
//!
//! Commits form a directed acyclic graph through their parent ids. The
//! graph only stores ids and parent lists; commit bodies live with the
//! partition that loaded them.

use super::record::CommitId;
use std::collections::{HashMap, HashSet, VecDeque};

/// Parent links of every locally known commit.
#[derive(Debug, Clone, Default)]
pub struct CommitGraph {
    parents: HashMap<CommitId, Vec<CommitId>>,
}

impl CommitGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a commit and its parents.
    pub fn insert(&mut self, id: CommitId, parents: Vec<CommitId>) {
        self.parents.insert(id, parents);
    }

    /// Returns true if the commit is known.
    #[must_use]
    pub fn contains(&self, id: &CommitId) -> bool {
        self.parents.contains_key(id)
    }

    /// Returns the parents of a known commit.
    #[must_use]
    pub fn parents(&self, id: &CommitId) -> Option<&[CommitId]> {
        self.parents.get(id).map(Vec::as_slice)
    }

    /// Returns the number of known commits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.parents.len()
    }

    /// Returns true if no commit is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    /// Returns every ancestor of `id`, including itself.
    #[must_use]
    pub fn ancestors(&self, id: CommitId) -> HashSet<CommitId> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([id]);
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next) {
                continue;
            }
            if let Some(parents) = self.parents(&next) {
                queue.extend(parents.iter().copied());
            }
        }
        seen
    }

    /// Returns true if `ancestor` is reachable from `descendant`.
    #[must_use]
    pub fn is_ancestor(&self, ancestor: &CommitId, descendant: CommitId) -> bool {
        self.ancestors(descendant).contains(ancestor)
    }

    /// Finds the nearest common ancestor of `a` and `b`.
    ///
    /// All ancestors of `a` are collected first; then a breadth-first
    /// search from `b` returns the first commit in that set, which is the
    /// common ancestor closest to `b`. Parents are visited in stored order,
    /// so the answer is deterministic.
    #[must_use]
    pub fn common_ancestor(&self, a: CommitId, b: CommitId) -> Option<CommitId> {
        let from_a = self.ancestors(a);
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([b]);
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next) {
                continue;
            }
            if from_a.contains(&next) && self.contains(&next) {
                return Some(next);
            }
            if let Some(parents) = self.parents(&next) {
                queue.extend(parents.iter().copied());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::DigestAlgorithm;

    fn c(name: &str) -> CommitId {
        DigestAlgorithm::Sha256.digest(name.as_bytes())
    }

    //   root - a1 - a2        (a)
    //      \
    //       b1 - b2           (b)
    fn forked() -> CommitGraph {
        let mut g = CommitGraph::new();
        g.insert(c("root"), vec![]);
        g.insert(c("a1"), vec![c("root")]);
        g.insert(c("a2"), vec![c("a1")]);
        g.insert(c("b1"), vec![c("root")]);
        g.insert(c("b2"), vec![c("b1")]);
        g
    }

    #[test]
    fn common_ancestor_of_fork() {
        let g = forked();
        assert_eq!(g.common_ancestor(c("a2"), c("b2")), Some(c("root")));
        assert_eq!(g.common_ancestor(c("a2"), c("a1")), Some(c("a1")));
    }

    #[test]
    fn merge_commit_shortens_ancestor_distance() {
        let mut g = forked();
        g.insert(c("m"), vec![c("a2"), c("b1")]);
        g.insert(c("b3"), vec![c("b2")]);
        assert_eq!(g.common_ancestor(c("m"), c("b3")), Some(c("b1")));
    }

    #[test]
    fn unrelated_histories_have_no_ancestor() {
        let mut g = forked();
        g.insert(c("other"), vec![]);
        assert_eq!(g.common_ancestor(c("a2"), c("other")), None);
    }

    #[test]
    fn ancestry() {
        let g = forked();
        assert!(g.is_ancestor(&c("root"), c("b2")));
        assert!(!g.is_ancestor(&c("a1"), c("b2")));
    }
}
