//! Pyramid reduction of item checksums.
//!
//! Level 0 holds the leaves (item checksums in element-id order). Each
//! higher level holds one digest per group of `group_size` digests below
//! it. The top level always has exactly one digest, and at least one
//! reduction is applied even for a single leaf.

use super::{Digest, DigestAlgorithm};

/// A state checksum with every intermediate level retained.
#[derive(Debug, Clone)]
pub struct Pyramid {
    algorithm: DigestAlgorithm,
    group: usize,
    levels: Vec<Vec<Digest>>,
}

impl Pyramid {
    /// Builds a pyramid over `leaves`.
    ///
    /// `group_size` values below 2 are raised to 2.
    #[must_use]
    pub fn build(algorithm: DigestAlgorithm, group_size: usize, leaves: Vec<Digest>) -> Self {
        let mut pyramid = Self {
            algorithm,
            group: group_size.max(2),
            levels: vec![leaves],
        };
        pyramid.rebuild_from(0);
        pyramid
    }

    /// Returns the state checksum.
    #[must_use]
    pub fn root(&self) -> Digest {
        match self.levels.last() {
            Some(top) if self.levels.len() > 1 => top.first().copied().unwrap_or(Digest::ZERO),
            _ => self.algorithm.digest(b""),
        }
    }

    /// Returns the digest algorithm.
    #[must_use]
    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Returns the number of leaves.
    #[must_use]
    pub fn len(&self) -> usize {
        self.levels.first().map_or(0, Vec::len)
    }

    /// Returns true if there are no leaves.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of levels above the leaves.
    #[must_use]
    pub fn height(&self) -> usize {
        self.levels.len() - 1
    }

    /// Returns the leaf at `index`.
    #[must_use]
    pub fn leaf(&self, index: usize) -> Option<Digest> {
        self.levels.first().and_then(|l| l.get(index).copied())
    }

    /// Replaces the leaf at `index`, re-hashing only its branch.
    ///
    /// Out-of-range indices are ignored.
    pub fn update(&mut self, index: usize, digest: Digest) {
        if index >= self.len() {
            return;
        }
        self.levels[0][index] = digest;
        let mut idx = index;
        for level in 1..self.levels.len() {
            idx /= self.group;
            let below = &self.levels[level - 1];
            let start = idx * self.group;
            let end = (start + self.group).min(below.len());
            let hashed = self.hash_group(&below[start..end]);
            self.levels[level][idx] = hashed;
        }
    }

    /// Inserts a leaf before `index` (clamped to the end).
    pub fn insert(&mut self, index: usize, digest: Digest) {
        let index = index.min(self.len());
        self.levels[0].insert(index, digest);
        self.rebuild_from(index);
    }

    /// Removes the leaf at `index`. Out-of-range indices are ignored.
    pub fn remove(&mut self, index: usize) {
        if index >= self.len() {
            return;
        }
        self.levels[0].remove(index);
        self.rebuild_from(index);
    }

    fn hash_group(&self, group: &[Digest]) -> Digest {
        let mut hasher = self.algorithm.hasher();
        for digest in group {
            hasher.update(digest.as_bytes());
        }
        hasher.finalize()
    }

    /// Recomputes every group at or after the one containing `start`,
    /// keeping parent digests of untouched groups.
    fn rebuild_from(&mut self, start: usize) {
        let mut start = start;
        let mut level = 0;
        loop {
            if self.levels[level].is_empty() {
                self.levels.truncate(1);
                return;
            }
            let existing = self.levels.get(level + 1).map_or(0, Vec::len);
            let kept = (start / self.group).min(existing);

            let below = &self.levels[level];
            let fresh: Vec<Digest> = below[kept * self.group..]
                .chunks(self.group)
                .map(|chunk| self.hash_group(chunk))
                .collect();

            let mut next = self.levels.get(level + 1).map_or_else(Vec::new, |l| l[..kept].to_vec());
            next.extend(fresh);
            let done = next.len() == 1;

            if level + 1 < self.levels.len() {
                self.levels[level + 1] = next;
            } else {
                self.levels.push(next);
            }

            if done {
                self.levels.truncate(level + 2);
                return;
            }
            start = kept;
            level += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn leaves(n: usize) -> Vec<Digest> {
        (0..n)
            .map(|i| DigestAlgorithm::Sha256.digest(&(i as u64).to_le_bytes()))
            .collect()
    }

    #[test]
    fn height_grows_logarithmically() {
        let alg = DigestAlgorithm::Sha256;
        assert_eq!(Pyramid::build(alg, 4, leaves(0)).height(), 0);
        assert_eq!(Pyramid::build(alg, 4, leaves(1)).height(), 1);
        assert_eq!(Pyramid::build(alg, 4, leaves(4)).height(), 1);
        assert_eq!(Pyramid::build(alg, 4, leaves(5)).height(), 2);
        assert_eq!(Pyramid::build(alg, 4, leaves(16)).height(), 2);
        assert_eq!(Pyramid::build(alg, 4, leaves(17)).height(), 3);
    }

    #[test]
    fn update_matches_rebuild() {
        let alg = DigestAlgorithm::Blake3;
        let mut items = leaves(40);
        let mut pyramid = Pyramid::build(alg, 4, items.clone());
        let replacement = alg.digest(b"changed");
        items[17] = replacement;
        pyramid.update(17, replacement);
        assert_eq!(pyramid.root(), Pyramid::build(alg, 4, items).root());
    }

    #[test]
    fn removing_last_leaf_resets_to_empty() {
        let alg = DigestAlgorithm::Sha256;
        let mut pyramid = Pyramid::build(alg, 4, leaves(1));
        pyramid.remove(0);
        assert!(pyramid.is_empty());
        assert_eq!(pyramid.root(), alg.digest(b""));
    }

    proptest! {
        #[test]
        fn incremental_edits_match_full_rebuild(
            initial in 0usize..80,
            ops in prop::collection::vec((0u8..3, any::<usize>(), any::<u64>()), 0..40),
            group in 2usize..6,
        ) {
            let alg = DigestAlgorithm::Sha256;
            let mut items = leaves(initial);
            let mut pyramid = Pyramid::build(alg, group, items.clone());
            for (op, pos, seed) in ops {
                let digest = alg.digest(&seed.to_le_bytes());
                match op {
                    0 => {
                        let at = pos % (items.len() + 1);
                        items.insert(at, digest);
                        pyramid.insert(at, digest);
                    }
                    1 if !items.is_empty() => {
                        let at = pos % items.len();
                        items.remove(at);
                        pyramid.remove(at);
                    }
                    _ if !items.is_empty() => {
                        let at = pos % items.len();
                        items[at] = digest;
                        pyramid.update(at, digest);
                    }
                    _ => {}
                }
                prop_assert_eq!(pyramid.root(), Pyramid::build(alg, group, items.clone()).root());
            }
        }
    }
}
