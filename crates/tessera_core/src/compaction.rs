//! Deterministic history folding.
//!
//! A [`RetentionPolicy`] assigns every commit a bucket from its timestamp
//! and its age relative to a fixed reference time. A commit is a retention
//! point iff no later commit of the chain falls into the same bucket, so
//! the newest commit of every bucket survives. The predicate depends only
//! on the full chain, which makes compaction idempotent and independent of
//! how the chain is split into passes.
//!
//! Commits up to the first dropped one are kept byte for byte. Every
//! retained commit after it is rebuilt as the net change between the state
//! at the previous retained commit and its own state.

use crate::cancel::CancelToken;
use crate::checksum::DigestAlgorithm;
use crate::commit::{Commit, CommitDraft, CommitId, State};
use crate::error::{CoreError, CoreResult};
use crate::types::Timestamp;
use std::ops::Range;
use tracing::debug;

/// One age band of a retention policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tier {
    /// Commits younger than this many milliseconds fall into this tier;
    /// `None` for the last, unbounded tier.
    pub max_age: Option<i64>,
    /// Bucket width in milliseconds; 0 keeps every commit.
    pub width: i64,
}

/// Which commits survive compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Reference time ages are measured from.
    pub as_of: Timestamp,
    /// Tiers in increasing `max_age` order.
    pub tiers: Vec<Tier>,
}

/// Bucket a commit falls into: tier index plus either a time slot or, for
/// zero-width tiers, the commit's own position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Bucket {
    Slot(usize, i64),
    Own(usize),
}

impl RetentionPolicy {
    /// The default tiers measured from `as_of`: everything within a day,
    /// then daily within a week, weekly within 30 days, monthly within a
    /// year and yearly beyond.
    #[must_use]
    pub fn new(as_of: Timestamp) -> Self {
        const DAY: i64 = Timestamp::DAY;
        Self {
            as_of,
            tiers: vec![
                Tier { max_age: Some(DAY), width: 0 },
                Tier { max_age: Some(7 * DAY), width: DAY },
                Tier { max_age: Some(30 * DAY), width: 7 * DAY },
                Tier { max_age: Some(365 * DAY), width: 30 * DAY },
                Tier { max_age: None, width: 365 * DAY },
            ],
        }
    }

    /// Uses custom tiers.
    #[must_use]
    pub fn with_tiers(mut self, tiers: Vec<Tier>) -> Self {
        self.tiers = tiers;
        self
    }

    fn bucket(&self, position: usize, timestamp: Timestamp) -> Bucket {
        let age = self.as_of.as_millis().saturating_sub(timestamp.as_millis());
        let tier = self
            .tiers
            .iter()
            .position(|t| t.max_age.map_or(true, |max| age < max))
            .unwrap_or(self.tiers.len());
        match self.tiers.get(tier) {
            Some(t) if t.width > 0 => Bucket::Slot(tier, timestamp.as_millis().div_euclid(t.width)),
            _ => Bucket::Own(position),
        }
    }

    /// Returns, for each timestamp of a chain (oldest first), whether that
    /// commit is a retention point.
    #[must_use]
    pub fn retained(&self, timestamps: &[Timestamp]) -> Vec<bool> {
        let mut seen = std::collections::HashSet::new();
        let mut keep = vec![false; timestamps.len()];
        for (position, ts) in timestamps.iter().enumerate().rev() {
            keep[position] = seen.insert(self.bucket(position, *ts));
        }
        keep
    }
}

/// A rebuilt commit and its record bytes.
#[derive(Debug, Clone)]
pub struct SealedCommit {
    /// The commit.
    pub commit: Commit,
    /// Its serialized record.
    pub record: Vec<u8>,
}

/// Parameters shared by compaction passes.
#[derive(Debug, Clone, Copy)]
pub struct CompactionParams {
    /// Digest algorithm of the partition.
    pub algorithm: DigestAlgorithm,
    /// Patch threshold for rebuilt changes.
    pub patch_ratio: f64,
}

/// Compacts a whole chain. See [`compact_range`].
///
/// # Errors
///
/// See [`compact_range`].
pub fn compact(
    base: &State,
    chain: &[Commit],
    policy: &RetentionPolicy,
    params: CompactionParams,
    cancel: &CancelToken,
) -> CoreResult<Vec<SealedCommit>> {
    compact_range(base, chain, 0..chain.len(), policy, params, cancel)
}

/// Compacts `chain`, a first-parent line of commits (oldest first) that
/// starts at the state `base`, dropping only non-retained commits whose
/// position lies in `range`.
///
/// # Errors
///
/// Returns `InvalidArgument` if the chain is not linked through first
/// parents, `Cancelled` if cancelled, or an error from replaying a change.
pub fn compact_range(
    base: &State,
    chain: &[Commit],
    range: Range<usize>,
    policy: &RetentionPolicy,
    params: CompactionParams,
    cancel: &CancelToken,
) -> CoreResult<Vec<SealedCommit>> {
    for pair in chain.windows(2) {
        if pair[1].first_parent() != Some(pair[0].id) {
            return Err(CoreError::invalid_argument(format!(
                "commit {} does not follow {}",
                pair[1].id.short(),
                pair[0].id.short()
            )));
        }
    }

    let timestamps: Vec<Timestamp> = chain.iter().map(|c| c.timestamp).collect();
    let retained = policy.retained(&timestamps);
    let keep: Vec<bool> = retained
        .iter()
        .enumerate()
        .map(|(i, r)| *r || !range.contains(&i))
        .collect();

    let mut out = Vec::with_capacity(chain.len());
    let mut state = base.clone();
    let mut kept_state = base.clone();
    let mut previous: Option<CommitId> = chain.first().and_then(Commit::first_parent);
    let mut rewriting = false;

    for (commit, keep) in chain.iter().zip(keep) {
        cancel.check()?;
        state.apply_commit(params.algorithm, commit)?;
        if !keep {
            rewriting = true;
            continue;
        }
        let sealed = if rewriting {
            let mut parents: Vec<CommitId> = previous.into_iter().collect();
            parents.extend(commit.parents.iter().skip(1).copied());
            let (commit, record) = CommitDraft {
                parents,
                timestamp: commit.timestamp,
                branch: commit.branch.clone(),
                state_checksum: commit.state_checksum,
                changes: kept_state.changes_to(&state, params.patch_ratio)?,
                rejected: commit.rejected.clone(),
            }
            .seal(params.algorithm)?;
            SealedCommit { commit, record }
        } else {
            SealedCommit {
                record: commit.encode()?,
                commit: commit.clone(),
            }
        };
        previous = Some(sealed.commit.id);
        kept_state = state.clone();
        out.push(sealed);
    }

    debug!(
        input = chain.len(),
        output = out.len(),
        "compacted commit chain"
    );
    Ok(out)
}
