//! Open partitions.
//!
//! A [`Partition`] owns the active generation of one partition: its log,
//! its snapshot and the head state derived from them. Opening a partition
//! reads the snapshot, scans the log once and replays the head's
//! first-parent line from the snapshot base. Older generations are only
//! read when a lookup reaches past the active one.

use crate::cancel::CancelToken;
use crate::checksum::{item_checksum, Digest, DigestAlgorithm};
use crate::commit::{
    encode_update, Change, Commit, CommitDraft, CommitGraph, CommitId, Entry, ItemChange,
    RejectedChange, State, Status, TrackedState,
};
use crate::compaction::{self, CompactionParams, RetentionPolicy};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::layout::{Location, LogFile, LogScan, PartitionFiles, Snapshot, SLOT_IN_SNAPSHOT};
use crate::merge::{self, BranchHead, MergeOutcome, MergeSide, Resolution};
use crate::payload::Payload;
use crate::addressing::FileNames;
use crate::types::{ElementId, PartitionId, Timestamp};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tessera_storage::FileStore;
use tracing::{debug, info, warn};

/// Outcome of importing foreign commits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Commits appended as branch blocks.
    pub imported: Vec<CommitId>,
    /// Commits that were already known.
    pub skipped: Vec<CommitId>,
    /// Parents of imported commits that are not known locally.
    pub unresolved_parents: Vec<CommitId>,
}

/// A region of a partition's files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Region {
    /// The fixed header of a log.
    Header {
        /// Generation of the log.
        generation: u64,
    },
    /// A snapshot file.
    Snapshot {
        /// Generation of the snapshot.
        generation: u64,
    },
    /// A commit record.
    Commit {
        /// Generation of the log.
        generation: u64,
        /// Offset of the block holding the commit.
        offset: u64,
        /// Id stored in the record.
        id: CommitId,
    },
    /// A block whose framing could not be read.
    Block {
        /// Generation of the log.
        generation: u64,
        /// Offset of the block.
        offset: u64,
    },
    /// Bytes after the last published block.
    Tail {
        /// Generation of the log.
        generation: u64,
        /// Offset where the tail starts.
        offset: u64,
    },
}

/// Verification result for one region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionStatus {
    /// The region checks out.
    Ok,
    /// A commit's id does not match its content.
    CorruptCommit {
        /// What was found.
        message: String,
    },
    /// A snapshot failed its digest or checksums.
    CorruptSnapshot {
        /// What was found.
        message: String,
    },
    /// Bytes could not be framed.
    BadFraming {
        /// What was found.
        message: String,
    },
    /// Bytes written but never published; discarded on the next open.
    Unpublished {
        /// Number of bytes.
        bytes: u64,
    },
}

/// One line of a verification report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionReport {
    /// The region checked.
    pub region: Region,
    /// What was found.
    pub status: RegionStatus,
}

impl RegionReport {
    /// Returns true if the region checks out.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == RegionStatus::Ok
    }
}

/// One version of an element, as recorded in the active generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementVersion {
    /// Commit that produced the version; the snapshot base for a version
    /// carried in the snapshot.
    pub commit: Option<CommitId>,
    /// Timestamp of that commit.
    pub timestamp: Timestamp,
    /// Where the version is stored.
    pub location: Location,
    /// The element's status after the change.
    pub status: Status,
}

#[derive(Debug, Clone)]
struct CommitEntry {
    /// `None` if the stored record is corrupt and no alternate copy was found.
    commit: Option<Commit>,
    generation: u64,
    mainline: bool,
    seq: u64,
}

/// An open partition.
pub struct Partition {
    id: PartitionId,
    files: PartitionFiles,
    config: Arc<Config>,
    algorithm: DigestAlgorithm,
    generation: u64,
    log: LogFile,
    snapshot: Snapshot,
    bases: HashMap<CommitId, u64>,
    commits: HashMap<CommitId, CommitEntry>,
    graph: CommitGraph,
    head: Option<CommitId>,
    head_timestamp: Timestamp,
    state: TrackedState,
    commits_since_snapshot: u32,
    loaded_down_to: u64,
    next_seq: u64,
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("head", &self.head)
            .field("elements", &self.state.state().len())
            .finish_non_exhaustive()
    }
}

impl Partition {
    /// Creates a new, empty partition: generation 0 with an empty snapshot
    /// and an empty log.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the partition already exists, or a
    /// storage error.
    pub fn create(
        store: Arc<dyn FileStore>,
        id: PartitionId,
        config: Arc<Config>,
    ) -> CoreResult<Self> {
        let files = PartitionFiles::new(store, FileNames::for_partition(&id));
        if files.current()?.is_some() {
            return Err(CoreError::invalid_argument(format!(
                "partition {id} already exists"
            )));
        }
        let algorithm = config.algorithm.unwrap_or_default();
        let snapshot = Snapshot::empty(algorithm, config.group_size);
        files.write_snapshot(0, &snapshot.encode()?)?;
        LogFile::create(
            files.open_log(0)?,
            &id,
            algorithm,
            config.header_capacity,
            0,
            &[],
            config.sync_on_commit,
        )?;
        files.publish(0)?;
        info!(partition = %id, %algorithm, "created partition");
        Self::load(files, id, config, 0)
    }

    /// Opens an existing partition.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the partition does not exist,
    /// `AlgorithmMismatch` if the configuration requires a different digest
    /// algorithm than the partition was created with, `CorruptSnapshot`
    /// if the active snapshot is damaged and cannot be rebuilt from the
    /// previous generation, `CorruptCommit` if a commit needed to rebuild
    /// the head state is damaged and no alternate copy verifies, or a
    /// storage error.
    pub fn open(store: Arc<dyn FileStore>, id: PartitionId, config: Arc<Config>) -> CoreResult<Self> {
        let files = PartitionFiles::new(store, FileNames::for_partition(&id));
        let generation = files
            .current()?
            .ok_or_else(|| CoreError::not_found(format!("partition {id}")))?;
        Self::load(files, id, config, generation)
    }

    fn load(
        files: PartitionFiles,
        id: PartitionId,
        config: Arc<Config>,
        generation: u64,
    ) -> CoreResult<Self> {
        let (log, scan) = LogFile::open(
            files.open_existing_log(generation)?,
            &id,
            config.sync_on_commit,
        )?;
        let algorithm = log.header().algorithm;
        if let Some(expected) = config.algorithm.filter(|a| *a != algorithm) {
            return Err(CoreError::AlgorithmMismatch {
                expected,
                found: algorithm,
            });
        }

        let snapshot = match files
            .read_snapshot(generation)
            .and_then(|bytes| Snapshot::decode(&bytes, generation, Some(algorithm), config.group_size))
        {
            Ok(snapshot) => snapshot,
            Err(e @ CoreError::CorruptSnapshot { .. }) => {
                warn!(partition = %id, generation, error = %e, "snapshot damaged, rebuilding from previous generation");
                Self::rebuild_snapshot(&files, &id, &config, generation).map_err(|rebuild| {
                    debug!(partition = %id, error = %rebuild, "rebuild failed");
                    e
                })?
            }
            Err(e) => return Err(e),
        };

        let mut partition = Self {
            files,
            algorithm,
            generation,
            log,
            bases: HashMap::new(),
            commits: HashMap::new(),
            graph: CommitGraph::new(),
            head: snapshot.base,
            head_timestamp: snapshot.base_timestamp,
            state: TrackedState::new(snapshot.state.clone(), algorithm, config.group_size),
            snapshot,
            commits_since_snapshot: 0,
            loaded_down_to: generation,
            next_seq: 0,
            id,
            config,
        };
        if let Some(base) = partition.snapshot.base {
            partition.add_base(base, generation);
        }

        let (last_mainline, unreadable) = partition.register_scan(generation, &scan);
        if let Some(offset) = unreadable {
            return Err(CoreError::invalid_format(format!(
                "head commit record at offset {offset} of generation {generation} is unreadable"
            )));
        }
        if let Some(head) = last_mainline {
            partition.head = Some(head);
            partition.replay_head()?;
        }

        debug!(
            partition = %partition.id,
            generation,
            commits = partition.commits.len(),
            elements = partition.state.state().len(),
            "opened partition"
        );
        Ok(partition)
    }

    /// Rebuilds the snapshot of `generation` as the head state of the
    /// previous generation.
    fn rebuild_snapshot(
        files: &PartitionFiles,
        id: &PartitionId,
        config: &Arc<Config>,
        generation: u64,
    ) -> CoreResult<Snapshot> {
        if generation == 0 || !files.has_generation(generation - 1)? {
            return Err(CoreError::not_found(format!(
                "generation before {generation} of partition {id}"
            )));
        }
        let prior = Self::load(files.clone(), id.clone(), config.clone(), generation - 1)?;
        info!(partition = %id, generation, base = ?prior.head, "rebuilt snapshot from previous generation");
        Ok(Snapshot {
            algorithm: prior.algorithm,
            base: prior.head,
            base_timestamp: prior.head_timestamp,
            state_checksum: prior.state.checksum(),
            state: prior.state.into_state(),
        })
    }

    fn add_base(&mut self, base: CommitId, generation: u64) {
        self.bases.entry(base).or_insert(generation);
        if !self.graph.contains(&base) {
            self.graph.insert(base, Vec::new());
        }
    }

    /// Registers every commit of a scanned log. Returns the last mainline
    /// commit and, if the last mainline block could not be parsed, its
    /// offset.
    fn register_scan(&mut self, generation: u64, scan: &LogScan) -> (Option<CommitId>, Option<u64>) {
        let parsed: Vec<_> = scan
            .blocks
            .iter()
            .map(|scanned| Commit::parse(&scanned.block.record, self.algorithm))
            .collect();
        let mut referenced: HashSet<CommitId> = self.bases.keys().copied().collect();
        referenced.extend(
            self.commits
                .values()
                .filter_map(|entry| entry.commit.as_ref())
                .chain(parsed.iter().flatten().map(|p| &p.commit))
                .flat_map(|commit| commit.parents.iter().copied()),
        );
        let tip = scan.blocks.iter().rposition(|scanned| scanned.block.mainline);

        let mut last_mainline = None;
        let mut unreadable = None;
        for (index, (scanned, parsed)) in scan.blocks.iter().zip(parsed).enumerate() {
            let mainline = scanned.block.mainline;
            let parsed = match parsed {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(partition = %self.id, generation, offset = scanned.offset, error = %e, "unreadable commit record");
                    if mainline {
                        unreadable = Some(scanned.offset);
                    }
                    continue;
                }
            };
            let stored = parsed.commit.id;
            let computed = parsed.computed_id;
            if parsed.is_intact() {
                if mainline {
                    last_mainline = Some(stored);
                    unreadable = None;
                }
                self.register(stored, Some(parsed.commit), generation, mainline);
                continue;
            }
            warn!(
                partition = %self.id,
                generation,
                offset = scanned.offset,
                stored = %stored.short(),
                computed = %computed.short(),
                "commit id does not match its content"
            );

            // Only the id field is damaged if another commit or a snapshot
            // names the content hash, or if the block ends the log and no
            // alternate copy exists under the stored id.
            let id_damaged = referenced.contains(&computed)
                || (Some(index) == tip
                    && !referenced.contains(&stored)
                    && self.recover(&stored).is_none());
            if id_damaged {
                info!(partition = %self.id, generation, offset = scanned.offset, commit = %computed.short(), "re-derived commit id from its content");
                if mainline {
                    last_mainline = Some(computed);
                    unreadable = None;
                }
                let mut commit = parsed.commit;
                commit.id = computed;
                self.register(computed, Some(commit), generation, mainline);
                continue;
            }

            if mainline {
                last_mainline = Some(stored);
                unreadable = None;
            }
            // The body is damaged; references use the stored id.
            for id in [stored, computed] {
                let body = self.recover(&id);
                if body.is_none() && !self.graph.contains(&id) {
                    self.graph.insert(id, parsed.commit.parents.clone());
                }
                self.register(id, body, generation, mainline);
            }
        }
        (last_mainline, unreadable)
    }

    fn register(&mut self, id: CommitId, commit: Option<Commit>, generation: u64, mainline: bool) {
        if self.commits.contains_key(&id) {
            return;
        }
        if let Some(commit) = &commit {
            self.graph.insert(id, commit.parents.clone());
        }
        self.commits.insert(
            id,
            CommitEntry {
                commit,
                generation,
                mainline,
                seq: self.next_seq,
            },
        );
        self.next_seq += 1;
    }

    /// Fetches and verifies an alternate copy of a commit.
    fn recover(&self, id: &CommitId) -> Option<Commit> {
        let source = self.config.commit_source.as_ref()?;
        let bytes = source.fetch(&self.id, id)?;
        match Commit::decode(&bytes, self.algorithm) {
            Ok(commit) if commit.id == *id => {
                info!(partition = %self.id, commit = %id.short(), "recovered commit from alternate copy");
                Some(commit)
            }
            Ok(_) | Err(_) => {
                warn!(partition = %self.id, commit = %id.short(), "alternate copy does not verify");
                None
            }
        }
    }

    fn commit_body(&self, id: &CommitId) -> CoreResult<Commit> {
        match self.commits.get(id) {
            Some(CommitEntry {
                commit: Some(commit),
                ..
            }) => Ok(commit.clone()),
            Some(_) => self
                .recover(id)
                .ok_or_else(|| CoreError::corrupt_commit(*id, "stored record does not match its id")),
            None => self
                .recover(id)
                .ok_or_else(|| CoreError::corrupt_commit(*id, "commit is missing from the log")),
        }
    }

    /// Collects the first-parent line ending at `head`, oldest first, up to
    /// (excluding) the first commit for which `stop` holds. Returns the
    /// commits and where the walk stopped (`None` at a root).
    fn chain_to(
        &self,
        head: CommitId,
        stop: &dyn Fn(&CommitId) -> bool,
    ) -> CoreResult<(Vec<Commit>, Option<CommitId>)> {
        let mut chain = Vec::new();
        let mut current = Some(head);
        while let Some(id) = current {
            if stop(&id) {
                chain.reverse();
                return Ok((chain, Some(id)));
            }
            let commit = self.commit_body(&id)?;
            current = commit.first_parent();
            chain.push(commit);
            if chain.len() > self.commits.len() + 1 {
                return Err(CoreError::invalid_format(format!(
                    "parent cycle through commit {}",
                    id.short()
                )));
            }
        }
        chain.reverse();
        Ok((chain, None))
    }

    fn replay_head(&mut self) -> CoreResult<()> {
        let Some(head) = self.head else {
            return Ok(());
        };
        let base = self.snapshot.base;
        let (chain, end) = self.chain_to(head, &|c| Some(*c) == base)?;
        if end != base {
            return Err(CoreError::invalid_format(format!(
                "head {} does not descend from the snapshot base",
                head.short()
            )));
        }
        for commit in &chain {
            self.state.apply_commit(commit)?;
            if self.state.checksum() != commit.state_checksum {
                return Err(CoreError::corrupt_commit(
                    commit.id,
                    "replayed state does not match the recorded state checksum",
                ));
            }
            self.head_timestamp = commit.timestamp;
        }
        self.commits_since_snapshot = u32::try_from(chain.len()).unwrap_or(u32::MAX);
        Ok(())
    }

    /// Registers every retained older generation.
    fn ensure_history(&mut self) -> CoreResult<()> {
        while self.loaded_down_to > 0 {
            let generation = self.loaded_down_to - 1;
            if !self.files.has_generation(generation)? {
                break;
            }
            let backend = self.files.open_existing_log(generation)?;
            let scan = LogScan::read(backend.as_ref())?;
            self.register_scan(generation, &scan);
            let snapshot = self.files.read_snapshot(generation).and_then(|bytes| {
                Snapshot::decode(&bytes, generation, Some(self.algorithm), self.config.group_size)
            });
            match snapshot {
                Ok(snapshot) => {
                    if let Some(base) = snapshot.base {
                        self.add_base(base, generation);
                    }
                }
                Err(e) => {
                    warn!(partition = %self.id, generation, error = %e, "skipping damaged snapshot");
                }
            }
            self.loaded_down_to = generation;
        }
        Ok(())
    }

    fn snapshot_state(&self, generation: u64) -> CoreResult<State> {
        if generation == self.generation {
            return Ok(self.snapshot.state.clone());
        }
        let bytes = self.files.read_snapshot(generation)?;
        Ok(Snapshot::decode(&bytes, generation, Some(self.algorithm), self.config.group_size)?.state)
    }

    fn is_known(&self, id: &CommitId) -> bool {
        self.commits.contains_key(id) || self.bases.contains_key(id)
    }

    fn timestamp_of(&self, id: &CommitId) -> CoreResult<Timestamp> {
        if self.snapshot.base == Some(*id) {
            return Ok(self.snapshot.base_timestamp);
        }
        Ok(self.commit_body(id)?.timestamp)
    }

    /// Returns the partition id.
    #[must_use]
    pub fn id(&self) -> &PartitionId {
        &self.id
    }

    /// Returns the active generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the digest algorithm of the partition.
    #[must_use]
    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Returns the head commit, or `None` before the first commit.
    #[must_use]
    pub fn head(&self) -> Option<CommitId> {
        self.head
    }

    /// Returns the timestamp of the head commit.
    #[must_use]
    pub fn head_timestamp(&self) -> Timestamp {
        self.head_timestamp
    }

    /// Returns the head state.
    #[must_use]
    pub fn state(&self) -> &State {
        self.state.state()
    }

    /// Returns the checksum of the head state.
    #[must_use]
    pub fn state_checksum(&self) -> Digest {
        self.state.checksum()
    }

    /// Returns the active log.
    #[must_use]
    pub fn log(&self) -> &LogFile {
        &self.log
    }

    /// Returns the active snapshot.
    #[must_use]
    pub fn snapshot_info(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Returns the number of commits registered so far.
    #[must_use]
    pub fn known_commits(&self) -> usize {
        self.commits.len()
    }

    /// Returns a registered commit.
    ///
    /// # Errors
    ///
    /// Returns `CorruptCommit` if the commit is damaged or missing.
    pub fn commit(&self, id: &CommitId) -> CoreResult<Commit> {
        self.commit_body(id)
    }

    fn check_parent(&self, parent: Option<CommitId>) -> CoreResult<()> {
        if parent == self.head {
            return Ok(());
        }
        let show = |c: Option<CommitId>| c.map_or_else(|| "none".to_string(), |c| c.to_hex());
        Err(CoreError::StaleParent {
            head: show(self.head),
            given: show(parent),
        })
    }

    /// Appends a commit on top of `parent`, which must be the current head.
    ///
    /// Puts whose payload equals the current one are dropped; if nothing
    /// remains, the head is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns `StaleParent` if `parent` is not the head, `InvalidArgument`
    /// if an element appears twice, `NotFound` when deleting an absent
    /// element, `HeaderFull` or `AppendFailed` from the log.
    pub fn append(&mut self, parent: Option<CommitId>, changes: Vec<Change>) -> CoreResult<CommitId> {
        self.check_parent(parent)?;
        let mut seen = HashSet::new();
        let mut items = Vec::with_capacity(changes.len());
        for change in changes {
            let element = change.element();
            if !seen.insert(element) {
                return Err(CoreError::invalid_argument(format!(
                    "element {element} appears twice in one commit"
                )));
            }
            match change {
                Change::Put(id, payload) => {
                    let checksum = item_checksum(self.algorithm, &id, &payload.encode()?);
                    let previous = self.state.state().get(&id);
                    if previous.is_some_and(|e| e.checksum == checksum) {
                        continue;
                    }
                    let entry = Entry { payload, checksum };
                    items.push(encode_update(
                        id,
                        previous.map(|e| &e.payload),
                        entry,
                        self.config.patch_ratio,
                    )?);
                }
                Change::Delete(id) => {
                    if self.state.state().get(&id).is_none() {
                        return Err(CoreError::not_found(format!(
                            "element {id} in partition {}",
                            self.id
                        )));
                    }
                    items.push(ItemChange::deletion(id));
                }
            }
        }
        if items.is_empty() {
            return self
                .head
                .ok_or_else(|| CoreError::invalid_argument("nothing to commit"));
        }
        let branch = self.config.branch.clone();
        Ok(self
            .commit_items(items, Vec::new(), branch, Vec::new(), Timestamp::default())?
            .id)
    }

    /// Records that `element` left for `destination`.
    ///
    /// Returns the commit and the departing payload.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the element is not live here.
    pub fn move_out(
        &mut self,
        element: ElementId,
        destination: &PartitionId,
    ) -> CoreResult<(CommitId, Payload)> {
        let entry = self.state.state().get(&element).cloned().ok_or_else(|| {
            CoreError::not_found(format!("element {element} in partition {}", self.id))
        })?;
        let change = ItemChange::moved_to(element, destination.clone(), entry.checksum);
        let branch = self.config.branch.clone();
        let commit = self.commit_items(vec![change], Vec::new(), branch, Vec::new(), Timestamp::default())?;
        Ok((commit.id, entry.payload))
    }

    /// Records that `element` arrived from `source` with `payload`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the element is already live here.
    pub fn move_in(
        &mut self,
        element: ElementId,
        source: &PartitionId,
        payload: Payload,
    ) -> CoreResult<CommitId> {
        if self.state.state().get(&element).is_some() {
            return Err(CoreError::invalid_argument(format!(
                "element {element} already lives in partition {}",
                self.id
            )));
        }
        let change = ItemChange::moved_from(self.algorithm, element, source.clone(), payload)?;
        let branch = self.config.branch.clone();
        Ok(self
            .commit_items(vec![change], Vec::new(), branch, Vec::new(), Timestamp::default())?
            .id)
    }

    /// Applies `changes` to the head state, seals a commit on the head
    /// plus `extra_parents` and appends it as a mainline block. The head
    /// state is restored if anything fails.
    fn commit_items(
        &mut self,
        changes: Vec<ItemChange>,
        extra_parents: Vec<CommitId>,
        branch: Option<String>,
        rejected: Vec<RejectedChange>,
        not_before: Timestamp,
    ) -> CoreResult<Commit> {
        let timestamp = self
            .config
            .clock
            .now()
            .max(self.head_timestamp)
            .max(not_before);

        let mut undo = Vec::with_capacity(changes.len());
        for change in &changes {
            undo.push((change.element, self.state.state().status(&change.element)));
            if let Err(e) = self.state.apply(change) {
                self.rollback(undo);
                return Err(e);
            }
        }

        let mut touched: Vec<ElementId> = Vec::with_capacity(changes.len());
        for change in &changes {
            if !touched.contains(&change.element) {
                touched.push(change.element);
            }
        }
        let draft = CommitDraft {
            parents: self.head.into_iter().chain(extra_parents).collect(),
            timestamp,
            branch,
            state_checksum: self.state.checksum(),
            changes,
            rejected,
        };
        let appended = draft
            .seal(self.algorithm)
            .and_then(|(commit, record)| self.log.append(record, true, &touched).map(|_| commit));
        let commit = match appended {
            Ok(commit) => commit,
            Err(e) => {
                self.rollback(undo);
                return Err(e);
            }
        };

        self.register(commit.id, Some(commit.clone()), self.generation, true);
        self.head = Some(commit.id);
        self.head_timestamp = commit.timestamp;
        self.commits_since_snapshot = self.commits_since_snapshot.saturating_add(1);
        debug!(
            partition = %self.id,
            commit = %commit.id.short(),
            changes = commit.changes.len(),
            "committed"
        );

        let threshold = self.config.snapshot_after_commits;
        if threshold > 0 && self.commits_since_snapshot >= threshold {
            if let Err(e) = self.snapshot() {
                warn!(partition = %self.id, error = %e, "automatic snapshot failed");
            }
        }
        Ok(commit)
    }

    fn rollback(&mut self, undo: Vec<(ElementId, Status)>) {
        for (id, status) in undo.into_iter().rev() {
            self.state.set_status(id, status);
        }
    }

    /// Reconstructs the state at any locally known commit.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown commit, or `CorruptCommit` if a
    /// commit on the way is damaged.
    pub fn state_at(&mut self, commit: CommitId) -> CoreResult<State> {
        if Some(commit) == self.head {
            return Ok(self.state.state().clone());
        }
        if !self.is_known(&commit) {
            self.ensure_history()?;
            if !self.is_known(&commit) {
                return Err(CoreError::not_found(format!(
                    "commit {} in partition {}",
                    commit.short(),
                    self.id
                )));
            }
        }
        let bases = &self.bases;
        let (chain, end) = self.chain_to(commit, &|c| bases.contains_key(c))?;
        let mut state = match end {
            Some(base) => self.snapshot_state(self.bases[&base])?,
            None => State::new(),
        };
        for commit in &chain {
            state.apply_commit(self.algorithm, commit)?;
        }
        Ok(state)
    }

    /// Merges the branch ending at `other` into the head.
    ///
    /// Returns the head unchanged if `other` is already an ancestor.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `other` is unknown, `CorruptCommit` if a
    /// commit replayed on either side does not verify, `Cancelled` if
    /// cancelled before the merge commit is appended, or an append error.
    pub fn merge<F>(&mut self, other: CommitId, resolve: F, cancel: &CancelToken) -> CoreResult<MergeOutcome>
    where
        F: Fn(ElementId, Option<&Payload>, &MergeSide<'_>, &MergeSide<'_>) -> Resolution,
    {
        self.ensure_history()?;
        if !self.is_known(&other) {
            return Err(CoreError::not_found(format!(
                "commit {} in partition {}",
                other.short(),
                self.id
            )));
        }
        if let Some(head) = self.head {
            if head == other || self.graph.is_ancestor(&other, head) {
                return Ok(MergeOutcome {
                    commit_id: head,
                    rejected: Vec::new(),
                });
            }
        }

        let remote_state = self.state_at(other)?;
        let remote = BranchHead {
            head: other,
            timestamp: self.timestamp_of(&other)?,
        };
        let ancestor = match self.head {
            Some(head) => match self.common_ancestor(head, other) {
                Ok(ancestor) => Some(ancestor),
                Err(e @ CoreError::NoCommonAncestor { .. }) => {
                    warn!(partition = %self.id, error = %e, "merging as a union");
                    None
                }
                Err(e) => return Err(e),
            },
            None => None,
        };
        let ancestor_state = match ancestor {
            Some(ancestor) => self.state_at(ancestor)?,
            None => State::new(),
        };
        cancel.check()?;

        let local = BranchHead {
            head: self.head.unwrap_or(Digest::ZERO),
            timestamp: self.head_timestamp,
        };
        let plan = merge::plan(
            self.algorithm,
            &ancestor_state,
            (self.state.state(), local),
            (&remote_state, remote),
            resolve,
        )?;
        // Without a local head the merge commit's first parent is `other`,
        // so its changes are relative to the remote state.
        let previous = self.head.is_none().then(|| {
            std::mem::replace(
                &mut self.state,
                TrackedState::new(remote_state, self.algorithm, self.config.group_size),
            )
        });
        let changes = self
            .state
            .state()
            .changes_to(&plan.state, self.config.patch_ratio);
        let changes = match changes {
            Ok(changes) => changes,
            Err(e) => {
                if let Some(previous) = previous {
                    self.state = previous;
                }
                return Err(e);
            }
        };
        let branch = self
            .config
            .branch
            .clone()
            .unwrap_or_else(|| merge::merge_branch_name(self.algorithm, &local.head, &other));
        let committed = cancel.check().and_then(|()| {
            self.commit_items(
                changes,
                vec![other],
                Some(branch),
                plan.rejected.clone(),
                remote.timestamp,
            )
        });
        let commit = match committed {
            Ok(commit) => commit,
            Err(e) => {
                if let Some(previous) = previous {
                    self.state = previous;
                }
                return Err(e);
            }
        };
        info!(
            partition = %self.id,
            commit = %commit.id.short(),
            ancestor = ?ancestor.map(|a| a.short()),
            rejected = plan.rejected.len(),
            "merged branch"
        );
        Ok(MergeOutcome {
            commit_id: commit.id,
            rejected: plan.rejected,
        })
    }

    /// Finds the nearest common ancestor of two known commits.
    ///
    /// # Errors
    ///
    /// Returns `NoCommonAncestor` if their histories do not meet locally.
    pub fn common_ancestor(&self, a: CommitId, b: CommitId) -> CoreResult<CommitId> {
        self.graph
            .common_ancestor(a, b)
            .ok_or(CoreError::NoCommonAncestor { a, b })
    }

    /// Writes generation g+1 with a snapshot of the head state and
    /// publishes it. Unmerged branch blocks of the active log are carried
    /// over. Returns the new generation.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a file cannot be written; the active
    /// generation stays in place.
    pub fn snapshot(&mut self) -> CoreResult<u64> {
        let next = self.generation + 1;
        let snapshot = Snapshot {
            algorithm: self.algorithm,
            base: self.head,
            base_timestamp: self.head_timestamp,
            state_checksum: self.state.checksum(),
            state: self.state.state().clone(),
        };

        let on_head: HashSet<CommitId> = self.head.map(|h| self.graph.ancestors(h)).unwrap_or_default();
        let mut branch: Vec<(u64, CommitId)> = self
            .commits
            .iter()
            .filter(|(id, e)| e.generation == self.generation && !e.mainline && !on_head.contains(id))
            .map(|(id, e)| (e.seq, *id))
            .collect();
        branch.sort_by_key(|(seq, _)| *seq);
        let records = branch
            .iter()
            .map(|(_, id)| self.commit_body(id).and_then(|c| c.encode()))
            .collect::<CoreResult<Vec<_>>>()?;

        let capacity = self
            .log
            .header()
            .capacity
            .max(u32::try_from(snapshot.state.len()).unwrap_or(u32::MAX));
        let log = match self.write_generation(next, &snapshot, capacity, &[], &records, &CancelToken::new()) {
            Ok(log) => log,
            Err(e) => {
                self.discard_generation(next);
                return Err(e);
            }
        };
        if let Err(e) = self.files.publish(next) {
            self.discard_generation(next);
            return Err(e);
        }

        for (_, id) in &branch {
            if let Some(entry) = self.commits.get_mut(id) {
                entry.generation = next;
            }
        }
        if let Some(base) = snapshot.base {
            self.bases.insert(base, next);
        }
        self.generation = next;
        self.log = log;
        self.snapshot = snapshot;
        self.commits_since_snapshot = 0;
        info!(
            partition = %self.id,
            generation = next,
            elements = self.snapshot.state.len(),
            carried = branch.len(),
            "wrote snapshot"
        );
        Ok(next)
    }

    fn write_generation(
        &self,
        generation: u64,
        snapshot: &Snapshot,
        capacity: u32,
        mainline: &[(Vec<u8>, Vec<ElementId>)],
        branch: &[Vec<u8>],
        cancel: &CancelToken,
    ) -> CoreResult<LogFile> {
        self.files.write_snapshot(generation, &snapshot.encode()?)?;
        let resident: Vec<ElementId> = snapshot.state.iter().map(|(id, _)| *id).collect();
        let mut log = LogFile::create(
            self.files.open_log(generation)?,
            &self.id,
            self.algorithm,
            capacity,
            generation,
            &resident,
            self.config.sync_on_commit,
        )?;
        for (record, touched) in mainline {
            cancel.check()?;
            log.append(record.clone(), true, touched)?;
        }
        for record in branch {
            cancel.check()?;
            log.append(record.clone(), false, &[])?;
        }
        Ok(log)
    }

    fn discard_generation(&self, generation: u64) {
        if let Err(e) = self.files.remove_generation(generation) {
            warn!(partition = %self.id, generation, error = %e, "could not remove partial generation");
        }
    }

    /// Loads every retained generation and returns the head, the oldest
    /// retained generation, its snapshot and the head's first-parent line
    /// after that snapshot, oldest first. `None` without a head.
    fn fold_range(&mut self) -> CoreResult<Option<(CommitId, u64, Snapshot, Vec<Commit>)>> {
        self.ensure_history()?;
        let Some(head) = self.head else {
            return Ok(None);
        };
        let oldest = self.loaded_down_to;
        let base = if oldest == self.generation {
            self.snapshot.clone()
        } else {
            let bytes = self.files.read_snapshot(oldest)?;
            Snapshot::decode(&bytes, oldest, Some(self.algorithm), self.config.group_size)?
        };
        let stop = base.base;
        let (chain, end) = self.chain_to(head, &|c| Some(*c) == stop)?;
        if end != stop {
            return Err(CoreError::invalid_format(format!(
                "head {} does not descend from the snapshot of generation {oldest}",
                head.short()
            )));
        }
        Ok(Some((head, oldest, base, chain)))
    }

    /// Returns the commits [`Partition::compact`] would fold: the head's
    /// first-parent line back to the snapshot of the oldest retained
    /// generation, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `CorruptCommit` if a commit on the line is damaged, or a
    /// storage error.
    pub fn compaction_chain(&mut self) -> CoreResult<Vec<Commit>> {
        Ok(self
            .fold_range()?
            .map(|(_, _, _, chain)| chain)
            .unwrap_or_default())
    }

    /// Folds the retained mainline history according to `policy` into a
    /// new generation, verifies it reproduces the head state, publishes it
    /// and deletes the superseded generations. Returns the new generation.
    ///
    /// The new generation starts from the oldest retained snapshot.
    /// Unmerged branch commits are carried over together with the original
    /// ancestors they need.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if cancelled before publishing (the partial
    /// generation is removed), `CorruptCommit` if a commit to fold is
    /// damaged, or a storage error.
    pub fn compact(&mut self, policy: &RetentionPolicy, cancel: &CancelToken) -> CoreResult<u64> {
        let (head, oldest, base, chain) = match self.fold_range()? {
            Some(range) => range,
            None => return Ok(self.generation),
        };
        if chain.is_empty() {
            return Ok(self.generation);
        }

        let params = CompactionParams {
            algorithm: self.algorithm,
            patch_ratio: self.config.patch_ratio,
        };
        let sealed = compaction::compact(&base.state, &chain, policy, params, cancel)?;

        let mut replayed = TrackedState::new(base.state.clone(), self.algorithm, self.config.group_size);
        for commit in &sealed {
            replayed.apply_commit(&commit.commit)?;
        }
        if replayed.checksum() != self.state.checksum() {
            return Err(CoreError::invalid_format(
                "compacted history does not reproduce the head state",
            ));
        }

        let output: HashSet<CommitId> = sealed.iter().map(|s| s.commit.id).collect();
        let on_head = self.graph.ancestors(head);
        let unmerged: Vec<CommitId> = self
            .commits
            .iter()
            .filter(|(id, e)| !e.mainline && !on_head.contains(id))
            .map(|(id, _)| *id)
            .collect();
        let mut needed = HashSet::new();
        for id in &unmerged {
            needed.extend(self.graph.ancestors(*id));
        }
        let mut carried: Vec<(u64, u64, CommitId)> = needed
            .iter()
            .filter(|id| !output.contains(id))
            .filter_map(|id| self.commits.get(id).map(|e| (e.generation, e.seq, *id)))
            .collect();
        carried.sort_by_key(|(generation, seq, _)| (*generation, *seq));
        let branch = carried
            .iter()
            .map(|(_, _, id)| self.commit_body(id).and_then(|c| c.encode()))
            .collect::<CoreResult<Vec<_>>>()?;

        let mut distinct: BTreeSet<ElementId> = base.state.iter().map(|(id, _)| *id).collect();
        let mainline: Vec<(Vec<u8>, Vec<ElementId>)> = sealed
            .into_iter()
            .map(|s| {
                let mut touched: Vec<ElementId> = Vec::new();
                for change in &s.commit.changes {
                    distinct.insert(change.element);
                    if !touched.contains(&change.element) {
                        touched.push(change.element);
                    }
                }
                (s.record, touched)
            })
            .collect();
        let capacity = self
            .log
            .header()
            .capacity
            .max(u32::try_from(distinct.len()).unwrap_or(u32::MAX));

        let next = self.generation + 1;
        let written = self
            .write_generation(next, &base, capacity, &mainline, &branch, cancel)
            .and_then(|_| cancel.check());
        if let Err(e) = written {
            self.discard_generation(next);
            return Err(e);
        }
        if let Err(e) = self.files.publish(next) {
            self.discard_generation(next);
            return Err(e);
        }
        info!(
            partition = %self.id,
            generation = next,
            before = chain.len(),
            after = mainline.len(),
            carried = branch.len(),
            "compacted history"
        );

        for generation in oldest..=self.generation {
            if let Err(e) = self.files.remove_generation(generation) {
                warn!(partition = %self.id, generation, error = %e, "could not remove superseded generation");
            }
        }
        *self = Self::load(self.files.clone(), self.id.clone(), self.config.clone(), next)?;
        Ok(next)
    }

    /// Returns the serialized record of a known commit.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown commit or `CorruptCommit` if the
    /// stored copy is damaged.
    pub fn export_commit(&mut self, id: &CommitId) -> CoreResult<Vec<u8>> {
        if !self.commits.contains_key(id) {
            self.ensure_history()?;
        }
        if !self.commits.contains_key(id) {
            return Err(CoreError::not_found(format!(
                "commit {} in partition {}",
                id.short(),
                self.id
            )));
        }
        self.commit_body(id)?.encode()
    }

    /// Verifies and appends foreign commits as branch blocks.
    ///
    /// All records are verified before any is appended: the commit id and
    /// the item checksum of every full payload. Patch checksums are checked
    /// when the commit is replayed. The head does not move; imported
    /// commits become merge candidates.
    ///
    /// # Errors
    ///
    /// Returns `AlgorithmMismatch` for a record sealed with another
    /// algorithm, `CorruptCommit` or `InvalidFormat` for a record that does
    /// not verify, or an append error.
    pub fn import_commits(&mut self, records: &[Vec<u8>]) -> CoreResult<ImportReport> {
        self.ensure_history()?;
        let commits = records
            .iter()
            .map(|bytes| {
                let commit = Commit::decode(bytes, self.algorithm)?;
                commit.check_items(self.algorithm)?;
                Ok((commit, bytes))
            })
            .collect::<CoreResult<Vec<_>>>()?;

        let mut report = ImportReport::default();
        for (commit, bytes) in commits {
            if self.commits.contains_key(&commit.id) {
                report.skipped.push(commit.id);
                continue;
            }
            self.log.append(bytes.clone(), false, &[])?;
            report.imported.push(commit.id);
            self.register(commit.id, Some(commit), self.generation, false);
        }
        for id in &report.imported {
            for parent in self.graph.parents(id).unwrap_or_default() {
                if !self.is_known(parent) && !report.unresolved_parents.contains(parent) {
                    report.unresolved_parents.push(*parent);
                }
            }
        }
        if !report.unresolved_parents.is_empty() {
            warn!(
                partition = %self.id,
                unresolved = report.unresolved_parents.len(),
                "imported commits reference unknown parents"
            );
        }
        debug!(
            partition = %self.id,
            imported = report.imported.len(),
            skipped = report.skipped.len(),
            "imported commits"
        );
        Ok(report)
    }

    /// Returns the versions of an element recorded in the active
    /// generation, newest first.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if a link is broken or `CorruptCommit` if a
    /// record on the element's chain is damaged.
    pub fn history(&self, element: &ElementId) -> CoreResult<Vec<ElementVersion>> {
        let mut status = self.snapshot.state.status(element);
        let mut versions = Vec::new();
        if status != Status::Absent {
            versions.push(ElementVersion {
                commit: self.snapshot.base,
                timestamp: self.snapshot.base_timestamp,
                location: Location::Snapshot {
                    generation: self.generation,
                },
                status: status.clone(),
            });
        }
        for (offset, block) in self.log.element_blocks(element)?.into_iter().rev() {
            let commit = Commit::decode(&block.record, self.algorithm)?;
            let mut scratch = State::new();
            for change in commit.changes.iter().filter(|c| c.element == *element) {
                scratch.set_status(*element, status.clone());
                status = scratch
                    .resolve_verified(self.algorithm, change)
                    .map_err(|e| CoreError::corrupt_commit(commit.id, e.to_string()))?;
            }
            versions.push(ElementVersion {
                commit: Some(commit.id),
                timestamp: commit.timestamp,
                location: Location::Block {
                    generation: self.generation,
                    offset,
                },
                status: status.clone(),
            });
        }
        versions.reverse();
        Ok(versions)
    }

    /// Returns where the latest version of an element is stored.
    #[must_use]
    pub fn locate_latest(&self, element: &ElementId) -> Option<Location> {
        let generation = self.generation;
        match self.log.locate(element) {
            Some(SLOT_IN_SNAPSHOT) => Some(Location::Snapshot { generation }),
            Some(offset) => Some(Location::Block { generation, offset }),
            None => self
                .snapshot
                .state
                .tombstone(element)
                .map(|_| Location::Snapshot { generation }),
        }
    }

    /// Checks every region of every retained generation without modifying
    /// anything.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a file cannot be read at all.
    pub fn verify(&self) -> CoreResult<Vec<RegionReport>> {
        verify_files(&self.files, self.generation, self.config.group_size)
    }
}

/// Checks the files of a partition, starting at `generation` and walking
/// back through the retained older generations. Works on partitions that
/// cannot be opened.
///
/// # Errors
///
/// Returns a storage error if a file cannot be read at all.
pub fn verify_files(
    files: &PartitionFiles,
    generation: u64,
    group_size: usize,
) -> CoreResult<Vec<RegionReport>> {
    let mut reports = Vec::new();
    let mut generations = vec![generation];
    generations.extend(files.older_generations(generation)?);
    for generation in generations {
        verify_generation(files, generation, group_size, &mut reports)?;
    }
    let failures = reports.iter().filter(|r| !r.is_ok()).count();
    if failures > 0 {
        warn!(files = ?files, failures, "verification found damage");
    }
    Ok(reports)
}

fn verify_generation(
    files: &PartitionFiles,
    generation: u64,
    group_size: usize,
    reports: &mut Vec<RegionReport>,
) -> CoreResult<()> {
    let scan = match files.open_existing_log(generation) {
        Ok(backend) => LogScan::read(backend.as_ref()),
        Err(CoreError::NotFound { what }) => Err(CoreError::invalid_format(format!("missing {what}"))),
        Err(e) => return Err(e),
    };
    let algorithm = scan.as_ref().ok().map(|s| s.header.algorithm);

    // Mainline commits are replayed over the snapshot so patch checksums
    // get checked too; replay stops at the first damaged commit.
    let mut replay = None;
    let snapshot_status = match files
        .read_snapshot(generation)
        .and_then(|bytes| Snapshot::decode(&bytes, generation, algorithm, group_size))
    {
        Ok(snapshot) => {
            replay = Some(snapshot.state);
            RegionStatus::Ok
        }
        Err(e) => RegionStatus::CorruptSnapshot {
            message: e.to_string(),
        },
    };
    reports.push(RegionReport {
        region: Region::Snapshot { generation },
        status: snapshot_status,
    });

    let scan = match scan {
        Ok(scan) => scan,
        Err(e) => {
            reports.push(RegionReport {
                region: Region::Header { generation },
                status: RegionStatus::BadFraming {
                    message: e.to_string(),
                },
            });
            return Ok(());
        }
    };
    reports.push(RegionReport {
        region: Region::Header { generation },
        status: RegionStatus::Ok,
    });

    let algorithm = scan.header.algorithm;
    for scanned in &scan.blocks {
        let mainline = scanned.block.mainline;
        let report = match Commit::parse(&scanned.block.record, algorithm) {
            Ok(parsed) => {
                let id = parsed.commit.id;
                let checked = if !parsed.is_intact() {
                    Err(format!("content hashes to {}", parsed.computed_id.short()))
                } else if let (true, Some(state)) = (mainline, replay.as_mut()) {
                    state
                        .apply_commit(algorithm, &parsed.commit)
                        .map_err(|e| e.to_string())
                } else {
                    parsed.commit.check_items(algorithm).map_err(|e| e.to_string())
                };
                let status = match checked {
                    Ok(()) => RegionStatus::Ok,
                    Err(message) => {
                        if mainline {
                            replay = None;
                        }
                        RegionStatus::CorruptCommit { message }
                    }
                };
                RegionReport {
                    region: Region::Commit {
                        generation,
                        offset: scanned.offset,
                        id,
                    },
                    status,
                }
            }
            Err(e) => {
                if mainline {
                    replay = None;
                }
                RegionReport {
                    region: Region::Block {
                        generation,
                        offset: scanned.offset,
                    },
                    status: RegionStatus::BadFraming {
                        message: e.to_string(),
                    },
                }
            }
        };
        reports.push(report);
    }
    if let Some((offset, message)) = &scan.broken {
        reports.push(RegionReport {
            region: Region::Block {
                generation,
                offset: *offset,
            },
            status: RegionStatus::BadFraming {
                message: message.clone(),
            },
        });
    } else if scan.size > scan.end {
        reports.push(RegionReport {
            region: Region::Tail {
                generation,
                offset: scan.end,
            },
            status: RegionStatus::Unpublished {
                bytes: scan.size - scan.end,
            },
        });
    }
    Ok(())
}
