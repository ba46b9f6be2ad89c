//! Repository facade.

use crate::addressing::{Classifier, ClassifierChain, FileNames};
use crate::cancel::CancelToken;
use crate::checksum::Digest;
use crate::commit::{Change, CommitId, State};
use crate::compaction::RetentionPolicy;
use crate::config::Config;
#[cfg(feature = "std")]
use crate::dir::RepoDir;
use crate::error::{CoreError, CoreResult};
use crate::layout::{Location, PartitionFiles};
use crate::merge::{MergeOutcome, MergeSide, Resolution};
use crate::partition::{self, ElementVersion, ImportReport, Partition, RegionReport};
use crate::payload::Payload;
use crate::types::{ElementId, PartitionId};
use parking_lot::RwLock;
use std::collections::HashMap;
#[cfg(feature = "std")]
use std::path::Path;
use std::sync::Arc;
use tessera_storage::{FileStore, MemoryStore};
use tracing::{info, warn};

/// Shared handle to an open partition.
pub type PartitionHandle = Arc<RwLock<Partition>>;

/// The main repository handle.
///
/// A `Repository` owns a set of partitions stored in one [`FileStore`].
/// Partitions are opened lazily on first use and stay open until the
/// repository is dropped. Each partition has its own lock, so writers to
/// different partitions never contend.
///
/// # Opening a repository
///
/// ```rust,ignore
/// use tessera_core::{Payload, Repository, PartitionId};
/// use std::path::Path;
///
/// let repo = Repository::open(Path::new("mail"))?;
/// repo.set_fallback(PartitionId::new("inbox")?);
/// let (partition, element, commit) =
///     repo.insert(Payload::new().with("subject", "hello"))?;
/// ```
///
/// For tests, use [`Repository::in_memory`].
pub struct Repository {
    config: Arc<Config>,
    store: Arc<dyn FileStore>,
    classifiers: RwLock<ClassifierChain>,
    partitions: RwLock<HashMap<PartitionId, PartitionHandle>>,
    /// Holds the directory lock. `None` for non-directory stores.
    #[cfg(feature = "std")]
    dir: Option<RepoDir>,
}

impl Repository {
    /// Opens or creates a repository directory with the default
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryLocked` if another process has the directory
    /// open, or an I/O error.
    #[cfg(feature = "std")]
    pub fn open(path: &Path) -> CoreResult<Self> {
        Self::open_with_config(path, Config::default())
    }

    /// Opens or creates a repository directory.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid settings,
    /// `RepositoryLocked` if another process has the directory open, or an
    /// I/O error.
    #[cfg(feature = "std")]
    pub fn open_with_config(path: &Path, config: Config) -> CoreResult<Self> {
        config.validate()?;
        let dir = RepoDir::open(path, true)?;
        let store: Arc<dyn FileStore> = Arc::new(dir.store()?);
        info!(path = %path.display(), "opened repository");
        Ok(Self {
            config: Arc::new(config),
            store,
            classifiers: RwLock::new(ClassifierChain::new()),
            partitions: RwLock::new(HashMap::new()),
            dir: Some(dir),
        })
    }

    /// Creates an empty in-memory repository.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid settings.
    pub fn in_memory(config: Config) -> CoreResult<Self> {
        Self::with_store(Arc::new(MemoryStore::new()), config)
    }

    /// Uses an arbitrary file store.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid settings.
    pub fn with_store(store: Arc<dyn FileStore>, config: Config) -> CoreResult<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            store,
            classifiers: RwLock::new(ClassifierChain::new()),
            partitions: RwLock::new(HashMap::new()),
            #[cfg(feature = "std")]
            dir: None,
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the repository directory, if directory backed.
    #[cfg(feature = "std")]
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(RepoDir::path)
    }

    // ========================================================================
    // Addressing
    // ========================================================================

    /// Appends a classifier to the chain.
    pub fn register_classifier(&self, classifier: Arc<dyn Classifier>) {
        self.classifiers.write().push(classifier);
    }

    /// Puts a classifier in front of the chain. Later inserts use it first;
    /// existing elements stay where they are.
    pub fn register_front(&self, classifier: Arc<dyn Classifier>) {
        self.classifiers.write().register_front(classifier);
    }

    /// Sets the partition that takes elements no classifier claims.
    pub fn set_fallback(&self, partition: PartitionId) {
        self.classifiers.write().set_fallback(partition);
    }

    /// Maps element attributes to a partition.
    ///
    /// # Errors
    ///
    /// Returns `NoMatchingClassifier` if nothing matched and no fallback is
    /// set.
    pub fn resolve_partition(&self, attributes: &Payload) -> CoreResult<PartitionId> {
        self.classifiers.read().resolve(attributes)
    }

    // ========================================================================
    // Partitions
    // ========================================================================

    /// Creates a new, empty partition.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the partition already exists.
    pub fn create_partition(&self, id: &PartitionId) -> CoreResult<PartitionHandle> {
        let mut partitions = self.partitions.write();
        if partitions.contains_key(id) {
            return Err(CoreError::invalid_argument(format!(
                "partition {id} already exists"
            )));
        }
        let partition = Partition::create(self.store.clone(), id.clone(), self.config.clone())?;
        let handle = Arc::new(RwLock::new(partition));
        partitions.insert(id.clone(), handle.clone());
        Ok(handle)
    }

    /// Returns the handle of a partition, opening it on first use.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the partition does not exist, or any error
    /// from [`Partition::open`].
    pub fn open_partition(&self, id: &PartitionId) -> CoreResult<PartitionHandle> {
        if let Some(handle) = self.partitions.read().get(id) {
            return Ok(handle.clone());
        }
        let mut partitions = self.partitions.write();
        if let Some(handle) = partitions.get(id) {
            return Ok(handle.clone());
        }
        let partition = Partition::open(self.store.clone(), id.clone(), self.config.clone())?;
        let handle = Arc::new(RwLock::new(partition));
        partitions.insert(id.clone(), handle.clone());
        Ok(handle)
    }

    fn open_or_create(&self, id: &PartitionId) -> CoreResult<PartitionHandle> {
        match self.open_partition(id) {
            Err(CoreError::NotFound { .. }) => match self.create_partition(id) {
                // lost a race with another creator
                Err(CoreError::InvalidArgument { .. }) => self.open_partition(id),
                other => other,
            },
            other => other,
        }
    }

    /// Returns the ids of the open partitions, in name order.
    #[must_use]
    pub fn partitions(&self) -> Vec<PartitionId> {
        let mut ids: Vec<PartitionId> = self.partitions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Returns the ids of every partition stored in the repository
    /// directory; for other stores, the open partitions.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be listed.
    pub fn stored_partitions(&self) -> CoreResult<Vec<PartitionId>> {
        #[cfg(feature = "std")]
        if let Some(dir) = &self.dir {
            return dir.partitions();
        }
        Ok(self.partitions())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Returns the head state of a partition.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown partition, or an open error.
    pub fn read_state(&self, partition: &PartitionId) -> CoreResult<State> {
        Ok(self.open_partition(partition)?.read().state().clone())
    }

    /// Returns the state at any locally known commit of a partition.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown partition or commit.
    pub fn state_at(&self, partition: &PartitionId, commit: CommitId) -> CoreResult<State> {
        self.open_partition(partition)?.write().state_at(commit)
    }

    /// Returns the head commit of a partition.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown partition.
    pub fn head(&self, partition: &PartitionId) -> CoreResult<Option<CommitId>> {
        Ok(self.open_partition(partition)?.read().head())
    }

    /// Returns the checksum of a partition's head state.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown partition.
    pub fn state_checksum(&self, partition: &PartitionId) -> CoreResult<Digest> {
        Ok(self.open_partition(partition)?.read().state_checksum())
    }

    /// Returns where the latest version of an element is stored.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown partition.
    pub fn locate_latest(
        &self,
        partition: &PartitionId,
        element: &ElementId,
    ) -> CoreResult<Option<Location>> {
        Ok(self.open_partition(partition)?.read().locate_latest(element))
    }

    /// Returns the versions of an element in the active generation of a
    /// partition, newest first.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown partition, or a read error.
    pub fn history(
        &self,
        partition: &PartitionId,
        element: &ElementId,
    ) -> CoreResult<Vec<ElementVersion>> {
        self.open_partition(partition)?.read().history(element)
    }

    /// Checks every region of a partition's files.
    ///
    /// Partitions that are not open are checked straight from their files,
    /// so damage that prevents opening is still reported.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown partition, or a storage error.
    pub fn verify(&self, partition: &PartitionId) -> CoreResult<Vec<RegionReport>> {
        let open = self.partitions.read().get(partition).cloned();
        if let Some(handle) = open {
            return handle.read().verify();
        }
        let files = PartitionFiles::new(self.store.clone(), FileNames::for_partition(partition));
        let generation = files
            .current()?
            .ok_or_else(|| CoreError::not_found(format!("partition {partition}")))?;
        partition::verify_files(&files, generation, self.config.group_size)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Appends a commit to a partition. `parent` must be its head.
    ///
    /// # Errors
    ///
    /// See [`Partition::append`].
    pub fn append(
        &self,
        partition: &PartitionId,
        parent: Option<CommitId>,
        changes: Vec<Change>,
    ) -> CoreResult<CommitId> {
        self.open_partition(partition)?.write().append(parent, changes)
    }

    /// Stores a new element in the partition its attributes resolve to,
    /// creating the partition if needed.
    ///
    /// Returns the partition, the new element id and the commit.
    ///
    /// # Errors
    ///
    /// Returns `NoMatchingClassifier` if the attributes resolve nowhere, or
    /// an append error.
    pub fn insert(&self, payload: Payload) -> CoreResult<(PartitionId, ElementId, CommitId)> {
        let partition = self.resolve_partition(&payload)?;
        let handle = self.open_or_create(&partition)?;
        let element = ElementId::new();
        let mut guard = handle.write();
        let head = guard.head();
        let commit = guard.append(head, vec![Change::Put(element, payload)])?;
        Ok((partition, element, commit))
    }

    /// Moves an element between partitions: a departure record in `source`,
    /// then an arrival record with the full payload in `destination`.
    ///
    /// The two appends are independent. If the second fails, the element
    /// stays tombstoned in `source` and the error is returned.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if both partitions are the same or the
    /// element already lives in `destination`, `NotFound` if it is not live
    /// in `source` or a partition is unknown, or an append error.
    pub fn move_element(
        &self,
        element: ElementId,
        source: &PartitionId,
        destination: &PartitionId,
    ) -> CoreResult<(CommitId, CommitId)> {
        if source == destination {
            return Err(CoreError::invalid_argument(format!(
                "cannot move element {element} within partition {source}"
            )));
        }
        let from = self.open_partition(source)?;
        let to = self.open_partition(destination)?;
        if to.read().state().get(&element).is_some() {
            return Err(CoreError::invalid_argument(format!(
                "element {element} already lives in partition {destination}"
            )));
        }

        let (departed, payload) = from.write().move_out(element, destination)?;
        let arrived = to.write().move_in(element, source, payload).map_err(|e| {
            warn!(
                %element,
                source = %source,
                destination = %destination,
                departure = %departed.short(),
                error = %e,
                "arrival failed after departure was recorded"
            );
            e
        })?;
        info!(
            %element,
            source = %source,
            destination = %destination,
            "moved element"
        );
        Ok((departed, arrived))
    }

    /// Merges the branch ending at `other` into a partition's head.
    ///
    /// # Errors
    ///
    /// See [`Partition::merge`].
    pub fn merge<F>(
        &self,
        partition: &PartitionId,
        other: CommitId,
        resolve: F,
    ) -> CoreResult<MergeOutcome>
    where
        F: Fn(ElementId, Option<&Payload>, &MergeSide<'_>, &MergeSide<'_>) -> Resolution,
    {
        self.merge_with_cancel(partition, other, resolve, &CancelToken::new())
    }

    /// Like [`Repository::merge`], stopping early once `cancel` is set.
    ///
    /// # Errors
    ///
    /// See [`Partition::merge`].
    pub fn merge_with_cancel<F>(
        &self,
        partition: &PartitionId,
        other: CommitId,
        resolve: F,
        cancel: &CancelToken,
    ) -> CoreResult<MergeOutcome>
    where
        F: Fn(ElementId, Option<&Payload>, &MergeSide<'_>, &MergeSide<'_>) -> Resolution,
    {
        self.open_partition(partition)?
            .write()
            .merge(other, resolve, cancel)
    }

    /// Writes a snapshot of a partition's head state as a new generation.
    ///
    /// # Errors
    ///
    /// See [`Partition::snapshot`].
    pub fn snapshot(&self, partition: &PartitionId) -> CoreResult<u64> {
        self.open_partition(partition)?.write().snapshot()
    }

    /// Folds a partition's history according to `policy`.
    ///
    /// # Errors
    ///
    /// See [`Partition::compact`].
    pub fn compact(&self, partition: &PartitionId, policy: &RetentionPolicy) -> CoreResult<u64> {
        self.compact_with_cancel(partition, policy, &CancelToken::new())
    }

    /// Like [`Repository::compact`], stopping early once `cancel` is set.
    ///
    /// # Errors
    ///
    /// See [`Partition::compact`].
    pub fn compact_with_cancel(
        &self,
        partition: &PartitionId,
        policy: &RetentionPolicy,
        cancel: &CancelToken,
    ) -> CoreResult<u64> {
        self.open_partition(partition)?.write().compact(policy, cancel)
    }

    // ========================================================================
    // Replication
    // ========================================================================

    /// Returns the serialized record of a commit.
    ///
    /// # Errors
    ///
    /// See [`Partition::export_commit`].
    pub fn export_commit(&self, partition: &PartitionId, id: &CommitId) -> CoreResult<Vec<u8>> {
        self.open_partition(partition)?.write().export_commit(id)
    }

    /// Verifies and stores foreign commits as merge candidates.
    ///
    /// # Errors
    ///
    /// See [`Partition::import_commits`].
    pub fn import_commits(
        &self,
        partition: &PartitionId,
        records: &[Vec<u8>],
    ) -> CoreResult<ImportReport> {
        self.open_partition(partition)?
            .write()
            .import_commits(records)
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("partitions", &self.partitions())
            .field("classifiers", &self.classifiers.read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::FieldClassifier;
    use crate::layout::Location;
    use crate::partition::RegionStatus;

    fn pid(name: &str) -> PartitionId {
        PartitionId::new(name).unwrap()
    }

    fn repo() -> Repository {
        let repo = Repository::in_memory(Config::new().header_capacity(16)).unwrap();
        repo.register_classifier(Arc::new(
            FieldClassifier::new("folder").route("archive", pid("archive")),
        ));
        repo.set_fallback(pid("inbox"));
        repo
    }

    #[test]
    fn insert_routes_and_creates_partitions() {
        let repo = repo();
        let (p1, e1, _) = repo.insert(Payload::new().with("subject", "hi")).unwrap();
        let (p2, _, _) = repo
            .insert(Payload::new().with("folder", "archive"))
            .unwrap();
        assert_eq!(p1, pid("inbox"));
        assert_eq!(p2, pid("archive"));
        assert_eq!(repo.partitions(), vec![pid("archive"), pid("inbox")]);
        assert_eq!(
            repo.read_state(&p1).unwrap().payload(&e1).and_then(|p| p.text("subject")),
            Some("hi")
        );
    }

    #[test]
    fn unrouted_insert_fails_without_fallback() {
        let repo = Repository::in_memory(Config::new()).unwrap();
        assert!(matches!(
            repo.insert(Payload::new()),
            Err(CoreError::NoMatchingClassifier)
        ));
    }

    #[test]
    fn append_requires_head_as_parent() {
        let repo = repo();
        let inbox = pid("inbox");
        repo.create_partition(&inbox).unwrap();
        let e = ElementId::new();
        let c1 = repo
            .append(&inbox, None, vec![Change::Put(e, Payload::new().with("n", 1_i64))])
            .unwrap();
        assert!(matches!(
            repo.append(&inbox, None, vec![Change::Delete(e)]),
            Err(CoreError::StaleParent { .. })
        ));
        repo.append(&inbox, Some(c1), vec![Change::Delete(e)]).unwrap();
        assert!(repo.read_state(&inbox).unwrap().is_empty());
    }

    #[test]
    fn move_round_trip() {
        let repo = repo();
        let (inbox, element, _) = repo.insert(Payload::new().with("subject", "x")).unwrap();
        let archive = pid("archive");
        repo.create_partition(&archive).unwrap();
        assert!(repo.read_state(&archive).unwrap().get(&element).is_none());

        repo.move_element(element, &inbox, &archive).unwrap();
        assert!(repo.read_state(&archive).unwrap().get(&element).is_some());
        let source = repo.read_state(&inbox).unwrap();
        assert!(source.get(&element).is_none());
        assert_eq!(source.tombstone(&element).unwrap().destination, archive);

        assert!(matches!(
            repo.move_element(element, &archive, &archive),
            Err(CoreError::InvalidArgument { .. })
        ));
        assert!(matches!(
            repo.move_element(element, &inbox, &archive),
            Err(CoreError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn unknown_partition_is_not_found() {
        let repo = repo();
        assert!(matches!(
            repo.read_state(&pid("nowhere")),
            Err(CoreError::NotFound { .. })
        ));
        assert!(matches!(
            repo.verify(&pid("nowhere")),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let repo = repo();
        repo.create_partition(&pid("inbox")).unwrap();
        assert!(matches!(
            repo.create_partition(&pid("inbox")),
            Err(CoreError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn reopen_from_directory() {
        let temp = tempfile::tempdir().unwrap();
        let (element, head, checksum) = {
            let repo = Repository::open(temp.path()).unwrap();
            repo.set_fallback(pid("inbox"));
            let (_, element, head) = repo.insert(Payload::new().with("subject", "kept")).unwrap();
            (element, head, repo.state_checksum(&pid("inbox")).unwrap())
        };

        let repo = Repository::open(temp.path()).unwrap();
        assert_eq!(repo.stored_partitions().unwrap(), vec![pid("inbox")]);
        assert_eq!(repo.head(&pid("inbox")).unwrap(), Some(head));
        assert_eq!(repo.state_checksum(&pid("inbox")).unwrap(), checksum);
        assert!(matches!(
            repo.locate_latest(&pid("inbox"), &element).unwrap(),
            Some(Location::Block { generation: 0, .. })
        ));
        let reports = repo.verify(&pid("inbox")).unwrap();
        assert!(reports.iter().all(|r| r.status == RegionStatus::Ok));
    }

    #[test]
    fn second_open_is_locked() {
        let temp = tempfile::tempdir().unwrap();
        let _repo = Repository::open(temp.path()).unwrap();
        assert!(matches!(
            Repository::open(temp.path()),
            Err(CoreError::RepositoryLocked)
        ));
    }
}
