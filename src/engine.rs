//! The `Rewind` engine
//!
//! [`Rewind`] is the entry point collaborators call into. It ties the
//! components together and enforces the concurrency rules:
//!
//! - **Content Store** and **Checkpoint Index** persist everything under one
//!   storage directory shared by any number of sessions
//! - captures, restores and GC take the session lock (see
//!   [`SessionLocks`](crate::session::SessionLocks)); reads take none
//! - long operations can be moved onto the bounded worker pool with
//!   [`spawn_checkpoint`](Rewind::spawn_checkpoint) and
//!   [`spawn_restore`](Rewind::spawn_restore)
//! - every created checkpoint and every committed restore is published on
//!   the event bus
//!
//! The engine is cheap to clone; clones share all state.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use rewind::Rewind;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Rewind::builder()
//!     .ignore_patterns(vec!["*.log".to_string(), "node_modules/**".to_string()])
//!     .parallel_workers(4)
//!     .build("./.rewind")?;
//!
//! engine.register_session("s1", "./project")?;
//! let first = engine.checkpoint("s1", "before refactor")?;
//!
//! // ... files change ...
//! engine.checkpoint("s1", "after refactor")?;
//!
//! // Go back; the state just before the restore is kept as a checkpoint
//! engine.restore("s1", &first.id)?;
//! # Ok(())
//! # }
//! ```

use crate::checkpoint::{Checkpoint, CheckpointKind};
use crate::collections::{concurrent_map, fast_set, ConcurrentMap};
use crate::compression::CompressionStrategy;
use crate::diff::{diff_trees, Delta, DeltaSet, LineDetail};
use crate::error::{Result, RewindError};
use crate::events::{EngineEvent, EventBus};
use crate::index::{CheckpointIndex, Snapshot};
use crate::path_cache::{Clock, PathCache, PathCacheConfig, PathCacheStats, SystemClock};
use crate::restore::{ApplyObserver, RestoreCoordinator, RestoreOptions, RestoreReport};
use crate::session::{OperationKind, SessionLocks};
use crate::store::{ContentStore, StoreStats};
use crate::timeline::{TimelineNode, TimelineStats};
use crate::tree::{CaptureOptions, IgnoreMatcher, IgnorePredicate, TreeBuilder, TreeManifest};
use crate::types::{CheckpointMetrics, DiffOptions, GcStats, RewindConfig, SessionInfo};
use crate::verification::{self, CheckpointVerifier, RepairReport, SessionVerificationReport, VerificationReport};
use crate::worker::{CancelToken, OperationHandle, WorkerPool};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

struct Inner {
    config: RewindConfig,
    storage_path: PathBuf,
    store: Arc<ContentStore>,
    index: CheckpointIndex,
    pool: WorkerPool,
    locks: SessionLocks,
    events: EventBus,
    paths: PathCache,
    custom_ignore: Option<IgnorePredicate>,
    session_ignores: ConcurrentMap<String, IgnorePredicate>,
}

/// Checkpoint engine over one storage directory
///
/// # Examples
///
/// ```rust,no_run
/// use rewind::Rewind;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let engine = Rewind::init("./.rewind")?;
/// engine.register_session("s1", "./project")?;
/// let checkpoint = engine.checkpoint("s1", "initial state")?;
/// println!("{}", checkpoint.display_format());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Rewind {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Rewind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rewind")
            .field("storage_path", &self.inner.storage_path)
            .field("workers", &self.inner.pool.workers())
            .field("locks", &self.inner.locks)
            .finish()
    }
}

impl Rewind {
    /// Builder for a customized engine
    pub fn builder() -> RewindBuilder {
        RewindBuilder::new()
    }

    /// Initialize new storage with the default configuration
    ///
    /// # Errors
    ///
    /// - [`RewindError::StorageAlreadyExists`] if storage is already there
    pub fn init(storage_path: impl AsRef<Path>) -> Result<Self> {
        let storage_path = storage_path.as_ref();
        let config = RewindConfig {
            storage_path: storage_path.to_path_buf(),
            ..Default::default()
        };
        let store = ContentStore::init(storage_path, config.clone())?;
        Self::assemble(store, config, None, Arc::new(SystemClock))
    }

    /// Open existing storage with the configuration it was created with
    ///
    /// # Errors
    ///
    /// - [`RewindError::StorageNotInitialized`] if there is no storage
    pub fn open(storage_path: impl AsRef<Path>) -> Result<Self> {
        let store = ContentStore::open(storage_path.as_ref())?;
        let config = store.metadata().config.clone();
        Self::assemble(store, config, None, Arc::new(SystemClock))
    }

    fn assemble(
        store: ContentStore,
        config: RewindConfig,
        custom_ignore: Option<IgnorePredicate>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        // Validate patterns once so later captures cannot fail on them
        IgnoreMatcher::new(&config.ignore_patterns)?;

        let storage_path = fs::canonicalize(store.root())
            .map_err(|e| RewindError::io_at("canonicalize", store.root(), e))?;
        let store = Arc::new(store);
        let index = CheckpointIndex::open(Arc::clone(&store))?;
        let pool = WorkerPool::new(config.parallel_workers)?;
        let paths = PathCache::with_clock(
            PathCacheConfig {
                ttl: config.path_cache_ttl,
                max_entries: config.path_cache_max_entries,
            },
            clock,
        );

        info!(
            "Opened engine at {:?} with {} worker(s)",
            storage_path,
            pool.workers()
        );
        Ok(Self {
            inner: Arc::new(Inner {
                events: EventBus::new(config.event_capacity),
                config,
                storage_path,
                store,
                index,
                pool,
                locks: SessionLocks::new(),
                paths,
                custom_ignore,
                session_ignores: concurrent_map(16),
            }),
        })
    }

    /// Configuration in effect
    pub fn config(&self) -> &RewindConfig {
        &self.inner.config
    }

    /// Canonical storage directory
    pub fn storage_path(&self) -> &Path {
        &self.inner.storage_path
    }

    /// Content store shared by every session
    pub fn store(&self) -> &ContentStore {
        &self.inner.store
    }

    /// Checkpoint index
    pub fn index(&self) -> &CheckpointIndex {
        &self.inner.index
    }

    // ---------------------------------------------------------------------
    // Sessions
    // ---------------------------------------------------------------------

    /// Register a session's working directory
    ///
    /// Idempotent; registering again with another root moves the session.
    ///
    /// # Errors
    ///
    /// - [`RewindError::InvalidSessionId`] for an id that cannot name a directory
    /// - [`RewindError::IoAt`] if `root` does not exist
    pub fn register_session(&self, session_id: &str, root: impl AsRef<Path>) -> Result<SessionInfo> {
        let root = root.as_ref();
        self.inner.paths.invalidate(root);
        let resolved = self.inner.paths.resolve(root)?;
        self.inner.index.register_session(session_id, &resolved)
    }

    /// Register a session with an extra ignore predicate
    ///
    /// The predicate applies on top of the configured glob patterns.
    pub fn register_session_with_ignore(
        &self,
        session_id: &str,
        root: impl AsRef<Path>,
        ignore: IgnorePredicate,
    ) -> Result<SessionInfo> {
        let info = self.register_session(session_id, root)?;
        self.inner.session_ignores.insert(session_id.to_string(), ignore);
        Ok(info)
    }

    /// Every registered session
    pub fn sessions(&self) -> Result<Vec<SessionInfo>> {
        self.inner.index.sessions()
    }

    /// Archive or delete a session
    ///
    /// Content is only reclaimed by the next [`gc`](Self::gc).
    pub fn remove_session(&self, session_id: &str, archive: bool) -> Result<()> {
        let _guard = self.inner.locks.acquire(session_id, OperationKind::Gc)?;
        self.inner.index.remove_session(session_id, archive)?;
        self.inner.session_ignores.remove(session_id);
        Ok(())
    }

    fn session_root(&self, session_id: &str) -> Result<PathBuf> {
        let info = self.inner.index.session(session_id)?;
        self.inner.paths.resolve(&info.root)
    }

    fn ignore_for(&self, session_id: &str, root: &Path) -> Result<IgnorePredicate> {
        let base = IgnoreMatcher::new(&self.inner.config.ignore_patterns)?
            .exclude_dir(&self.inner.storage_path)
            .into_predicate(root);
        let extra: Vec<IgnorePredicate> = self
            .inner
            .custom_ignore
            .iter()
            .cloned()
            .chain(
                self.inner
                    .session_ignores
                    .get(session_id)
                    .map(|p| Arc::clone(p.value())),
            )
            .collect();
        if extra.is_empty() {
            return Ok(base);
        }
        Ok(Arc::new(move |path: &Path| {
            base(path) || extra.iter().any(|predicate| predicate(path))
        }))
    }

    fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            max_file_size: self.inner.config.max_file_size,
            respect_gitignore: self.inner.config.respect_gitignore,
            hash_only: false,
        }
    }

    fn tree_builder(&self) -> TreeBuilder<'_> {
        TreeBuilder::new(&self.inner.store, &self.inner.pool).with_options(self.capture_options())
    }

    // ---------------------------------------------------------------------
    // Capture
    // ---------------------------------------------------------------------

    /// Capture the session's working directory as a new checkpoint
    ///
    /// The new checkpoint is a child of the session's current checkpoint and
    /// becomes current.
    ///
    /// # Errors
    ///
    /// - [`RewindError::ConcurrencyConflict`] if the session is busy
    /// - [`RewindError::CaptureIncomplete`] if a file could not be read;
    ///   nothing is recorded and the capture can be retried
    pub fn checkpoint(&self, session_id: &str, message: &str) -> Result<Checkpoint> {
        Ok(self
            .checkpoint_with(session_id, message, &CancelToken::new())?
            .checkpoint)
    }

    /// Capture with cancellation, returning capture counters too
    ///
    /// A cancelled capture returns [`RewindError::Cancelled`] and leaves no
    /// checkpoint behind.
    #[instrument(skip(self, cancel))]
    pub fn checkpoint_with(
        &self,
        session_id: &str,
        message: &str,
        cancel: &CancelToken,
    ) -> Result<Snapshot> {
        let root = self.session_root(session_id)?;
        let _guard = self.inner.locks.acquire(session_id, OperationKind::Capture)?;
        self.snapshot_locked(session_id, &root, message, CheckpointKind::Manual, cancel)
    }

    fn snapshot_locked(
        &self,
        session_id: &str,
        root: &Path,
        message: &str,
        kind: CheckpointKind,
        cancel: &CancelToken,
    ) -> Result<Snapshot> {
        let start = Instant::now();
        let ignore = self.ignore_for(session_id, root)?;
        let builder = self.tree_builder();
        let snapshot = self
            .inner
            .index
            .snapshot(&builder, session_id, root, &ignore, message, kind, cancel)?;
        self.publish_created(&snapshot.checkpoint);

        info!(
            "Checkpoint {} of {}: {} entries, {} new blob(s) in {:?}",
            snapshot.checkpoint.short_id(),
            session_id,
            snapshot.stats.entries,
            snapshot.stats.blobs_written,
            start.elapsed()
        );
        Ok(snapshot)
    }

    fn publish_created(&self, checkpoint: &Checkpoint) {
        self.inner.events.publish(EngineEvent::CheckpointCreated {
            session_id: checkpoint.session_id.clone(),
            checkpoint_id: checkpoint.id.clone(),
            parent_id: checkpoint.parent_id.clone(),
            message: checkpoint.message.clone(),
            at: checkpoint.created_at,
        });
    }

    /// Run [`checkpoint_with`](Self::checkpoint_with) on the worker pool
    pub fn spawn_checkpoint(&self, session_id: &str, message: &str) -> OperationHandle<Checkpoint> {
        let engine = self.clone();
        let session_id = session_id.to_string();
        let message = message.to_string();
        self.inner.pool.spawn(move |cancel| {
            engine
                .checkpoint_with(&session_id, &message, cancel)
                .map(|snapshot| snapshot.checkpoint)
        })
    }

    /// Paths that changed since the current checkpoint
    ///
    /// Hashes the working directory without storing anything and without
    /// taking the session lock.
    pub fn status(&self, session_id: &str) -> Result<DeltaSet> {
        let root = self.session_root(session_id)?;
        let ignore = self.ignore_for(session_id, &root)?;
        let live = TreeBuilder::new(&self.inner.store, &self.inner.pool)
            .with_options(CaptureOptions {
                hash_only: true,
                ..self.capture_options()
            })
            .capture(&root, &ignore)?;
        let current = match self.inner.index.current(session_id)? {
            Some(current) => self.inner.store.get_tree(&current.tree_hash)?,
            None => TreeManifest::new(),
        };
        Ok(diff_trees(&current, &live))
    }

    // ---------------------------------------------------------------------
    // Restore
    // ---------------------------------------------------------------------

    /// Restore the session's working directory to `target_id`
    ///
    /// A pre-restore checkpoint of the live state is always created first.
    /// On success the target becomes current, so the next checkpoint forks
    /// from it.
    ///
    /// # Returns
    ///
    /// The checkpoint that is now current.
    ///
    /// # Errors
    ///
    /// - [`RewindError::NotFound`] if the target is not part of the session
    /// - [`RewindError::ConcurrencyConflict`] if the session is busy
    /// - [`RewindError::RestoreFailed`] with the paths not applied
    pub fn restore(&self, session_id: &str, target_id: &str) -> Result<Checkpoint> {
        Ok(self
            .restore_with_report(session_id, target_id, RestoreOptions::default(), &CancelToken::new())?
            .target)
    }

    /// Restore with options and cancellation, returning the full report
    #[instrument(skip(self, options, cancel))]
    pub fn restore_with_report(
        &self,
        session_id: &str,
        target_id: &str,
        options: RestoreOptions,
        cancel: &CancelToken,
    ) -> Result<RestoreReport> {
        let root = self.session_root(session_id)?;
        let target = self.inner.index.resolve(session_id, target_id)?;
        let _guard = self.inner.locks.acquire(session_id, OperationKind::Restore)?;
        self.restore_locked(session_id, &root, &target.id, options, cancel, None)
    }

    /// Like [`restore_with_report`](Self::restore_with_report), reporting
    /// each path to `observer` as soon as it is applied
    pub fn restore_with_progress(
        &self,
        session_id: &str,
        target_id: &str,
        options: RestoreOptions,
        cancel: &CancelToken,
        observer: ApplyObserver,
    ) -> Result<RestoreReport> {
        let root = self.session_root(session_id)?;
        let target = self.inner.index.resolve(session_id, target_id)?;
        let _guard = self.inner.locks.acquire(session_id, OperationKind::Restore)?;
        self.restore_locked(session_id, &root, &target.id, options, cancel, Some(observer))
    }

    fn restore_locked(
        &self,
        session_id: &str,
        root: &Path,
        target_id: &str,
        options: RestoreOptions,
        cancel: &CancelToken,
        observer: Option<ApplyObserver>,
    ) -> Result<RestoreReport> {
        let previous = self.inner.index.current(session_id)?.map(|c| c.id);
        let ignore = self.ignore_for(session_id, root)?;
        let builder = self.tree_builder();
        let mut coordinator = RestoreCoordinator::new(&self.inner.index, &builder, &ignore).with_options(options);
        if let Some(observer) = observer {
            coordinator = coordinator.with_observer(observer);
        }
        let result = coordinator.run(session_id, root, target_id, cancel);

        let report = match result {
            Ok(report) => report,
            Err(err) => {
                // The pre-restore checkpoint may exist even though applying failed
                if let Ok(Some(current)) = self.inner.index.current(session_id) {
                    if current.is_pre_restore() && Some(&current.id) != previous.as_ref() {
                        self.publish_created(&current);
                    }
                }
                return Err(err);
            }
        };

        if let Some(pre_restore) = &report.pre_restore {
            self.publish_created(pre_restore);
            self.inner.events.publish(EngineEvent::RestoreCompleted {
                session_id: session_id.to_string(),
                target_checkpoint_id: report.target.id.clone(),
                pre_restore_checkpoint_id: pre_restore.id.clone(),
                files_changed: report.files_changed(),
                at: Utc::now(),
            });
        }
        Ok(report)
    }

    /// Run [`restore_with_report`](Self::restore_with_report) on the worker pool
    ///
    /// Cancelling the handle before files are touched aborts cleanly; a
    /// cancel while applying stops after the current file and surfaces as
    /// [`RewindError::RestoreFailed`].
    pub fn spawn_restore(&self, session_id: &str, target_id: &str) -> OperationHandle<RestoreReport> {
        let engine = self.clone();
        let session_id = session_id.to_string();
        let target_id = target_id.to_string();
        self.inner.pool.spawn(move |cancel| {
            engine.restore_with_report(&session_id, &target_id, RestoreOptions::default(), cancel)
        })
    }

    /// Restore to `from_id` and record a new checkpoint branching from it
    ///
    /// Both steps run under one session lock.
    #[instrument(skip(self))]
    pub fn fork(&self, session_id: &str, from_id: &str, message: &str) -> Result<Checkpoint> {
        let root = self.session_root(session_id)?;
        let from = self.inner.index.resolve(session_id, from_id)?;
        let _guard = self.inner.locks.acquire(session_id, OperationKind::Restore)?;
        let cancel = CancelToken::new();
        self.restore_locked(session_id, &root, &from.id, RestoreOptions::default(), &cancel, None)?;
        let snapshot = self.snapshot_locked(session_id, &root, message, CheckpointKind::Fork, &cancel)?;
        info!("Forked {} from {}", snapshot.checkpoint.short_id(), from.short_id());
        Ok(snapshot.checkpoint)
    }

    // ---------------------------------------------------------------------
    // History (lock-free reads)
    // ---------------------------------------------------------------------

    /// Look up a checkpoint by id
    pub fn get(&self, checkpoint_id: &str) -> Result<Checkpoint> {
        self.inner.index.get(checkpoint_id)
    }

    /// Resolve a full id or unique prefix within a session
    pub fn resolve(&self, session_id: &str, prefix: &str) -> Result<Checkpoint> {
        self.inner.index.resolve(session_id, prefix)
    }

    /// A session's checkpoints in creation order
    pub fn list(&self, session_id: &str) -> Result<Vec<Checkpoint>> {
        self.inner.index.list(session_id)?.collect()
    }

    /// Parent chain of a checkpoint, nearest first
    pub fn ancestors(&self, checkpoint_id: &str) -> Result<Vec<Checkpoint>> {
        self.inner.index.ancestors(checkpoint_id)
    }

    /// Lowest common ancestor of two checkpoints
    pub fn common_ancestor(&self, a: &str, b: &str) -> Result<Option<Checkpoint>> {
        self.inner.index.common_ancestor(a, b)
    }

    /// The session's current checkpoint
    pub fn current(&self, session_id: &str) -> Result<Option<Checkpoint>> {
        self.inner.index.current(session_id)
    }

    /// History of a session as a forest rooted at its first checkpoints
    pub fn timeline(&self, session_id: &str) -> Result<Vec<TimelineNode>> {
        Ok(self.inner.index.timeline(session_id)?.read().to_tree_nodes())
    }

    /// Shape statistics of a session's history
    pub fn timeline_stats(&self, session_id: &str) -> Result<TimelineStats> {
        self.inner.index.timeline_stats(session_id)
    }

    /// Per-checkpoint metrics computed on the worker pool
    ///
    /// Every checkpoint is diffed against its parent; the call returns once
    /// all of them are done.
    pub fn session_metrics(&self, session_id: &str) -> Result<Vec<CheckpointMetrics>> {
        let checkpoints: Vec<Checkpoint> = self.inner.index.list(session_id)?.collect::<Result<_>>()?;
        let index = &self.inner.index;
        let store = &self.inner.store;
        self.inner
            .pool
            .map_all(checkpoints, |checkpoint| {
                let tree = store.get_tree(&checkpoint.tree_hash)?;
                let parent = match &checkpoint.parent_id {
                    Some(parent_id) => store.get_tree(&index.get(parent_id)?.tree_hash)?,
                    None => TreeManifest::new(),
                };
                Ok(CheckpointMetrics {
                    file_count: tree.len(),
                    total_size: tree.total_size(),
                    changes: diff_trees(&parent, &tree).stats(),
                    checkpoint_id: checkpoint.id,
                })
            })
            .into_iter()
            .collect()
    }

    // ---------------------------------------------------------------------
    // Diff
    // ---------------------------------------------------------------------

    /// File-level changes from checkpoint `from_id` to checkpoint `to_id`
    pub fn diff(&self, from_id: &str, to_id: &str) -> Result<DeltaSet> {
        let from = self.inner.index.get(from_id)?;
        let to = self.inner.index.get(to_id)?;
        let from_tree = self.inner.store.get_tree(&from.tree_hash)?;
        let to_tree = self.inner.store.get_tree(&to.tree_hash)?;
        Ok(diff_trees(&from_tree, &to_tree))
    }

    /// Line detail for one delta
    pub fn line_detail(&self, delta: &Delta, options: &DiffOptions) -> Result<LineDetail> {
        delta.line_detail(&self.inner.store, options)
    }

    /// File-level changes with line detail for every delta
    pub fn diff_detailed(
        &self,
        from_id: &str,
        to_id: &str,
        options: &DiffOptions,
    ) -> Result<Vec<(Delta, LineDetail)>> {
        self.diff(from_id, to_id)?
            .into_iter()
            .map(|delta| {
                let detail = delta.line_detail(&self.inner.store, options)?;
                Ok((delta, detail))
            })
            .collect()
    }

    // ---------------------------------------------------------------------
    // Maintenance
    // ---------------------------------------------------------------------

    /// Delete content no session references
    ///
    /// Never runs on its own. Fails fast with
    /// [`RewindError::ConcurrencyConflict`] while any capture or restore is
    /// in flight.
    pub fn gc(&self) -> Result<GcStats> {
        self.collect_garbage(false)
    }

    /// Report what [`gc`](Self::gc) would delete
    pub fn gc_analyze(&self) -> Result<GcStats> {
        self.collect_garbage(true)
    }

    #[instrument(skip(self))]
    fn collect_garbage(&self, dry_run: bool) -> Result<GcStats> {
        let start = Instant::now();
        let sessions: Vec<String> = self
            .inner
            .index
            .sessions()?
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        let _guard = self.inner.locks.acquire_gc(&sessions)?;

        let live = self.inner.index.live_checkpoints()?;
        let mut live_ids = fast_set();
        let mut live_trees = fast_set();
        let mut live_blobs = fast_set();
        for checkpoint in &live {
            live_ids.insert(checkpoint.id.as_str());
            match self.inner.store.get_tree(&checkpoint.tree_hash) {
                Ok(manifest) => live_blobs.extend(manifest.blob_hashes().cloned()),
                Err(RewindError::NotFound { .. }) => {
                    warn!("Checkpoint {} has no tree; skipping", checkpoint.short_id())
                }
                Err(e) => return Err(e),
            }
            live_trees.insert(checkpoint.tree_hash.clone());
        }

        let store = &self.inner.store;
        let (trees, blobs) = if dry_run {
            (store.find_unreferenced_trees(&live_trees)?, store.find_unreferenced(&live_blobs)?)
        } else {
            (store.delete_unreferenced_trees(&live_trees)?, store.delete_unreferenced(&live_blobs)?)
        };

        let mut records_deleted = 0;
        for id in self.inner.index.record_ids()? {
            if live_ids.contains(id.as_str()) {
                continue;
            }
            if !dry_run {
                self.inner.index.delete_record(&id)?;
            }
            records_deleted += 1;
        }
        if !dry_run {
            store.clean_tmp()?;
        }

        let mut unreferenced = trees.unreferenced;
        unreferenced.extend(blobs.unreferenced);
        let stats = GcStats {
            blobs_examined: blobs.blobs_examined,
            blobs_deleted: blobs.blobs_deleted,
            trees_examined: trees.trees_examined,
            trees_deleted: trees.trees_deleted,
            records_deleted,
            bytes_reclaimed: trees.bytes_reclaimed + blobs.bytes_reclaimed,
            duration_ms: start.elapsed().as_millis() as u64,
            unreferenced,
            dry_run,
        };
        info!(
            "GC{}: {} blob(s), {} tree(s), {} record(s) unreferenced, {} bytes",
            if dry_run { " (dry run)" } else { "" },
            stats.blobs_deleted,
            stats.trees_deleted,
            stats.records_deleted,
            stats.bytes_reclaimed
        );
        Ok(stats)
    }

    /// Verify one checkpoint and its content
    pub fn verify_checkpoint(&self, checkpoint_id: &str) -> Result<VerificationReport> {
        let checkpoint = self.inner.index.get(checkpoint_id)?;
        CheckpointVerifier::new(&self.inner.index).verify_complete(&checkpoint)
    }

    /// Verify every checkpoint of a session and its history structure
    pub fn verify_session(&self, session_id: &str) -> Result<SessionVerificationReport> {
        CheckpointVerifier::new(&self.inner.index).verify_session(session_id)
    }

    /// Quarantine corrupted objects and list the checkpoints they damaged
    ///
    /// Holds the GC lock, so it fails fast while other operations run.
    pub fn repair(&self) -> Result<RepairReport> {
        let sessions: Vec<String> = self
            .inner
            .index
            .sessions()?
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        let _guard = self.inner.locks.acquire_gc(&sessions)?;

        let mut report = verification::repair(&self.inner.store)?;
        let store = &self.inner.store;
        for checkpoint in self.inner.index.live_checkpoints()? {
            let intact = store
                .get_tree(&checkpoint.tree_hash)
                .map(|manifest| manifest.blob_hashes().all(|hash| store.exists(hash)))
                .unwrap_or(false);
            if !intact {
                report.damaged_checkpoints.push(checkpoint.id);
            }
        }
        if !report.damaged_checkpoints.is_empty() {
            warn!(
                "{} checkpoint(s) reference missing content",
                report.damaged_checkpoints.len()
            );
        }
        Ok(report)
    }

    // ---------------------------------------------------------------------
    // Observability
    // ---------------------------------------------------------------------

    /// Subscribe to checkpoint and restore events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Store activity counters
    pub fn store_stats(&self) -> StoreStats {
        self.inner.store.stats()
    }

    /// Path cache counters
    pub fn path_cache_stats(&self) -> PathCacheStats {
        self.inner.paths.stats()
    }

    /// Operation currently holding a session, if any
    pub fn busy_with(&self, session_id: &str) -> Option<OperationKind> {
        self.inner.locks.holder(session_id)
    }
}

/// Builder for [`Rewind`]
///
/// Settings apply to the engine being built. When the storage already
/// exists its blob compression strategy is kept, since existing blobs were
/// framed with it.
///
/// # Examples
///
/// ```rust,no_run
/// use rewind::{CompressionStrategy, RewindBuilder};
/// use std::time::Duration;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let engine = RewindBuilder::new()
///     .compression_strategy(CompressionStrategy::None)
///     .max_file_size(50 * 1024 * 1024)
///     .path_cache_ttl(Duration::from_secs(5))
///     .build("./.rewind")?;
/// # Ok(())
/// # }
/// ```
pub struct RewindBuilder {
    config: RewindConfig,
    ignore_predicate: Option<IgnorePredicate>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RewindBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RewindBuilder")
            .field("config", &self.config)
            .field("custom_ignore", &self.ignore_predicate.is_some())
            .finish()
    }
}

impl RewindBuilder {
    /// Builder with the default configuration
    pub fn new() -> Self {
        Self {
            config: RewindConfig::default(),
            ignore_predicate: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the ignore globs
    pub fn ignore_patterns(mut self, patterns: Vec<String>) -> Self {
        self.config.ignore_patterns = patterns;
        self
    }

    /// Add one ignore glob to the current set
    pub fn add_ignore_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.config.ignore_patterns.push(pattern.into());
        self
    }

    /// Extra predicate applied to every session
    pub fn ignore_predicate(mut self, predicate: IgnorePredicate) -> Self {
        self.ignore_predicate = Some(predicate);
        self
    }

    /// Blob framing for new storage
    pub fn compression_strategy(mut self, strategy: CompressionStrategy) -> Self {
        self.config.compression_strategy = strategy;
        self
    }

    /// Skip files larger than `size` bytes (0 = unlimited)
    pub fn max_file_size(mut self, size: u64) -> Self {
        self.config.max_file_size = size;
        self
    }

    /// Threads in the bounded worker pool
    pub fn parallel_workers(mut self, count: usize) -> Self {
        self.config.parallel_workers = count.max(1);
        self
    }

    /// Honour `.gitignore` files during capture
    pub fn respect_gitignore(mut self, respect: bool) -> Self {
        self.config.respect_gitignore = respect;
        self
    }

    /// Path cache sizing
    pub fn path_cache(mut self, config: PathCacheConfig) -> Self {
        self.config.path_cache_ttl = config.ttl;
        self.config.path_cache_max_entries = config.max_entries;
        self
    }

    /// Lifetime of a resolved session root
    pub fn path_cache_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.config.path_cache_ttl = ttl;
        self
    }

    /// Clock used by the path cache
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Events buffered per subscriber
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Open storage at `storage_path`, initializing it if absent
    pub fn build(mut self, storage_path: impl AsRef<Path>) -> Result<Rewind> {
        let storage_path = storage_path.as_ref();
        self.config.storage_path = storage_path.to_path_buf();
        let store = ContentStore::init_or_open(storage_path, self.config.clone())?;
        self.config.compression_strategy = store.metadata().config.compression_strategy.clone();
        debug!("Building engine with {:?}", self.config);
        Rewind::assemble(store, self.config, self.ignore_predicate, self.clock)
    }
}

impl Default for RewindBuilder {
    fn default() -> Self {
        Self::new()
    }
}
