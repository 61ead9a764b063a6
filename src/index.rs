//! Persistent checkpoint index
//!
//! The index owns every checkpoint record and each session's current
//! pointer. On disk:
//!
//! ```text
//! checkpoints/<id>.json        immutable record, written once
//! sessions/<sid>/session.json  registration (root, archived flag)
//! sessions/<sid>/log           checkpoint ids in creation order
//! sessions/<sid>/current.json  current pointer
//! ```
//!
//! A record is persisted before its id is appended to the session log, and
//! the log before the pointer moves. A crash between the steps leaves at
//! most an orphan record that no listing reaches.
//!
//! In memory each session is a [`Timeline`] arena behind its own `RwLock`,
//! loaded on first use. Reads clone what they need out of the arena and
//! never hold the lock across I/O.

use crate::checkpoint::{Checkpoint, CheckpointKind, CheckpointMetadata, CheckpointMetadataBuilder};
use crate::collections::{concurrent_map, fast_set, ConcurrentMap, FastSet};
use crate::error::{Result, RewindError};
use crate::store::{ContentStore, TreeHash};
use crate::diff::diff_trees;
use crate::timeline::{Timeline, TimelineStats};
use crate::tree::{CaptureStats, IgnorePredicate, TreeBuilder, TreeManifest};
use crate::worker::CancelToken;
use crate::types::{CurrentPointer, SessionInfo, FORMAT_VERSION};
use crate::utils::{self, short_id};
use chrono::Utc;
use parking_lot::RwLock;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, trace, warn};

/// Checkpoint records and per-session timelines
pub struct CheckpointIndex {
    root: PathBuf,
    store: Arc<ContentStore>,
    timelines: ConcurrentMap<String, Arc<RwLock<Timeline>>>,
    records: ConcurrentMap<String, Checkpoint>,
}

impl std::fmt::Debug for CheckpointIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointIndex")
            .field("root", &self.root)
            .field("loaded_sessions", &self.timelines.len())
            .finish()
    }
}

impl CheckpointIndex {
    /// Open the index that lives next to `store`
    pub fn open(store: Arc<ContentStore>) -> Result<Self> {
        let root = store.root().to_path_buf();
        for dir in ["checkpoints", "sessions", "audit"] {
            let path = root.join(dir);
            fs::create_dir_all(&path).map_err(|e| RewindError::io_at("create dir", &path, e))?;
        }
        Ok(Self {
            root,
            store,
            timelines: concurrent_map(16),
            records: concurrent_map(256),
        })
    }

    /// Content store backing the index
    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    fn record_path(&self, checkpoint_id: &str) -> PathBuf {
        self.root.join("checkpoints").join(format!("{}.json", checkpoint_id))
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join("sessions").join(session_id)
    }

    /// Register a session, or update the root of an existing one
    ///
    /// Idempotent. Archived sessions stay archived.
    #[instrument(skip(self))]
    pub fn register_session(&self, session_id: &str, root: &Path) -> Result<SessionInfo> {
        utils::validate_session_id(session_id)?;
        let info = match self.session(session_id) {
            Ok(existing) if existing.root == root => return Ok(existing),
            Ok(existing) => SessionInfo {
                root: root.to_path_buf(),
                ..existing
            },
            Err(RewindError::NotFound { .. }) => SessionInfo {
                session_id: session_id.to_string(),
                root: root.to_path_buf(),
                created_at: Utc::now(),
                archived: false,
            },
            Err(e) => return Err(e),
        };
        let path = self.session_dir(session_id).join("session.json");
        utils::atomic_write(&path, &serde_json::to_vec_pretty(&info)?)?;
        debug!("Registered session {} at {:?}", session_id, root);
        Ok(info)
    }

    /// Registration of `session_id`
    pub fn session(&self, session_id: &str) -> Result<SessionInfo> {
        utils::validate_session_id(session_id)?;
        let path = self.session_dir(session_id).join("session.json");
        match fs::read(&path) {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(RewindError::not_found("session", session_id))
            }
            Err(e) => Err(RewindError::io_at("read", &path, e)),
        }
    }

    /// Every registered session, sorted by id
    pub fn sessions(&self) -> Result<Vec<SessionInfo>> {
        let dir = self.root.join("sessions");
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| RewindError::io_at("read dir", &dir, e))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            match self.session(&name) {
                Ok(info) => sessions.push(info),
                Err(e) => warn!("Skipping unreadable session {:?}: {}", name, e),
            }
        }
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(sessions)
    }

    /// Loaded timeline of a registered session
    ///
    /// # Errors
    ///
    /// [`RewindError::NotFound`] if the session was never registered
    pub fn timeline(&self, session_id: &str) -> Result<Arc<RwLock<Timeline>>> {
        if let Some(timeline) = self.timelines.get(session_id) {
            return Ok(Arc::clone(timeline.value()));
        }
        self.session(session_id)?;
        let loaded = Arc::new(RwLock::new(self.load_timeline(session_id)?));
        Ok(Arc::clone(
            self.timelines
                .entry(session_id.to_string())
                .or_insert(loaded)
                .value(),
        ))
    }

    fn load_timeline(&self, session_id: &str) -> Result<Timeline> {
        let mut timeline = Timeline::new(session_id);
        let log_path = self.session_dir(session_id).join("log");
        let log = match fs::read_to_string(&log_path) {
            Ok(log) => log,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => return Err(RewindError::io_at("read", &log_path, e)),
        };

        for line in log.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let loaded = self.get(line).and_then(|checkpoint| timeline.add_checkpoint(checkpoint));
            if let Err(e) = loaded {
                warn!("Skipping checkpoint {} in session {}: {}", short_id(line), session_id, e);
            }
        }

        let pointer_path = self.session_dir(session_id).join("current.json");
        match fs::read(&pointer_path) {
            Ok(raw) => {
                let pointer: CurrentPointer = serde_json::from_slice(&raw)?;
                if let Some(id) = pointer.current_checkpoint_id {
                    if timeline.set_current(&id).is_err() {
                        warn!("Current pointer of {} names unknown checkpoint {}", session_id, id);
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(RewindError::io_at("read", &pointer_path, e)),
        }

        debug!("Loaded {} checkpoints for session {}", timeline.len(), session_id);
        Ok(timeline)
    }

    /// Record a new checkpoint as a child of the session's current pointer
    pub fn create_checkpoint(
        &self,
        session_id: &str,
        message: &str,
        tree: &TreeHash,
    ) -> Result<Checkpoint> {
        self.create_checkpoint_with(
            session_id,
            message,
            tree,
            CheckpointKind::Manual,
            CheckpointMetadataBuilder::new().build(),
        )
    }

    /// Record a new checkpoint with an explicit kind and metadata
    ///
    /// The parent is the session's current checkpoint (none for the first
    /// one) and the pointer advances to the new id. Nothing is overwritten.
    ///
    /// # Errors
    ///
    /// - [`RewindError::NotFound`] for an unregistered session, or a tree or
    ///   blob missing from the store
    /// - [`RewindError::InvalidConfiguration`] for an archived session
    #[instrument(skip(self, tree, metadata), fields(tree = %tree.short()))]
    pub fn create_checkpoint_with(
        &self,
        session_id: &str,
        message: &str,
        tree: &TreeHash,
        kind: CheckpointKind,
        metadata: CheckpointMetadata,
    ) -> Result<Checkpoint> {
        let session = self.session(session_id)?;
        if session.archived {
            return Err(RewindError::InvalidConfiguration(format!(
                "session '{}' is archived",
                session_id
            )));
        }

        // The record must only ever name content that is fully persisted
        let manifest = self.store.get_tree(tree)?;
        if let Some(missing) = manifest.blob_hashes().find(|hash| !self.store.exists(hash)) {
            return Err(RewindError::not_found("blob", missing.as_str()));
        }

        let timeline = self.timeline(session_id)?;
        let mut timeline = timeline.write();
        let checkpoint = Checkpoint::new(
            session_id,
            timeline.current_id().map(str::to_string),
            tree.clone(),
            message,
            kind,
            timeline.len() as u64,
            metadata,
        );

        self.write_record(&checkpoint)?;
        self.append_log(session_id, &checkpoint.id)?;
        self.write_pointer(session_id, Some(&checkpoint.id))?;

        timeline.add_checkpoint(checkpoint.clone())?;
        timeline.set_current(&checkpoint.id)?;
        self.records.insert(checkpoint.id.clone(), checkpoint.clone());

        info!(
            "Created {} checkpoint {} in {} (parent: {})",
            checkpoint.kind,
            checkpoint.short_id(),
            session_id,
            checkpoint.parent_id.as_deref().map(short_id).unwrap_or("none")
        );
        Ok(checkpoint)
    }

    /// Capture `root` and record it as a checkpoint in one step
    ///
    /// The manifest is only stored once the whole walk succeeded, so a
    /// failed or cancelled capture leaves no tree or record behind.
    #[instrument(skip(self, builder, ignore, cancel))]
    pub fn snapshot(
        &self,
        builder: &TreeBuilder<'_>,
        session_id: &str,
        root: &Path,
        ignore: &IgnorePredicate,
        message: &str,
        kind: CheckpointKind,
        cancel: &CancelToken,
    ) -> Result<Snapshot> {
        let (manifest, stats) = builder.capture_with_stats(root, ignore, cancel)?;
        cancel.check("capture")?;
        let tree = self.store.put_tree(&manifest)?;
        let metadata = self.describe(session_id, &manifest)?;
        let checkpoint = self.create_checkpoint_with(session_id, message, &tree, kind, metadata)?;
        Ok(Snapshot {
            checkpoint,
            manifest,
            stats,
        })
    }

    /// Metadata for a new checkpoint of `manifest`, relative to the current one
    pub fn describe(&self, session_id: &str, manifest: &TreeManifest) -> Result<CheckpointMetadata> {
        let previous = match self.current(session_id)? {
            Some(current) => self.store.get_tree(&current.tree_hash)?,
            None => TreeManifest::new(),
        };
        let changes = diff_trees(&previous, manifest).stats();
        Ok(CheckpointMetadataBuilder::new()
            .file_count(manifest.len())
            .total_size(manifest.total_size())
            .files_changed(changes.total_operations())
            .bytes_changed(changes.bytes_added + changes.bytes_modified)
            .build())
    }

    fn write_record(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.record_path(&checkpoint.id);
        let dir = self.root.join("checkpoints");
        let mut temp =
            NamedTempFile::new_in(&dir).map_err(|e| RewindError::io_at("create temp file", &dir, e))?;
        temp.write_all(&serde_json::to_vec_pretty(checkpoint)?)
            .and_then(|_| temp.as_file().sync_data())
            .map_err(|e| RewindError::io_at("write", temp.path().to_path_buf(), e))?;
        temp.persist_noclobber(&path).map_err(|e| {
            if e.error.kind() == ErrorKind::AlreadyExists {
                RewindError::internal(format!("checkpoint record {} already exists", checkpoint.id))
            } else {
                RewindError::io_at("persist", &path, e.error)
            }
        })?;
        trace!("Wrote record {:?}", path);
        Ok(())
    }

    fn append_log(&self, session_id: &str, checkpoint_id: &str) -> Result<()> {
        let path = self.session_dir(session_id).join("log");
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| RewindError::io_at("open", &path, e))?;
        writeln!(log, "{}", checkpoint_id)
            .and_then(|_| log.sync_data())
            .map_err(|e| RewindError::io_at("append", &path, e))
    }

    fn write_pointer(&self, session_id: &str, checkpoint_id: Option<&str>) -> Result<()> {
        let pointer = CurrentPointer {
            current_checkpoint_id: checkpoint_id.map(str::to_string),
            version: FORMAT_VERSION,
        };
        let path = self.session_dir(session_id).join("current.json");
        utils::atomic_write(&path, &serde_json::to_vec_pretty(&pointer)?)
    }

    /// Look up a checkpoint by id
    ///
    /// # Errors
    ///
    /// - [`RewindError::NotFound`] for an unknown id
    /// - [`RewindError::IntegrityMismatch`] if the stored record was altered
    pub fn get(&self, checkpoint_id: &str) -> Result<Checkpoint> {
        if checkpoint_id.is_empty()
            || !checkpoint_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(RewindError::not_found("checkpoint", checkpoint_id));
        }
        if let Some(checkpoint) = self.records.get(checkpoint_id) {
            return Ok(checkpoint.clone());
        }

        let path = self.record_path(checkpoint_id);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(RewindError::not_found("checkpoint", checkpoint_id))
            }
            Err(e) => return Err(RewindError::io_at("read", &path, e)),
        };
        let checkpoint: Checkpoint = serde_json::from_slice(&raw)?;
        if checkpoint.id != checkpoint_id || !checkpoint.verify_integrity() {
            return Err(RewindError::IntegrityMismatch {
                hash: checkpoint.state_hash.clone(),
                actual: checkpoint.compute_state_hash(),
            });
        }
        self.records.insert(checkpoint.id.clone(), checkpoint.clone());
        Ok(checkpoint)
    }

    /// Whether a record exists for `checkpoint_id`
    pub fn contains(&self, checkpoint_id: &str) -> bool {
        self.get(checkpoint_id).is_ok()
    }

    /// Checkpoints of a session in creation order
    ///
    /// The returned iterator is lazy and covers the history as it was when
    /// `list` was called. Calling `list` again starts over.
    pub fn list(&self, session_id: &str) -> Result<Checkpoints> {
        let timeline = self.timeline(session_id)?;
        let end = timeline.read().len();
        Ok(Checkpoints {
            timeline,
            position: 0,
            end,
        })
    }

    /// Parent chain of `checkpoint_id`, nearest first, excluding itself
    pub fn ancestors(&self, checkpoint_id: &str) -> Result<Vec<Checkpoint>> {
        let checkpoint = self.get(checkpoint_id)?;
        let timeline = self.timeline(&checkpoint.session_id)?;
        let timeline = timeline.read();
        Ok(timeline
            .ancestors(checkpoint_id)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Lowest common ancestor of two checkpoints in the same session
    ///
    /// Returns `Ok(None)` when the checkpoints share no history.
    pub fn common_ancestor(&self, a: &str, b: &str) -> Result<Option<Checkpoint>> {
        let first = self.get(a)?;
        let second = self.get(b)?;
        if first.session_id != second.session_id {
            return Ok(None);
        }
        let timeline = self.timeline(&first.session_id)?;
        let timeline = timeline.read();
        Ok(timeline.common_ancestor(a, b).cloned())
    }

    /// Current checkpoint of a session
    pub fn current(&self, session_id: &str) -> Result<Option<Checkpoint>> {
        let timeline = self.timeline(session_id)?;
        let timeline = timeline.read();
        Ok(timeline.current_checkpoint().cloned())
    }

    /// Move a session's current pointer to one of its checkpoints
    #[instrument(skip(self))]
    pub fn set_current(&self, session_id: &str, checkpoint_id: &str) -> Result<()> {
        let timeline = self.timeline(session_id)?;
        let mut timeline = timeline.write();
        if !timeline.contains(checkpoint_id) {
            return Err(RewindError::not_found("checkpoint", checkpoint_id));
        }
        self.write_pointer(session_id, Some(checkpoint_id))?;
        timeline.set_current(checkpoint_id)
    }

    /// Resolve a full id or unique id prefix within a session
    pub fn resolve(&self, session_id: &str, prefix: &str) -> Result<Checkpoint> {
        let timeline = self.timeline(session_id)?;
        let timeline = timeline.read();
        if let Some(checkpoint) = timeline.get(prefix) {
            return Ok(checkpoint.clone());
        }
        let matches: Vec<_> = timeline
            .iter()
            .filter(|c| !prefix.is_empty() && c.id.starts_with(prefix))
            .collect();
        match matches.as_slice() {
            [checkpoint] => Ok((*checkpoint).clone()),
            [] => Err(RewindError::not_found("checkpoint", prefix)),
            _ => Err(RewindError::AmbiguousId {
                prefix: prefix.to_string(),
                matches: matches.len(),
            }),
        }
    }

    /// Shape statistics of a session's history
    pub fn timeline_stats(&self, session_id: &str) -> Result<TimelineStats> {
        Ok(self.timeline(session_id)?.read().stats())
    }

    /// Retire a session
    ///
    /// With `archive` the history stays readable but new checkpoints are
    /// refused. Without it the session directory is deleted; records and
    /// content stay until the next GC.
    #[instrument(skip(self))]
    pub fn remove_session(&self, session_id: &str, archive: bool) -> Result<()> {
        let mut info = self.session(session_id)?;
        if archive {
            info.archived = true;
            let path = self.session_dir(session_id).join("session.json");
            utils::atomic_write(&path, &serde_json::to_vec_pretty(&info)?)?;
            info!("Archived session {}", session_id);
            return Ok(());
        }

        if let Some((_, timeline)) = self.timelines.remove(session_id) {
            for checkpoint in timeline.read().iter() {
                self.records.remove(&checkpoint.id);
            }
        }
        let dir = self.session_dir(session_id);
        fs::remove_dir_all(&dir).map_err(|e| RewindError::io_at("remove dir", &dir, e))?;
        info!("Removed session {}", session_id);
        Ok(())
    }

    /// Checkpoints reachable from the log of any registered session
    pub fn live_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        let mut live = Vec::new();
        for session in self.sessions()? {
            let timeline = self.timeline(&session.session_id)?;
            live.extend(timeline.read().iter().cloned());
        }
        Ok(live)
    }

    /// Tree hashes of every live checkpoint
    pub fn live_tree_hashes(&self) -> Result<FastSet<TreeHash>> {
        let mut trees = fast_set();
        trees.extend(self.live_checkpoints()?.into_iter().map(|c| c.tree_hash));
        Ok(trees)
    }

    /// Ids of record files on disk, sorted
    pub fn record_ids(&self) -> Result<Vec<String>> {
        let dir = self.root.join("checkpoints");
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| RewindError::io_at("read dir", &dir, e))? {
            let name = entry?.file_name().to_string_lossy().to_string();
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Delete a record that no session log references
    ///
    /// # Errors
    ///
    /// [`RewindError::Internal`] if a loaded timeline still holds the id
    pub fn delete_record(&self, checkpoint_id: &str) -> Result<()> {
        let referenced = self
            .timelines
            .iter()
            .any(|timeline| timeline.value().read().contains(checkpoint_id));
        if referenced {
            return Err(RewindError::internal(format!(
                "checkpoint {} is still part of a session",
                checkpoint_id
            )));
        }
        self.records.remove(checkpoint_id);
        let path = self.record_path(checkpoint_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RewindError::io_at("remove", &path, e)),
        }
    }
}

/// Result of [`CheckpointIndex::snapshot`]
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Persisted record
    pub checkpoint: Checkpoint,
    /// Captured manifest
    pub manifest: TreeManifest,
    /// Capture counters
    pub stats: CaptureStats,
}

/// Lazy iterator over a session's checkpoints in creation order
pub struct Checkpoints {
    timeline: Arc<RwLock<Timeline>>,
    position: usize,
    end: usize,
}

impl Iterator for Checkpoints {
    type Item = Result<Checkpoint>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.end {
            return None;
        }
        let timeline = self.timeline.read();
        let id = timeline.ids_in_order().get(self.position)?;
        self.position += 1;
        Some(
            timeline
                .get(id)
                .cloned()
                .ok_or_else(|| RewindError::not_found("checkpoint", id.clone())),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.end.saturating_sub(self.position);
        (remaining, Some(remaining))
    }
}
