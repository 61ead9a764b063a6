//! Restoring a working directory to a checkpoint
//!
//! A restore moves through
//!
//! ```text
//! Requested → PreRestoreCheckpointed → Applying → Committed
//!                                          └────→ Failed
//! ```
//!
//! 1. The live directory is captured and recorded as a pre-restore
//!    checkpoint, so no edit is lost.
//! 2. The delta from the live tree to the target tree is computed.
//! 3. Every blob the delta needs is read and written to a temp file next to
//!    its destination. Nothing in the working directory changes until all
//!    of these succeed.
//! 4. Removals are applied, then the staged files are renamed into place.
//! 5. The session's current pointer moves to the target.
//!
//! A failure in step 4 is not rolled back. The error lists the paths that
//! were not applied and the pointer stays on the pre-restore checkpoint.
//! Cancellation is honoured before step 4 and between individual
//! operations inside it; a cancel during step 4 surfaces as the same
//! partial failure.

use crate::checkpoint::{Checkpoint, CheckpointKind};
use crate::diff::{diff_trees, Change, Delta, DeltaSet};
use crate::error::{Result, RewindError};
use crate::index::CheckpointIndex;
use crate::tree::{link_target_from_bytes, EntryKind, IgnorePredicate, TreeBuilder, TreeEntry};
use crate::types::ChangeStats;
use crate::utils::{self, resolve_manifest_path};
use crate::worker::CancelToken;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, warn};

const STAGING_PREFIX: &str = ".rewind-";

/// Position of a restore in its state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestorePhase {
    /// Target validated, nothing done yet
    Requested,
    /// Live state saved as a checkpoint
    PreRestoreCheckpointed,
    /// Delta being written to the working directory
    Applying,
    /// Delta applied and pointer moved
    Committed,
    /// Stopped while applying; see the error for unapplied paths
    Failed,
}

impl RestorePhase {
    fn can_move_to(self, next: RestorePhase) -> bool {
        use RestorePhase::*;
        matches!(
            (self, next),
            (Requested, PreRestoreCheckpointed)
                | (PreRestoreCheckpointed, Applying)
                | (Applying, Committed)
                | (Applying, Failed)
        )
    }
}

impl fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RestorePhase::Requested => "requested",
            RestorePhase::PreRestoreCheckpointed => "pre-restore-checkpointed",
            RestorePhase::Applying => "applying",
            RestorePhase::Committed => "committed",
            RestorePhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Phase tracker for one restore
#[derive(Debug, Clone)]
struct PhaseLog {
    phases: Vec<RestorePhase>,
}

impl PhaseLog {
    fn new() -> Self {
        Self {
            phases: vec![RestorePhase::Requested],
        }
    }

    fn current(&self) -> RestorePhase {
        self.phases.last().copied().unwrap_or(RestorePhase::Requested)
    }

    fn advance(&mut self, next: RestorePhase) -> Result<()> {
        let current = self.current();
        if !current.can_move_to(next) {
            return Err(RewindError::internal(format!(
                "invalid restore transition {} -> {}",
                current, next
            )));
        }
        debug!("Restore phase {} -> {}", current, next);
        self.phases.push(next);
        Ok(())
    }
}

/// Restore tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreOptions {
    /// Compute the plan without touching the directory or the index
    pub dry_run: bool,
    /// Remove directories left empty by removals
    pub prune_empty_dirs: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            prune_empty_dirs: true,
        }
    }
}

/// Outcome of a successful (or dry-run) restore
#[derive(Debug, Clone)]
pub struct RestoreReport {
    /// Checkpoint the directory now matches
    pub target: Checkpoint,
    /// Snapshot of the state before restoring (None for a dry run)
    pub pre_restore: Option<Checkpoint>,
    /// Planned change counts
    pub planned: ChangeStats,
    /// Regular files and symlinks written
    pub files_written: usize,
    /// Entries deleted
    pub files_removed: usize,
    /// Entries whose permissions were reset
    pub modes_restored: usize,
    /// Special entries that cannot be recreated
    pub skipped_special: Vec<String>,
    /// Empty directories removed
    pub dirs_pruned: usize,
    /// Bytes written
    pub bytes_written: u64,
    /// Phases passed through
    pub phases: Vec<RestorePhase>,
    /// Whether anything was changed
    pub dry_run: bool,
    /// Wall time in milliseconds
    pub duration_ms: u64,
}

impl RestoreReport {
    /// Paths written or removed
    pub fn files_changed(&self) -> usize {
        self.files_written + self.files_removed + self.modes_restored
    }
}

/// One line of `audit/restores.jsonl`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreAuditEntry {
    /// When the restore ended
    pub at: DateTime<Utc>,
    /// Session restored
    pub session_id: String,
    /// Target checkpoint
    pub target_checkpoint_id: String,
    /// Snapshot taken before applying
    pub pre_restore_checkpoint_id: Option<String>,
    /// Final phase
    pub phase: RestorePhase,
    /// Paths changed
    pub files_changed: usize,
    /// Paths left unapplied on failure
    pub unapplied: Vec<PathBuf>,
    /// Error text on failure
    pub error: Option<String>,
}

/// Append an entry to the restore audit log under `storage_root`
pub fn append_audit(storage_root: &Path, entry: &RestoreAuditEntry) -> Result<()> {
    let path = storage_root.join("audit").join("restores.jsonl");
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| RewindError::io_at("open", &path, e))?;
    file.write_all(&line)
        .map_err(|e| RewindError::io_at("append", &path, e))
}

/// Read the restore audit log, skipping malformed lines
pub fn read_audit(storage_root: &Path) -> Result<Vec<RestoreAuditEntry>> {
    let path = storage_root.join("audit").join("restores.jsonl");
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(RewindError::io_at("read", &path, e)),
    };
    Ok(raw
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| match serde_json::from_str(l) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Skipping malformed audit line: {}", e);
                None
            }
        })
        .collect())
}

/// Called with each manifest path right after it has been applied
pub type ApplyObserver = Arc<dyn Fn(&str) + Send + Sync>;

/// Runs the restore state machine for one session
pub struct RestoreCoordinator<'a> {
    index: &'a CheckpointIndex,
    builder: &'a TreeBuilder<'a>,
    ignore: &'a IgnorePredicate,
    options: RestoreOptions,
    observer: Option<ApplyObserver>,
}

impl<'a> RestoreCoordinator<'a> {
    /// Coordinator capturing with `builder` and `ignore`
    pub fn new(index: &'a CheckpointIndex, builder: &'a TreeBuilder<'a>, ignore: &'a IgnorePredicate) -> Self {
        Self {
            index,
            builder,
            ignore,
            options: RestoreOptions::default(),
            observer: None,
        }
    }

    /// Replace the restore options
    pub fn with_options(mut self, options: RestoreOptions) -> Self {
        self.options = options;
        self
    }

    /// Report every applied path to `observer`
    pub fn with_observer(mut self, observer: ApplyObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Restore `root` to `target_id`
    ///
    /// The caller must hold the session lock.
    ///
    /// # Errors
    ///
    /// - [`RewindError::NotFound`] if the target is unknown or belongs to
    ///   another session
    /// - [`RewindError::CaptureIncomplete`] / [`RewindError::Cancelled`]
    ///   before anything was changed
    /// - [`RewindError::RestoreFailed`] if applying stopped part way
    #[instrument(skip(self, cancel))]
    pub fn run(
        &self,
        session_id: &str,
        root: &Path,
        target_id: &str,
        cancel: &CancelToken,
    ) -> Result<RestoreReport> {
        let start = Instant::now();
        let mut phases = PhaseLog::new();

        let target = self.index.get(target_id)?;
        if target.session_id != session_id {
            return Err(RewindError::not_found(
                "checkpoint",
                format!("{} in session {}", target_id, session_id),
            ));
        }
        let target_tree = self.index.store().get_tree(&target.tree_hash)?;

        let (pre_restore, live) = if self.options.dry_run {
            let (live, _) = self.builder.capture_with_stats(root, self.ignore, cancel)?;
            (None, live)
        } else {
            let unbounded = self.builder.without_size_limit();
            let snapshot = self.index.snapshot(
                &unbounded,
                session_id,
                root,
                self.ignore,
                &format!("Before restoring to {}", target.short_id()),
                CheckpointKind::PreRestore,
                cancel,
            )?;
            (Some(snapshot.checkpoint), snapshot.manifest)
        };
        phases.advance(RestorePhase::PreRestoreCheckpointed)?;

        let deltas = diff_trees(&live, &target_tree);
        let planned = deltas.stats();
        let mut report = RestoreReport {
            target: target.clone(),
            pre_restore: pre_restore.clone(),
            planned,
            files_written: 0,
            files_removed: 0,
            modes_restored: 0,
            skipped_special: Vec::new(),
            dirs_pruned: 0,
            bytes_written: 0,
            phases: Vec::new(),
            dry_run: self.options.dry_run,
            duration_ms: 0,
        };

        if self.options.dry_run {
            report.phases = phases.phases;
            report.duration_ms = start.elapsed().as_millis() as u64;
            info!("Dry run restore to {}: {} change(s)", target.short_id(), deltas.len());
            return Ok(report);
        }

        phases.advance(RestorePhase::Applying)?;
        let applied = Applier {
            index: self.index,
            root,
            target_id: &target.id,
            prune: self.options.prune_empty_dirs,
            cancel,
            observer: self.observer.as_ref(),
            report: &mut report,
        }
        .apply(&deltas);

        let audit = |phase: RestorePhase, report: &RestoreReport, err: Option<&RewindError>| {
            let unapplied = match err {
                Some(RewindError::RestoreFailed { unapplied, .. }) => unapplied.clone(),
                _ => Vec::new(),
            };
            let entry = RestoreAuditEntry {
                at: Utc::now(),
                session_id: session_id.to_string(),
                target_checkpoint_id: target.id.clone(),
                pre_restore_checkpoint_id: pre_restore.as_ref().map(|c| c.id.clone()),
                phase,
                files_changed: report.files_changed(),
                unapplied,
                error: err.map(|e| e.to_string()),
            };
            if let Err(e) = append_audit(self.index.store().root(), &entry) {
                warn!("Failed to write restore audit entry: {}", e);
            }
        };

        if let Err(err) = applied {
            phases.advance(RestorePhase::Failed)?;
            audit(RestorePhase::Failed, &report, Some(&err));
            warn!("Restore to {} failed: {}", target.short_id(), err);
            return Err(err);
        }

        self.index.set_current(session_id, &target.id)?;
        phases.advance(RestorePhase::Committed)?;
        audit(RestorePhase::Committed, &report, None);

        report.phases = phases.phases;
        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Restored {} to {} ({} written, {} removed)",
            session_id,
            target.short_id(),
            report.files_written,
            report.files_removed
        );
        Ok(report)
    }
}

enum Staged {
    File {
        key: String,
        temp: NamedTempFile,
        size: u64,
    },
    Symlink {
        key: String,
        target: PathBuf,
    },
    Mode {
        key: String,
        mode: u32,
    },
}

impl Staged {
    fn key(&self) -> &str {
        match self {
            Staged::File { key, .. } | Staged::Symlink { key, .. } | Staged::Mode { key, .. } => key,
        }
    }
}

struct Applier<'r> {
    index: &'r CheckpointIndex,
    root: &'r Path,
    target_id: &'r str,
    prune: bool,
    cancel: &'r CancelToken,
    observer: Option<&'r ApplyObserver>,
    report: &'r mut RestoreReport,
}

impl Applier<'_> {
    fn failed(&self, unapplied: Vec<PathBuf>, reason: impl Into<String>) -> RewindError {
        RewindError::RestoreFailed {
            checkpoint_id: self.target_id.to_string(),
            unapplied,
            reason: reason.into(),
        }
    }

    fn apply(mut self, deltas: &DeltaSet) -> Result<()> {
        let all_paths: Vec<PathBuf> = deltas.iter().map(|d| PathBuf::from(&d.path)).collect();

        // Stage: nothing in the working directory is modified yet
        let mut staged = Vec::new();
        let mut removals = Vec::new();
        for delta in deltas {
            if let Err(e) = self.cancel.check("restore") {
                return Err(self.failed(all_paths, e.to_string()));
            }
            match &delta.change {
                Change::Removed(_) => removals.push(delta.path.clone()),
                Change::Added(entry) | Change::Modified { new: entry, .. } => {
                    match self.stage(delta, entry) {
                        Ok(Some(item)) => staged.push(item),
                        Ok(None) => {}
                        Err(e) => return Err(self.failed(all_paths, e.to_string())),
                    }
                }
            }
        }

        // Deepest paths first so directories empty out before pruning
        removals.sort_by(|a, b| b.cmp(a));
        let pending: Vec<PathBuf> = removals
            .iter()
            .map(PathBuf::from)
            .chain(staged.iter().map(|s| PathBuf::from(s.key())))
            .collect();

        let mut done = 0;
        for key in &removals {
            self.check_cancel(&pending[done..])?;
            let path = resolve_manifest_path(self.root, key);
            if let Err(e) = remove_entry(&path) {
                return Err(self.failed(pending[done..].to_vec(), e.to_string()));
            }
            self.report.files_removed += 1;
            if self.prune {
                if let Some(parent) = path.parent() {
                    match utils::prune_empty_parents(parent, self.root) {
                        Ok(pruned) => self.report.dirs_pruned += pruned,
                        Err(e) => warn!("Could not prune empty directories above {}: {}", key, e),
                    }
                }
            }
            done += 1;
            self.observe(key);
        }

        for item in staged {
            self.check_cancel(&pending[done..])?;
            let key = item.key().to_string();
            // Temp files of items not reached are deleted when the iterator drops
            if let Err(e) = self.commit(item) {
                return Err(self.failed(pending[done..].to_vec(), e.to_string()));
            }
            done += 1;
            self.observe(&key);
        }
        Ok(())
    }

    fn observe(&self, key: &str) {
        if let Some(observer) = self.observer {
            observer(key);
        }
    }

    fn check_cancel(&self, pending: &[PathBuf]) -> Result<()> {
        self.cancel.check("restore").map_err(|e| {
            warn!("Restore cancelled with {} path(s) unapplied", pending.len());
            self.failed(pending.to_vec(), e.to_string())
        })
    }

    fn stage(&mut self, delta: &Delta, entry: &TreeEntry) -> Result<Option<Staged>> {
        if !delta.content_changed() {
            return Ok(Some(Staged::Mode {
                key: delta.path.clone(),
                mode: entry.mode,
            }));
        }

        match entry.kind {
            EntryKind::Special => {
                warn!("Cannot recreate special file {}, skipping", delta.path);
                self.report.skipped_special.push(delta.path.clone());
                Ok(None)
            }
            EntryKind::Symlink => {
                let bytes = self.index.store().get(&entry.hash)?;
                let target = link_target_from_bytes(&bytes);
                if matches!(delta.change, Change::Added(_)) {
                    let destination = resolve_manifest_path(self.root, &delta.path);
                    ensure_untracked_matches(&destination, &delta.path, |disk| match disk {
                        OnDisk::Symlink(existing) => existing == target,
                        OnDisk::File(_) => false,
                    })?;
                }
                Ok(Some(Staged::Symlink {
                    key: delta.path.clone(),
                    target,
                }))
            }
            EntryKind::Regular => {
                let content = self.index.store().get(&entry.hash)?;
                let destination = resolve_manifest_path(self.root, &delta.path);
                if matches!(delta.change, Change::Added(_)) {
                    ensure_untracked_matches(&destination, &delta.path, |disk| match disk {
                        OnDisk::File(existing) => existing == content,
                        OnDisk::Symlink(_) => false,
                    })?;
                }
                let dir = staging_dir(self.root, &destination);
                let mut temp = tempfile::Builder::new()
                    .prefix(STAGING_PREFIX)
                    .tempfile_in(&dir)
                    .map_err(|e| RewindError::io_at("create temp file", &dir, e))?;
                temp.write_all(&content)
                    .and_then(|_| temp.as_file().sync_data())
                    .map_err(|e| RewindError::io_at("write", temp.path().to_path_buf(), e))?;
                utils::set_permissions(temp.path(), entry.mode)?;
                Ok(Some(Staged::File {
                    key: delta.path.clone(),
                    temp,
                    size: content.len() as u64,
                }))
            }
        }
    }

    fn commit(&mut self, item: Staged) -> Result<()> {
        match item {
            Staged::Mode { key, mode } => {
                utils::set_permissions(&resolve_manifest_path(self.root, &key), mode)?;
                self.report.modes_restored += 1;
            }
            Staged::File { key, temp, size } => {
                let destination = resolve_manifest_path(self.root, &key);
                ensure_parent(&destination)?;
                clear_directory_in_the_way(&destination)?;
                temp.persist(&destination)
                    .map_err(|e| RewindError::io_at("rename", &destination, e.error))?;
                self.report.files_written += 1;
                self.report.bytes_written += size;
            }
            Staged::Symlink { key, target } => {
                let destination = resolve_manifest_path(self.root, &key);
                ensure_parent(&destination)?;
                clear_directory_in_the_way(&destination)?;
                let parent = destination.parent().unwrap_or(self.root);
                let staging = parent.join(format!("{}{}", STAGING_PREFIX, uuid::Uuid::new_v4()));
                utils::create_symlink(&target, &staging)?;
                fs::rename(&staging, &destination).map_err(|e| {
                    let _ = fs::remove_file(&staging);
                    RewindError::io_at("rename", &destination, e)
                })?;
                self.report.files_written += 1;
            }
        }
        Ok(())
    }
}

/// Directory to stage `destination` in
///
/// Normally its parent (created if needed). When the parent cannot exist
/// yet, for example because a file that is about to be removed occupies
/// its name, the nearest existing ancestor inside `root` is used.
fn staging_dir(root: &Path, destination: &Path) -> PathBuf {
    let parent = destination.parent().unwrap_or(root);
    if fs::create_dir_all(parent).is_ok() {
        return parent.to_path_buf();
    }
    parent
        .ancestors()
        .find(|dir| dir.starts_with(root) && dir.is_dir())
        .unwrap_or(root)
        .to_path_buf()
}

fn ensure_parent(destination: &Path) -> Result<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).map_err(|e| RewindError::io_at("create dir", parent, e))?;
    }
    Ok(())
}

/// An empty directory where a file goes is removed; a non-empty one is an error
fn clear_directory_in_the_way(destination: &Path) -> Result<()> {
    match fs::symlink_metadata(destination) {
        Ok(meta) if meta.is_dir() => {
            fs::remove_dir(destination).map_err(|e| RewindError::io_at("remove dir", destination, e))
        }
        _ => Ok(()),
    }
}

fn remove_entry(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            fs::remove_dir_all(path).map_err(|e| RewindError::io_at("remove dir", path, e))
        }
        Ok(_) => fs::remove_file(path).map_err(|e| RewindError::io_at("remove", path, e)),
        // Already gone: the desired end state holds
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RewindError::io_at("stat", path, e)),
    }
}

/// Entry found at a path the live capture did not record
enum OnDisk {
    File(Vec<u8>),
    Symlink(PathBuf),
}

/// An added path may only replace an uncaptured entry with identical content
///
/// The live capture skips ignored paths. Anything else sitting at such a
/// path has never been saved, so overwriting it would lose it.
fn ensure_untracked_matches(
    destination: &Path,
    key: &str,
    matches_target: impl FnOnce(OnDisk) -> bool,
) -> Result<()> {
    let untracked = || RewindError::CaptureIncomplete {
        path: PathBuf::from(key),
        reason: "exists on disk but is not part of the pre-restore checkpoint".to_string(),
    };

    // Nothing readable there, nothing to lose
    let Ok(metadata) = fs::symlink_metadata(destination) else {
        return Ok(());
    };
    let file_type = metadata.file_type();
    let disk = if file_type.is_dir() {
        return Ok(());
    } else if file_type.is_symlink() {
        OnDisk::Symlink(
            fs::read_link(destination).map_err(|e| RewindError::io_at("read link", destination, e))?,
        )
    } else if file_type.is_file() {
        OnDisk::File(fs::read(destination).map_err(|e| RewindError::io_at("read", destination, e))?)
    } else {
        return Err(untracked());
    };

    if matches_target(disk) {
        Ok(())
    } else {
        warn!("Refusing to overwrite uncaptured {}", key);
        Err(untracked())
    }
}
