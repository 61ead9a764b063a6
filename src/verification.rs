//! Integrity verification and repair
//!
//! Verification works at two levels:
//!
//! 1. **Checkpoint**: the record's state hash, its tree manifest (which is
//!    itself hash-verified on load), every blob the manifest references,
//!    and the parent link.
//! 2. **Session**: every checkpoint above, plus the history structure (all
//!    parents inside the session, creation order consistent with parent
//!    links, current pointer valid) and hash/size consistency across
//!    manifests.
//!
//! Problems are reported in the returned report; `Err` is reserved for
//! failures that prevent verification from running at all.
//!
//! [`repair`] is the only mutating operation here. It re-reads every
//! stored object and moves the ones that fail their hash into
//! `quarantine/` so later reads report `NotFound` instead of bad data.
//!
//! ```rust,no_run
//! use rewind::Rewind;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Rewind::open(".rewind")?;
//! let report = engine.verify_session("s1")?;
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```

use crate::checkpoint::Checkpoint;
use crate::collections::{fast_map, FastMap};
use crate::error::{Result, RewindError};
use crate::index::CheckpointIndex;
use crate::store::{BlobHash, ContentStore};
use crate::tree::TreeEntry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Verifies checkpoints against the store
#[derive(Debug)]
pub struct CheckpointVerifier<'a> {
    index: &'a CheckpointIndex,
}

impl<'a> CheckpointVerifier<'a> {
    /// Verifier reading from `index` and its store
    pub fn new(index: &'a CheckpointIndex) -> Self {
        Self { index }
    }

    fn store(&self) -> &ContentStore {
        self.index.store()
    }

    /// Verify one checkpoint and everything it references
    pub fn verify_complete(&self, checkpoint: &Checkpoint) -> Result<VerificationReport> {
        let start = Instant::now();
        let mut report = VerificationReport::new(checkpoint.id.clone());

        debug!("Verifying checkpoint {}", checkpoint.short_id());
        let computed_state = checkpoint.compute_state_hash();
        report.state_hash_valid = computed_state == checkpoint.state_hash;
        if !report.state_hash_valid {
            report.errors.push(format!(
                "State hash mismatch: expected {}, got {}",
                checkpoint.state_hash, computed_state
            ));
        }

        report.parent_valid = match &checkpoint.parent_id {
            Some(parent_id) => match self.index.get(parent_id) {
                Ok(parent) if parent.session_id == checkpoint.session_id => true,
                Ok(_) => {
                    report.errors.push(format!("Parent {} belongs to another session", parent_id));
                    false
                }
                Err(e) => {
                    report.errors.push(format!("Parent {} unreadable: {}", parent_id, e));
                    false
                }
            },
            None => true,
        };

        let manifest = match self.store().get_tree(&checkpoint.tree_hash) {
            Ok(manifest) => {
                report.tree_valid = true;
                manifest
            }
            Err(e) => {
                report.errors.push(format!("Tree {} unreadable: {}", checkpoint.tree_hash.short(), e));
                report.verification_time_ms = start.elapsed().as_millis() as u64;
                return Ok(report);
            }
        };

        for (path, entry) in manifest.iter() {
            let check = self.verify_entry(path, entry);
            if !check.is_valid() {
                report.errors.push(format!(
                    "Entry {} failed verification: {}",
                    path,
                    check.error.as_deref().unwrap_or("content mismatch")
                ));
            }
            report.file_checks.push(check);
        }

        report.total_files_checked = report.file_checks.len();
        report.files_valid = report.file_checks.iter().filter(|f| f.is_valid()).count();
        report.verification_time_ms = start.elapsed().as_millis() as u64;

        info!(
            "Verified checkpoint {} in {}ms: {} / {} entries valid",
            checkpoint.short_id(),
            report.verification_time_ms,
            report.files_valid,
            report.total_files_checked
        );
        Ok(report)
    }

    fn verify_entry(&self, path: &str, entry: &TreeEntry) -> FileVerification {
        let mut verification = FileVerification {
            path: path.to_string(),
            object_exists: self.store().exists(&entry.hash),
            content_hash_valid: false,
            size_matches: false,
            error: None,
        };
        if !verification.object_exists {
            verification.error = Some(format!("blob {} not found", entry.hash.short()));
            return verification;
        }

        match self.store().get(&entry.hash) {
            Ok(content) => {
                verification.content_hash_valid = true;
                verification.size_matches = content.len() as u64 == entry.size;
                if !verification.size_matches {
                    verification.error = Some(format!(
                        "size {} does not match recorded {}",
                        content.len(),
                        entry.size
                    ));
                }
            }
            Err(e) => verification.error = Some(e.to_string()),
        }
        verification
    }

    /// Verify every checkpoint of a session and the history structure
    pub fn verify_session(&self, session_id: &str) -> Result<SessionVerificationReport> {
        let start = Instant::now();
        let mut report = SessionVerificationReport {
            session_id: session_id.to_string(),
            ..Default::default()
        };

        let checkpoints: Vec<Checkpoint> = self.index.list(session_id)?.collect::<Result<_>>()?;
        report.total_checkpoints = checkpoints.len();

        for checkpoint in &checkpoints {
            match self.verify_complete(checkpoint) {
                Ok(checkpoint_report) => {
                    if checkpoint_report.is_valid() {
                        report.valid_checkpoints += 1;
                    } else {
                        report.invalid_checkpoints += 1;
                        report
                            .checkpoint_errors
                            .insert(checkpoint.id.clone(), checkpoint_report.errors.clone());
                    }
                    report.checkpoint_reports.push(checkpoint_report);
                }
                Err(e) => {
                    report.invalid_checkpoints += 1;
                    report
                        .checkpoint_errors
                        .insert(checkpoint.id.clone(), vec![format!("Verification failed: {}", e)]);
                }
            }
        }

        report.structure_valid = verify_structure(&checkpoints);
        report.current_pointer_valid = match self.index.current(session_id)? {
            Some(current) => checkpoints.iter().any(|c| c.id == current.id),
            None => checkpoints.is_empty(),
        };
        report.no_hash_conflicts = self.check_hash_conflicts(&checkpoints);
        report.verification_time_ms = start.elapsed().as_millis() as u64;

        info!(
            "Session {} verification complete in {}ms: {}/{} checkpoints valid",
            session_id, report.verification_time_ms, report.valid_checkpoints, report.total_checkpoints
        );
        Ok(report)
    }

    /// One blob hash must always describe the same size
    fn check_hash_conflicts(&self, checkpoints: &[Checkpoint]) -> bool {
        let mut sizes: FastMap<BlobHash, u64> = fast_map();
        for checkpoint in checkpoints {
            let Ok(manifest) = self.store().get_tree(&checkpoint.tree_hash) else {
                continue;
            };
            for (_, entry) in manifest.iter() {
                match sizes.get(&entry.hash) {
                    Some(&size) if size != entry.size => {
                        warn!(
                            "Hash conflict: {} recorded with sizes {} and {}",
                            entry.hash.short(),
                            size,
                            entry.size
                        );
                        return false;
                    }
                    Some(_) => {}
                    None => {
                        sizes.insert(entry.hash.clone(), entry.size);
                    }
                }
            }
        }
        true
    }
}

/// Parents precede children in creation order and stay inside the session
fn verify_structure(checkpoints: &[Checkpoint]) -> bool {
    let positions: FastMap<&str, usize> = {
        let mut map = fast_map();
        map.extend(checkpoints.iter().enumerate().map(|(i, c)| (c.id.as_str(), i)));
        map
    };
    checkpoints.iter().enumerate().all(|(i, checkpoint)| {
        let ok = match checkpoint.parent_id.as_deref() {
            Some(parent) => positions.get(parent).is_some_and(|&p| p < i),
            None => true,
        };
        if !ok {
            error!(
                "Checkpoint {} has a parent outside its session history",
                checkpoint.short_id()
            );
        }
        ok
    })
}

/// Verification result for one checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Checkpoint verified
    pub checkpoint_id: String,
    /// Record's state hash matches its fields
    pub state_hash_valid: bool,
    /// Tree manifest exists and matches its hash
    pub tree_valid: bool,
    /// Parent exists in the same session (or there is none)
    pub parent_valid: bool,
    /// Per-entry results
    pub file_checks: Vec<FileVerification>,
    /// Entries checked
    pub total_files_checked: usize,
    /// Entries that passed
    pub files_valid: usize,
    /// Time taken in milliseconds
    pub verification_time_ms: u64,
    /// Problems found
    pub errors: Vec<String>,
}

impl VerificationReport {
    /// Empty report for `checkpoint_id`
    pub fn new(checkpoint_id: String) -> Self {
        Self {
            checkpoint_id,
            state_hash_valid: false,
            tree_valid: false,
            parent_valid: false,
            file_checks: Vec::new(),
            total_files_checked: 0,
            files_valid: 0,
            verification_time_ms: 0,
            errors: Vec::new(),
        }
    }

    /// Every check passed
    pub fn is_valid(&self) -> bool {
        self.state_hash_valid
            && self.tree_valid
            && self.parent_valid
            && self.files_valid == self.total_files_checked
            && self.errors.is_empty()
    }

    /// One-line description
    pub fn summary(&self) -> String {
        let id = crate::utils::short_id(&self.checkpoint_id);
        if self.is_valid() {
            return format!(
                "Checkpoint {} is valid ({} entries verified in {}ms)",
                id, self.total_files_checked, self.verification_time_ms
            );
        }
        let issues = [
            (!self.state_hash_valid).then_some("state hash mismatch"),
            (!self.tree_valid).then_some("tree unreadable"),
            (!self.parent_valid).then_some("parent missing"),
            (self.files_valid < self.total_files_checked).then_some("entry failures"),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(", ");
        format!(
            "Checkpoint {} is invalid: {} ({}/{} entries valid)",
            id, issues, self.files_valid, self.total_files_checked
        )
    }
}

/// Verification result for one manifest entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileVerification {
    /// Manifest path
    pub path: String,
    /// Blob is present
    pub object_exists: bool,
    /// Blob bytes hash to its key
    pub content_hash_valid: bool,
    /// Blob length equals the recorded size
    pub size_matches: bool,
    /// What went wrong
    pub error: Option<String>,
}

impl FileVerification {
    /// Every check passed
    pub fn is_valid(&self) -> bool {
        self.object_exists && self.content_hash_valid && self.size_matches && self.error.is_none()
    }
}

/// Verification result for a whole session
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SessionVerificationReport {
    /// Session verified
    pub session_id: String,
    /// Checkpoints in the session
    pub total_checkpoints: usize,
    /// Checkpoints that passed
    pub valid_checkpoints: usize,
    /// Checkpoints that failed
    pub invalid_checkpoints: usize,
    /// Parent links are well formed
    pub structure_valid: bool,
    /// Current pointer names a checkpoint of the session
    pub current_pointer_valid: bool,
    /// No blob hash is recorded with two sizes
    pub no_hash_conflicts: bool,
    /// Per-checkpoint reports
    pub checkpoint_reports: Vec<VerificationReport>,
    /// Errors by checkpoint id
    pub checkpoint_errors: BTreeMap<String, Vec<String>>,
    /// Time taken in milliseconds
    pub verification_time_ms: u64,
}

impl SessionVerificationReport {
    /// Every check passed
    pub fn is_valid(&self) -> bool {
        self.valid_checkpoints == self.total_checkpoints
            && self.structure_valid
            && self.current_pointer_valid
            && self.no_hash_conflicts
    }

    /// One-line description
    pub fn summary(&self) -> String {
        if self.is_valid() {
            format!(
                "Session {} is valid: {} checkpoints verified in {}ms",
                self.session_id, self.total_checkpoints, self.verification_time_ms
            )
        } else {
            format!(
                "Session {} has issues: {}/{} checkpoints valid, {} with errors, structure {}, pointer {}",
                self.session_id,
                self.valid_checkpoints,
                self.total_checkpoints,
                self.checkpoint_errors.len(),
                if self.structure_valid { "ok" } else { "broken" },
                if self.current_pointer_valid { "ok" } else { "invalid" }
            )
        }
    }
}

/// Checks that need no store access
#[derive(Debug)]
pub struct QuickVerifier;

impl QuickVerifier {
    /// Record's state hash matches its fields
    pub fn verify_checkpoint(checkpoint: &Checkpoint) -> bool {
        checkpoint.verify_integrity()
    }

    /// `content` hashes to `hash`
    pub fn verify_blob(hash: &BlobHash, content: &[u8]) -> bool {
        BlobHash::of(content) == *hash
    }
}

/// Outcome of [`repair`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepairReport {
    /// Blobs re-read
    pub blobs_checked: usize,
    /// Trees re-read
    pub trees_checked: usize,
    /// Objects moved to `quarantine/`, as `kind:hash`
    pub quarantined: Vec<String>,
    /// Leftover temp files removed
    pub tmp_files_removed: usize,
    /// Checkpoints whose tree or blobs are missing after the repair
    pub damaged_checkpoints: Vec<String>,
    /// Time taken in milliseconds
    pub duration_ms: u64,
}

/// Re-verify every stored object and quarantine the corrupted ones
///
/// Must not run concurrently with captures or restores; the engine holds
/// the GC gate around it.
pub fn repair(store: &ContentStore) -> Result<RepairReport> {
    let start = Instant::now();
    let mut report = RepairReport {
        tmp_files_removed: store.clean_tmp()?,
        ..Default::default()
    };

    for hash in store.list_blobs()? {
        report.blobs_checked += 1;
        match store.get(&hash) {
            Ok(_) => {}
            Err(e @ RewindError::IntegrityMismatch { .. }) => {
                warn!("Blob {} is corrupted: {}", hash.short(), e);
                store.quarantine(&hash)?;
                report.quarantined.push(format!("blob:{}", hash));
            }
            Err(e) => return Err(e),
        }
    }

    for hash in store.list_trees()? {
        report.trees_checked += 1;
        match store.get_tree(&hash) {
            Ok(_) => {}
            Err(e) if e.is_corruption() || matches!(e, RewindError::Bincode(_)) => {
                warn!("Tree {} is corrupted: {}", hash.short(), e);
                store.quarantine_tree(&hash)?;
                report.quarantined.push(format!("tree:{}", hash));
            }
            Err(e) => return Err(e),
        }
    }

    report.duration_ms = start.elapsed().as_millis() as u64;
    info!(
        "Repair checked {} blobs and {} trees, quarantined {}",
        report.blobs_checked,
        report.trees_checked,
        report.quarantined.len()
    );
    Ok(report)
}
