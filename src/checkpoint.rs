//! Checkpoint records
//!
//! A checkpoint names one tree manifest at one point in a session's history.
//! Records are immutable once written: the index stores each one as
//! `checkpoints/<id>.json` and never rewrites it.
//!
//! ## Integrity
//!
//! Every record carries a `state_hash`, the SHA-256 of its identifying
//! fields (id, session, parent, tree hash, message, timestamp, kind,
//! sequence, metadata). The index re-computes it on load, so a record edited
//! on disk is reported instead of silently trusted.
//!
//! ```rust
//! use rewind::checkpoint::{Checkpoint, CheckpointKind, CheckpointMetadataBuilder};
//! use rewind::store::BlobHash;
//!
//! let checkpoint = Checkpoint::new(
//!     "s1",
//!     None,
//!     BlobHash::of(b"tree"),
//!     "initial import",
//!     CheckpointKind::Manual,
//!     0,
//!     CheckpointMetadataBuilder::new().file_count(3).build(),
//! );
//! assert!(checkpoint.verify_integrity());
//! ```

use crate::store::TreeHash;
use crate::utils::{format_bytes, short_id};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Why a checkpoint was created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CheckpointKind {
    /// Requested by the user or the assistant at the end of a turn
    #[default]
    Manual,
    /// Automatic snapshot taken immediately before a restore
    PreRestore,
    /// Created right after restoring to an older checkpoint to start a branch
    Fork,
}

impl fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointKind::Manual => f.write_str("manual"),
            CheckpointKind::PreRestore => f.write_str("pre-restore"),
            CheckpointKind::Fork => f.write_str("fork"),
        }
    }
}

/// One node in a session's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique identifier (UUID v4)
    pub id: String,
    /// Session the checkpoint belongs to
    pub session_id: String,
    /// Parent checkpoint (None only for a session's first checkpoint)
    pub parent_id: Option<String>,
    /// Tree manifest describing the captured directory
    pub tree_hash: TreeHash,
    /// Human readable message
    pub message: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Position in the session's creation order, starting at 0
    pub sequence: u64,
    /// Why the checkpoint exists
    #[serde(default)]
    pub kind: CheckpointKind,
    /// Statistics and provenance
    pub metadata: CheckpointMetadata,
    /// SHA-256 of the fields above
    pub state_hash: String,
}

/// Statistics and provenance recorded with a checkpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Entries in the tree
    pub file_count: usize,
    /// Uncompressed bytes in the tree
    pub total_size: u64,
    /// Entries added, modified or removed relative to the parent
    pub files_changed: usize,
    /// Bytes added or modified relative to the parent
    pub bytes_changed: u64,
    /// User-defined tags
    pub tags: Vec<String>,
    /// Custom key-value metadata
    pub custom: BTreeMap<String, String>,
    /// Engine version that created the checkpoint
    pub engine_version: String,
    /// Host the checkpoint was created on
    pub host_info: HostInfo,
}

/// Information about the host system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    /// Hostname
    pub hostname: String,
    /// Operating system
    pub os: String,
    /// Architecture
    pub arch: String,
    /// Username (if available)
    pub username: Option<String>,
}

impl Default for HostInfo {
    fn default() -> Self {
        Self {
            hostname: hostname::get()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            username: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .ok(),
        }
    }
}

impl Checkpoint {
    /// Create a record with a fresh id and computed state hash
    ///
    /// # Arguments
    ///
    /// * `session_id` - Owning session
    /// * `parent_id` - The session's current checkpoint, if any
    /// * `tree_hash` - Manifest that is already persisted in the store
    /// * `message` - Human readable message
    /// * `kind` - Why the checkpoint exists
    /// * `sequence` - Position in the session's creation order
    /// * `metadata` - Statistics and provenance
    pub fn new(
        session_id: impl Into<String>,
        parent_id: Option<String>,
        tree_hash: TreeHash,
        message: impl Into<String>,
        kind: CheckpointKind,
        sequence: u64,
        metadata: CheckpointMetadata,
    ) -> Self {
        let mut checkpoint = Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            parent_id,
            tree_hash,
            message: message.into(),
            created_at: Utc::now(),
            sequence,
            kind,
            metadata,
            state_hash: String::new(),
        };
        checkpoint.state_hash = checkpoint.compute_state_hash();
        checkpoint
    }

    /// Hash every identifying field
    pub fn compute_state_hash(&self) -> String {
        let mut hasher = Sha256::new();

        // Length-prefixed so adjacent fields cannot run into each other
        for field in [
            self.id.as_str(),
            self.session_id.as_str(),
            self.parent_id.as_deref().unwrap_or(""),
            self.tree_hash.as_str(),
            self.message.as_str(),
        ] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        hasher.update(self.created_at.to_rfc3339().as_bytes());
        hasher.update(self.sequence.to_le_bytes());
        hasher.update(self.kind.to_string().as_bytes());

        if let Ok(metadata_bytes) = serde_json::to_vec(&self.metadata) {
            hasher.update(&metadata_bytes);
        }

        hex::encode(hasher.finalize())
    }

    /// Whether the stored state hash still matches the record
    pub fn verify_integrity(&self) -> bool {
        self.compute_state_hash() == self.state_hash
    }

    /// Whether this is the automatic snapshot taken before a restore
    pub fn is_pre_restore(&self) -> bool {
        self.kind == CheckpointKind::PreRestore
    }

    /// First eight characters of the id
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }

    /// One-line summary for listings
    pub fn display_format(&self) -> String {
        let kind = match self.kind {
            CheckpointKind::Manual => String::new(),
            other => format!(" ({})", other),
        };
        format!(
            "[{}] {} - {} files, {}{} - {}",
            self.short_id(),
            self.created_at.format("%Y-%m-%d %H:%M:%S"),
            self.metadata.file_count,
            format_bytes(self.metadata.total_size),
            kind,
            self.message
        )
    }
}

/// Fluent construction of [`CheckpointMetadata`]
///
/// ```rust
/// use rewind::checkpoint::CheckpointMetadataBuilder;
///
/// let metadata = CheckpointMetadataBuilder::new()
///     .file_count(250)
///     .total_size(50_000_000)
///     .files_changed(10)
///     .add_tag("turn-12")
///     .add_custom("model", "local")
///     .build();
/// assert_eq!(metadata.tags, vec!["turn-12".to_string()]);
/// ```
#[derive(Debug, Default)]
pub struct CheckpointMetadataBuilder {
    file_count: usize,
    total_size: u64,
    files_changed: usize,
    bytes_changed: u64,
    tags: Vec<String>,
    custom: BTreeMap<String, String>,
}

impl CheckpointMetadataBuilder {
    /// Start with everything zeroed
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries in the tree
    pub fn file_count(mut self, count: usize) -> Self {
        self.file_count = count;
        self
    }

    /// Uncompressed bytes in the tree
    pub fn total_size(mut self, size: u64) -> Self {
        self.total_size = size;
        self
    }

    /// Entries changed relative to the parent
    pub fn files_changed(mut self, count: usize) -> Self {
        self.files_changed = count;
        self
    }

    /// Bytes changed relative to the parent
    pub fn bytes_changed(mut self, bytes: u64) -> Self {
        self.bytes_changed = bytes;
        self
    }

    /// Append a tag
    pub fn add_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Append several tags
    pub fn tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags.extend(tags);
        self
    }

    /// Set a custom key
    pub fn add_custom(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom.insert(key.into(), value.into());
        self
    }

    /// Finish, stamping engine version and host information
    pub fn build(self) -> CheckpointMetadata {
        CheckpointMetadata {
            file_count: self.file_count,
            total_size: self.total_size,
            files_changed: self.files_changed,
            bytes_changed: self.bytes_changed,
            tags: self.tags,
            custom: self.custom,
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            host_info: HostInfo::default(),
        }
    }
}
