//! Core data types shared across the engine
//!
//! ## Overview
//!
//! - **Configuration**: [`RewindConfig`], [`StorageMetadata`]
//! - **Persisted pointers**: [`CurrentPointer`], [`SessionInfo`]
//! - **Operation results**: [`ChangeStats`], [`GcStats`], [`CheckpointMetrics`]
//! - **Line diffs**: [`DiffOptions`], [`DiffHunk`], [`LineChange`], [`FileDiff`]

use crate::compression::CompressionStrategy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Version of the on-disk layout
pub const FORMAT_VERSION: u32 = 1;

/// Glob patterns excluded from every capture unless overridden
pub fn default_ignore_patterns() -> Vec<String> {
    [".git/**", "node_modules/**", "target/**", ".rewind/**", "**/*.swp", "**/.DS_Store"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Configuration for an engine instance
///
/// Persisted in `metadata.json` when storage is initialized and reloaded
/// when it is opened again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewindConfig {
    /// Storage location
    pub storage_path: PathBuf,
    /// Glob patterns excluded from capture
    pub ignore_patterns: Vec<String>,
    /// Also honour `.gitignore` files found during the walk
    pub respect_gitignore: bool,
    /// Maximum file size to capture (0 = unlimited)
    pub max_file_size: u64,
    /// Number of workers in the bounded pool
    pub parallel_workers: usize,
    /// How blobs are framed on disk
    pub compression_strategy: CompressionStrategy,
    /// Lifetime of a resolved session root in the path cache
    pub path_cache_ttl: Duration,
    /// Entries kept in the path cache before the oldest is evicted
    pub path_cache_max_entries: usize,
    /// Buffered events per subscriber before the slowest starts lagging
    pub event_capacity: usize,
    /// Engine version that created this config
    pub version: String,
}

impl Default for RewindConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from(".rewind"),
            ignore_patterns: default_ignore_patterns(),
            respect_gitignore: false,
            max_file_size: 0,
            parallel_workers: num_cpus::get().max(1),
            compression_strategy: CompressionStrategy::Fast,
            path_cache_ttl: Duration::from_secs(30),
            path_cache_max_entries: 256,
            event_capacity: 128,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Metadata stored at the storage root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageMetadata {
    /// Version of the storage format
    pub format_version: u32,
    /// Engine version that created the storage
    pub engine_version: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Configuration
    pub config: RewindConfig,
}

/// Per-session current checkpoint pointer persisted to disk
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CurrentPointer {
    /// Checkpoint the working directory is believed to match
    pub current_checkpoint_id: Option<String>,
    /// Format version for future compatibility
    pub version: u32,
}

/// Session registration persisted to `sessions/<id>/session.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionInfo {
    /// Session identifier supplied by the session manager
    pub session_id: String,
    /// Working directory root
    pub root: PathBuf,
    /// When the session was first seen
    pub created_at: DateTime<Utc>,
    /// Archived sessions keep their history but reject new checkpoints
    #[serde(default)]
    pub archived: bool,
}

/// Statistics about changes between two trees
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeStats {
    /// Number of files added
    pub files_added: usize,
    /// Number of files modified
    pub files_modified: usize,
    /// Number of files removed
    pub files_removed: usize,
    /// Total size of added files
    pub bytes_added: u64,
    /// Total size of modified files (new size)
    pub bytes_modified: u64,
    /// Total size of removed files
    pub bytes_removed: u64,
}

impl ChangeStats {
    /// Check if there are any changes
    pub fn has_changes(&self) -> bool {
        self.total_operations() > 0
    }

    /// Sum of added, modified and removed files
    pub fn total_operations(&self) -> usize {
        self.files_added + self.files_modified + self.files_removed
    }

    /// Bytes added or modified minus bytes removed
    pub fn net_size_change(&self) -> i64 {
        (self.bytes_added + self.bytes_modified) as i64 - self.bytes_removed as i64
    }
}

/// Statistics from garbage collection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GcStats {
    /// Blobs inspected
    pub blobs_examined: usize,
    /// Blobs removed (or that would be removed in a dry run)
    pub blobs_deleted: usize,
    /// Tree manifests inspected
    pub trees_examined: usize,
    /// Tree manifests removed
    pub trees_deleted: usize,
    /// Checkpoint records no session references any more
    #[serde(default)]
    pub records_deleted: usize,
    /// Bytes reclaimed on disk
    pub bytes_reclaimed: u64,
    /// Duration in milliseconds
    pub duration_ms: u64,
    /// Hashes of unreferenced objects
    pub unreferenced: Vec<String>,
    /// Nothing was deleted
    pub dry_run: bool,
}

/// Per-checkpoint metrics computed by the worker pool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointMetrics {
    /// Checkpoint the metrics describe
    pub checkpoint_id: String,
    /// Files in the checkpoint's tree
    pub file_count: usize,
    /// Uncompressed bytes in the checkpoint's tree
    pub total_size: u64,
    /// Changes relative to the parent (everything is "added" for a root)
    pub changes: ChangeStats,
}

/// Options for line-level diffs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffOptions {
    /// Unchanged lines shown around each change
    pub context_lines: usize,
    /// Compare lines with whitespace removed
    pub ignore_whitespace: bool,
    /// Files larger than this get no line detail (0 = unlimited)
    pub max_file_size: u64,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            context_lines: 3,
            ignore_whitespace: false,
            max_file_size: 10 * 1024 * 1024,
        }
    }
}

/// One line in a hunk; the number is the line in the file it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineChange {
    /// Present only in the new file
    Added(usize, String),
    /// Present only in the old file
    Deleted(usize, String),
    /// Present in both (line number in the new file)
    Context(usize, String),
}

/// A contiguous region of changes in unified-diff terms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffHunk {
    /// First line in the old file (1-based)
    pub from_line: usize,
    /// Lines from the old file
    pub from_count: usize,
    /// First line in the new file (1-based)
    pub to_line: usize,
    /// Lines from the new file
    pub to_count: usize,
    /// Lines in order
    pub changes: Vec<LineChange>,
}

/// Line-level diff of one text file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    /// Manifest path
    pub path: String,
    /// Blob hash of the old content
    pub from_hash: String,
    /// Blob hash of the new content
    pub to_hash: String,
    /// Hunks in file order
    pub hunks: Vec<DiffHunk>,
    /// Lines only in the new file
    pub lines_added: usize,
    /// Lines only in the old file
    pub lines_deleted: usize,
}
