//! Error types for the rewind engine
//!
//! Every failure the engine can surface is a variant of [`RewindError`]. The
//! five taxonomy variants callers are expected to branch on are:
//!
//! - [`RewindError::NotFound`]: an unknown checkpoint, blob, tree or session id
//! - [`RewindError::CaptureIncomplete`]: the working directory changed underneath a capture
//! - [`RewindError::RestoreFailed`]: a restore applied only part of its delta
//! - [`RewindError::IntegrityMismatch`]: stored bytes no longer hash to their key
//! - [`RewindError::ConcurrencyConflict`]: the session lock is held by another operation
//!
//! The remaining variants wrap lower-level failures and always carry enough
//! context (path, operation, checkpoint id) to diagnose without re-running.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the rewind engine
pub type Result<T> = std::result::Result<T, RewindError>;

/// Main error type for all engine operations
#[derive(Debug, Error)]
pub enum RewindError {
    /// Unknown checkpoint, blob, tree or session
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What kind of object was looked up ("checkpoint", "blob", "tree", "session")
        kind: &'static str,
        /// The id or hash that was requested
        id: String,
    },

    /// A file became unreadable while the working directory was being walked
    #[error("capture incomplete at {path:?}: {reason}")]
    CaptureIncomplete {
        /// Offending path
        path: PathBuf,
        /// Underlying cause
        reason: String,
    },

    /// A restore stopped part way through applying its delta
    #[error("restore to {checkpoint_id} failed with {} unapplied path(s): {reason}", unapplied.len())]
    RestoreFailed {
        /// Target checkpoint of the restore
        checkpoint_id: String,
        /// Paths (relative to the session root) that were not applied
        unapplied: Vec<PathBuf>,
        /// First failure encountered
        reason: String,
    },

    /// A stored object's bytes no longer hash to its key
    #[error("integrity mismatch for {hash}: content hashes to {actual}")]
    IntegrityMismatch {
        /// Key the object is stored under
        hash: String,
        /// Hash of the bytes actually read
        actual: String,
    },

    /// An operation was attempted while the session lock is held
    #[error("session '{session_id}' is busy: cannot {requested} while {holder} is running")]
    ConcurrencyConflict {
        /// Session whose lock is held
        session_id: String,
        /// Operation that was refused
        requested: String,
        /// Operation currently holding the lock
        holder: String,
    },

    /// An operation observed a cancellation request and stopped
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// I/O errors without further context
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O error tied to a path and operation
    #[error("{op} failed for {path:?}: {source}")]
    IoAt {
        /// Operation being performed
        op: &'static str,
        /// Path involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors during bincode serialization/deserialization
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// Blob framing could not be decoded
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// A checkpoint id prefix matched more than one checkpoint
    #[error("checkpoint prefix '{prefix}' is ambiguous ({matches} matches)")]
    AmbiguousId {
        /// Prefix that was looked up
        prefix: String,
        /// Number of checkpoints sharing the prefix
        matches: usize,
    },

    /// Invalid ignore pattern
    #[error("Invalid ignore pattern: {0}")]
    InvalidPattern(String),

    /// Session ids must be non-empty and filesystem safe
    #[error("Invalid session id: {0:?}")]
    InvalidSessionId(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Storage is not initialized
    #[error("Storage not initialized at path: {0:?}")]
    StorageNotInitialized(PathBuf),

    /// Storage already exists
    #[error("Storage already exists at path: {0:?}")]
    StorageAlreadyExists(PathBuf),

    /// A parent link would close a cycle in the history graph
    #[error("Circular dependency detected in timeline at {0}")]
    CircularDependency(String),

    /// Worker pool construction or dispatch failed
    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<bincode::error::DecodeError> for RewindError {
    fn from(err: bincode::error::DecodeError) -> Self {
        RewindError::Bincode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for RewindError {
    fn from(err: bincode::error::EncodeError) -> Self {
        RewindError::Bincode(err.to_string())
    }
}

impl From<globset::Error> for RewindError {
    fn from(err: globset::Error) -> Self {
        RewindError::InvalidPattern(err.to_string())
    }
}

impl RewindError {
    /// Create a not-found error
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        RewindError::NotFound { kind, id: id.into() }
    }

    /// Wrap an I/O error with the operation and path that produced it
    pub fn io_at(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RewindError::IoAt {
            op,
            path: path.into(),
            source,
        }
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        RewindError::Internal(msg.into())
    }

    /// Check if the caller can reasonably retry the operation
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RewindError::NotFound { .. }
                | RewindError::CaptureIncomplete { .. }
                | RewindError::ConcurrencyConflict { .. }
                | RewindError::Cancelled(_)
        )
    }

    /// Check if this error indicates corrupted storage
    pub fn is_corruption(&self) -> bool {
        matches!(self, RewindError::IntegrityMismatch { .. })
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            RewindError::NotFound { kind: "checkpoint", id } => {
                format!("Checkpoint '{}' not found. Use 'rewind list' to see available checkpoints.", id)
            }
            RewindError::CaptureIncomplete { path, .. } => {
                format!("{:?} changed while it was being captured. Retry the checkpoint.", path)
            }
            RewindError::RestoreFailed { unapplied, .. } => {
                format!(
                    "{}. {} path(s) were not restored; run 'rewind status' to inspect the working directory and retry.",
                    self,
                    unapplied.len()
                )
            }
            RewindError::IntegrityMismatch { hash, .. } => {
                format!("Stored object {} is corrupted. Run 'rewind repair' to quarantine it.", hash)
            }
            RewindError::ConcurrencyConflict { .. } => {
                format!("{}. Wait for it to finish and try again.", self)
            }
            RewindError::StorageNotInitialized(path) => {
                format!("Storage not initialized at {:?}. Run 'rewind init' first.", path)
            }
            _ => self.to_string(),
        }
    }
}
