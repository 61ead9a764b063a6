//! Tree Builder: capture a working directory as a content-addressed manifest
//!
//! A [`TreeManifest`] maps every captured path (relative, `/`-separated) to a
//! [`TreeEntry`] of blob hash, mode and size. Entries live in a `BTreeMap`, so
//! serialization is ordered and two identical directory states always
//! produce byte-identical manifests and therefore identical tree hashes. The
//! tree hash is the SHA-256 of the bincode encoding.
//!
//! ## Entry kinds
//!
//! - [`EntryKind::Regular`]: the blob holds the file's bytes
//! - [`EntryKind::Symlink`]: the blob holds the link target, never the
//!   target's content
//! - [`EntryKind::Special`]: FIFOs, sockets and devices; the blob holds a
//!   short tag naming the kind
//!
//! Directories are implied by the paths of their files; empty directories
//! are not recorded.
//!
//! ## Failure semantics
//!
//! Any entry that cannot be read (permission error, concurrent deletion)
//! fails the whole capture with [`RewindError::CaptureIncomplete`] naming the
//! path. Blobs stored before the failure stay in the store as unreferenced
//! garbage, but no manifest or checkpoint is ever produced from a partial
//! walk.

use crate::error::{Result, RewindError};
use crate::store::{BlobHash, ContentStore, StoredBlob, TreeHash};
use crate::utils::{self, manifest_path};
use crate::worker::{CancelToken, WorkerPool};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, trace, warn};

/// Decides whether a path is excluded from capture
///
/// Receives the path relative to the capture root. Returning `true` skips
/// the path (and everything under it, for directories).
pub type IgnorePredicate = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// Predicate that excludes nothing
pub fn include_everything() -> IgnorePredicate {
    Arc::new(|_| false)
}

/// What a manifest entry describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// Regular file
    Regular,
    /// Symbolic link (blob = link target)
    Symlink,
    /// FIFO, socket or device node (blob = kind tag)
    Special,
}

/// One captured path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Kind marker
    pub kind: EntryKind,
    /// Blob holding the content, link target or special-file tag
    pub hash: BlobHash,
    /// Content length in bytes
    pub size: u64,
    /// Permission bits
    pub mode: u32,
}

/// Ordered path → entry mapping for one directory state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeManifest {
    entries: BTreeMap<String, TreeEntry>,
}

impl TreeManifest {
    /// Empty manifest
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an entry
    pub fn insert(&mut self, path: impl Into<String>, entry: TreeEntry) {
        self.entries.insert(path.into(), entry);
    }

    /// Entry at `path`
    pub fn get(&self, path: &str) -> Option<&TreeEntry> {
        self.entries.get(path)
    }

    /// Entries in path order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &TreeEntry)> {
        self.entries.iter()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the manifest has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of entry sizes
    pub fn total_size(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }

    /// Every blob the manifest references
    pub fn blob_hashes(&self) -> impl Iterator<Item = &BlobHash> {
        self.entries.values().map(|e| &e.hash)
    }

    /// Canonical serialized form
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(self, bincode::config::standard())?)
    }

    /// Parse the canonical serialized form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (manifest, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(manifest)
    }

    /// Hash of the canonical serialized form
    pub fn tree_hash(&self) -> Result<TreeHash> {
        Ok(BlobHash::of(&self.to_bytes()?))
    }
}

/// Glob-based ignore rules
///
/// Patterns are matched against the path relative to the capture root.
/// A pattern ending in `/**` also matches the directory itself, so the walk
/// prunes it instead of descending.
#[derive(Debug, Clone)]
pub struct IgnoreMatcher {
    set: GlobSet,
    excluded_dirs: Vec<PathBuf>,
}

impl IgnoreMatcher {
    /// Compile `patterns`
    ///
    /// # Errors
    ///
    /// Returns [`RewindError::InvalidPattern`] for a malformed glob.
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(Glob::new(pattern)?);
            if let Some(dir) = pattern.strip_suffix("/**") {
                if !dir.is_empty() {
                    builder.add(Glob::new(dir)?);
                }
            }
        }
        Ok(Self {
            set: builder.build()?,
            excluded_dirs: Vec::new(),
        })
    }

    /// Also exclude an absolute directory (typically the storage directory)
    pub fn exclude_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.excluded_dirs.push(dir.into());
        self
    }

    /// Whether a root-relative path matches any pattern
    pub fn is_match(&self, relative: &Path) -> bool {
        self.set.is_match(relative)
    }

    /// Turn the rules into a predicate for captures under `root`
    pub fn into_predicate(self, root: &Path) -> IgnorePredicate {
        let excluded: Vec<PathBuf> = self
            .excluded_dirs
            .iter()
            .filter_map(|dir| dir.strip_prefix(root).ok())
            .filter(|rel| !rel.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .collect();
        let set = self.set;
        Arc::new(move |relative: &Path| {
            set.is_match(relative) || excluded.iter().any(|dir| relative.starts_with(dir))
        })
    }
}

/// Capture tuning
#[derive(Debug, Clone, Default)]
pub struct CaptureOptions {
    /// Skip regular files larger than this (0 = unlimited)
    pub max_file_size: u64,
    /// Also honour `.gitignore` files inside the root
    pub respect_gitignore: bool,
    /// Hash content without storing it (status checks)
    pub hash_only: bool,
}

/// Counters for one capture
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureStats {
    /// Entries recorded in the manifest
    pub entries: usize,
    /// Bytes recorded in the manifest
    pub bytes: u64,
    /// Blobs this capture physically wrote
    pub blobs_written: usize,
    /// Blobs that were already present
    pub dedup_hits: usize,
    /// Files skipped by the size limit
    pub skipped_large: usize,
    /// Wall time in milliseconds
    pub duration_ms: u64,
}

/// Walks a directory and stores its content
pub struct TreeBuilder<'a> {
    store: &'a ContentStore,
    pool: &'a WorkerPool,
    options: CaptureOptions,
}

struct Candidate {
    key: String,
    path: PathBuf,
}

enum Captured {
    Entry {
        key: String,
        entry: TreeEntry,
        written: bool,
    },
    SkippedLarge,
}

impl<'a> TreeBuilder<'a> {
    /// Builder storing into `store` using the threads of `pool`
    pub fn new(store: &'a ContentStore, pool: &'a WorkerPool) -> Self {
        Self {
            store,
            pool,
            options: CaptureOptions::default(),
        }
    }

    /// Replace the capture options
    pub fn with_options(mut self, options: CaptureOptions) -> Self {
        self.options = options;
        self
    }

    /// The same builder with `max_file_size` lifted
    ///
    /// Pre-restore captures use this so a file that outgrew the limit is
    /// still saved before it can be overwritten.
    pub fn without_size_limit(&self) -> TreeBuilder<'a> {
        TreeBuilder {
            store: self.store,
            pool: self.pool,
            options: CaptureOptions {
                max_file_size: 0,
                ..self.options.clone()
            },
        }
    }

    /// Capture `root`, skipping paths for which `ignore` returns `true`
    ///
    /// # Errors
    ///
    /// - [`RewindError::CaptureIncomplete`] if an entry cannot be read
    pub fn capture(&self, root: &Path, ignore: &IgnorePredicate) -> Result<TreeManifest> {
        Ok(self.capture_with_stats(root, ignore, &CancelToken::new())?.0)
    }

    /// Capture `root` and report counters
    ///
    /// # Arguments
    ///
    /// * `root` - Directory to capture
    /// * `ignore` - Exclusion predicate over root-relative paths
    /// * `cancel` - Checked between entries
    ///
    /// # Returns
    ///
    /// The manifest (not yet stored as a tree) and per-capture counters.
    ///
    /// # Errors
    ///
    /// - [`RewindError::CaptureIncomplete`] if an entry cannot be read
    /// - [`RewindError::Cancelled`] if `cancel` fires; nothing is returned
    #[instrument(skip(self, ignore, cancel))]
    pub fn capture_with_stats(
        &self,
        root: &Path,
        ignore: &IgnorePredicate,
        cancel: &CancelToken,
    ) -> Result<(TreeManifest, CaptureStats)> {
        let start = Instant::now();
        let candidates = self.walk(root, ignore, cancel)?;
        trace!("Walk found {} candidates", candidates.len());

        let captured: Vec<Captured> = self.pool.install(|| {
            candidates
                .par_iter()
                .map(|candidate| {
                    cancel.check("capture")?;
                    self.capture_entry(candidate)
                })
                .collect::<Result<Vec<_>>>()
        })?;
        cancel.check("capture")?;

        let mut manifest = TreeManifest::new();
        let mut stats = CaptureStats::default();
        for item in captured {
            match item {
                Captured::Entry {
                    key,
                    entry,
                    written,
                } => {
                    if written {
                        stats.blobs_written += 1;
                    } else {
                        stats.dedup_hits += 1;
                    }
                    stats.bytes += entry.size;
                    manifest.insert(key, entry);
                }
                Captured::SkippedLarge => stats.skipped_large += 1,
            }
        }
        stats.entries = manifest.len();
        stats.duration_ms = start.elapsed().as_millis() as u64;

        debug!(
            "Captured {} entries ({} bytes, {} new blobs) in {:?}",
            stats.entries,
            stats.bytes,
            stats.blobs_written,
            start.elapsed()
        );
        Ok((manifest, stats))
    }

    fn walk(&self, root: &Path, ignore: &IgnorePredicate, cancel: &CancelToken) -> Result<Vec<Candidate>> {
        let metadata = fs::metadata(root).map_err(|e| RewindError::CaptureIncomplete {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;
        if !metadata.is_dir() {
            return Err(RewindError::CaptureIncomplete {
                path: root.to_path_buf(),
                reason: "capture root is not a directory".to_string(),
            });
        }

        let filter_root = root.to_path_buf();
        let predicate = Arc::clone(ignore);
        let mut builder = WalkBuilder::new(root);
        builder
            .standard_filters(false)
            .git_ignore(self.options.respect_gitignore)
            .require_git(false)
            .follow_links(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .filter_entry(move |entry| match entry.path().strip_prefix(&filter_root) {
                Ok(rel) if !rel.as_os_str().is_empty() => !predicate(rel),
                _ => true,
            });

        let mut candidates = Vec::new();
        for result in builder.build() {
            cancel.check("capture")?;
            let entry = result.map_err(|e| walk_error(root, e))?;
            if entry.depth() == 0 {
                continue;
            }
            let is_dir = entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false);
            if is_dir {
                continue;
            }
            let key = manifest_path(entry.path(), root)?;
            candidates.push(Candidate {
                key,
                path: entry.into_path(),
            });
        }
        Ok(candidates)
    }

    fn capture_entry(&self, candidate: &Candidate) -> Result<Captured> {
        let incomplete = |e: std::io::Error| RewindError::CaptureIncomplete {
            path: PathBuf::from(&candidate.key),
            reason: e.to_string(),
        };

        let metadata = fs::symlink_metadata(&candidate.path).map_err(incomplete)?;
        let file_type = metadata.file_type();
        let mode = utils::mode_of(&metadata);

        let (kind, content) = if file_type.is_symlink() {
            let target = fs::read_link(&candidate.path).map_err(incomplete)?;
            (EntryKind::Symlink, link_target_bytes(&target))
        } else if file_type.is_file() {
            if self.options.max_file_size > 0 && metadata.len() > self.options.max_file_size {
                warn!(
                    "Skipping {} ({} bytes exceeds limit of {} bytes)",
                    candidate.key,
                    metadata.len(),
                    self.options.max_file_size
                );
                return Ok(Captured::SkippedLarge);
            }
            (EntryKind::Regular, fs::read(&candidate.path).map_err(incomplete)?)
        } else {
            (EntryKind::Special, special_tag(&metadata).into_bytes())
        };

        let stored = if self.options.hash_only {
            StoredBlob {
                hash: BlobHash::of(&content),
                written: false,
            }
        } else {
            self.store
                .store_blob(&content, Some(Path::new(&candidate.key)))?
        };
        Ok(Captured::Entry {
            key: candidate.key.clone(),
            entry: TreeEntry {
                kind,
                hash: stored.hash,
                size: content.len() as u64,
                mode,
            },
            written: stored.written,
        })
    }
}

fn walk_error(root: &Path, err: ignore::Error) -> RewindError {
    fn path_of(err: &ignore::Error) -> Option<&Path> {
        match err {
            ignore::Error::WithPath { path, .. } => Some(path.as_path()),
            ignore::Error::WithDepth { err, .. } | ignore::Error::WithLineNumber { err, .. } => {
                path_of(err)
            }
            _ => None,
        }
    }

    let path = path_of(&err)
        .map(|p| p.strip_prefix(root).unwrap_or(p).to_path_buf())
        .unwrap_or_else(|| root.to_path_buf());
    RewindError::CaptureIncomplete {
        path,
        reason: err.to_string(),
    }
}

#[cfg(unix)]
fn link_target_bytes(target: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    target.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
fn link_target_bytes(target: &Path) -> Vec<u8> {
    target.to_string_lossy().into_owned().into_bytes()
}

/// Link target stored in a symlink blob
#[cfg(unix)]
pub fn link_target_from_bytes(bytes: &[u8]) -> PathBuf {
    use std::os::unix::ffi::OsStrExt;
    PathBuf::from(std::ffi::OsStr::from_bytes(bytes))
}

/// Link target stored in a symlink blob
#[cfg(not(unix))]
pub fn link_target_from_bytes(bytes: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
}

#[cfg(unix)]
fn special_tag(metadata: &fs::Metadata) -> String {
    use std::os::unix::fs::FileTypeExt;
    let ft = metadata.file_type();
    let kind = if ft.is_fifo() {
        "fifo"
    } else if ft.is_socket() {
        "socket"
    } else if ft.is_block_device() {
        "block-device"
    } else if ft.is_char_device() {
        "char-device"
    } else {
        "unknown"
    };
    format!("special:{}", kind)
}

#[cfg(not(unix))]
fn special_tag(_metadata: &fs::Metadata) -> String {
    "special:unknown".to_string()
}
