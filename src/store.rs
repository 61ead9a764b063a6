//! Content-addressed storage for blobs and tree manifests
//!
//! The store is the only component that touches `objects/` and `trees/`.
//! Everything it holds is immutable and keyed by the SHA-256 of the
//! *uncompressed* content:
//!
//! ```text
//! storage_root/
//! ├── metadata.json          # format version + config
//! ├── objects/<aa>/<rest>    # framed blobs
//! ├── trees/<aa>/<rest>      # framed bincode tree manifests
//! ├── quarantine/<kind>-<hash> # objects that failed verification
//! └── tmp/                   # staging area for write-if-absent
//! ```
//!
//! ## Write-if-absent
//!
//! A `put` first checks whether the key exists. If it does the call is a
//! dedup hit and nothing is written. Otherwise the framed bytes go into a
//! temp file under `tmp/` that is then linked into place with
//! `persist_noclobber`. Two captures racing on the same content both end up
//! with a valid object: the loser sees `AlreadyExists` and counts a dedup hit.
//! No cross-session locking is needed.
//!
//! ## Verification
//!
//! Every `get` re-hashes the decoded bytes. A mismatch is reported as
//! [`RewindError::IntegrityMismatch`] and never returned as data.

use crate::collections::FastSet;
use crate::compression::{BlobCodec, CompressionStats};
use crate::error::{Result, RewindError};
use crate::tree::TreeManifest;
use crate::types::{GcStats, RewindConfig, StorageMetadata, FORMAT_VERSION};
use crate::utils::{self, hash_data, short_id};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, trace, warn};
use walkdir::WalkDir;

/// SHA-256 of a blob's uncompressed bytes, lowercase hex
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobHash(String);

/// Tree manifests share the blob key format
pub type TreeHash = BlobHash;

impl BlobHash {
    /// Hash `data`
    pub fn of(data: &[u8]) -> Self {
        BlobHash(hash_data(data))
    }

    /// Parse a 64-character hex digest
    ///
    /// # Errors
    ///
    /// Returns [`RewindError::NotFound`] when `hex` cannot be a key, so a
    /// malformed id behaves like an unknown one.
    pub fn parse(hex: &str) -> Result<Self> {
        if hex.len() == 64 && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            Ok(BlobHash(hex.to_string()))
        } else {
            Err(RewindError::not_found("blob", hex))
        }
    }

    /// Full hex digest
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters
    pub fn short(&self) -> &str {
        short_id(&self.0)
    }
}

impl fmt::Display for BlobHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of [`ContentStore::store_blob`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    /// Key of the blob
    pub hash: BlobHash,
    /// `false` when the blob was already present
    pub written: bool,
}

/// Counters describing store activity since it was opened
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Blobs physically written
    pub blobs_written: u64,
    /// Uncompressed bytes of written blobs
    pub bytes_written: u64,
    /// `put` calls that found the blob already present
    pub dedup_hits: u64,
    /// Tree manifests physically written
    pub trees_written: u64,
    /// Codec counters
    pub compression: CompressionStats,
}

/// On-disk footprint of the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsage {
    /// Stored blobs
    pub blob_count: usize,
    /// Bytes used by blobs on disk (after framing)
    pub blob_bytes: u64,
    /// Stored tree manifests
    pub tree_count: usize,
}

#[derive(Debug, Default)]
struct Counters {
    blobs_written: AtomicU64,
    bytes_written: AtomicU64,
    dedup_hits: AtomicU64,
    trees_written: AtomicU64,
}

/// Which keyspace an object lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Space {
    Blob,
    Tree,
}

impl Space {
    fn dir(self) -> &'static str {
        match self {
            Space::Blob => "objects",
            Space::Tree => "trees",
        }
    }

    fn kind(self) -> &'static str {
        match self {
            Space::Blob => "blob",
            Space::Tree => "tree",
        }
    }
}

/// Content-addressed blob and tree storage
pub struct ContentStore {
    root: PathBuf,
    codec: BlobCodec,
    counters: Counters,
    metadata: StorageMetadata,
}

impl fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentStore")
            .field("root", &self.root)
            .field("strategy", self.codec.strategy())
            .finish()
    }
}

impl ContentStore {
    /// Initialize a new store
    ///
    /// # Arguments
    ///
    /// * `root` - Storage directory; must not already contain a store
    /// * `config` - Configuration persisted into `metadata.json`
    ///
    /// # Errors
    ///
    /// - [`RewindError::StorageAlreadyExists`] if `metadata.json` is present
    /// - [`RewindError::IoAt`] if directories cannot be created
    pub fn init(root: &Path, config: RewindConfig) -> Result<Self> {
        let metadata_path = root.join("metadata.json");
        if metadata_path.exists() {
            return Err(RewindError::StorageAlreadyExists(root.to_path_buf()));
        }

        for dir in ["objects", "trees", "tmp", "quarantine"] {
            let path = root.join(dir);
            fs::create_dir_all(&path).map_err(|e| RewindError::io_at("create dir", &path, e))?;
        }

        let metadata = StorageMetadata {
            format_version: FORMAT_VERSION,
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: Utc::now(),
            config,
        };
        utils::atomic_write(&metadata_path, &serde_json::to_vec_pretty(&metadata)?)?;

        info!("Initialized storage at {:?}", root);
        Ok(Self::from_parts(root, metadata))
    }

    /// Open an existing store
    ///
    /// # Errors
    ///
    /// - [`RewindError::StorageNotInitialized`] if there is no `metadata.json`
    /// - [`RewindError::InvalidConfiguration`] for an unsupported format version
    pub fn open(root: &Path) -> Result<Self> {
        let metadata_path = root.join("metadata.json");
        let raw = match fs::read(&metadata_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(RewindError::StorageNotInitialized(root.to_path_buf()))
            }
            Err(e) => return Err(RewindError::io_at("read", &metadata_path, e)),
        };
        let metadata: StorageMetadata = serde_json::from_slice(&raw)?;
        if metadata.format_version > FORMAT_VERSION {
            return Err(RewindError::InvalidConfiguration(format!(
                "storage format {} is newer than supported format {}",
                metadata.format_version, FORMAT_VERSION
            )));
        }

        let tmp = root.join("tmp");
        fs::create_dir_all(&tmp).map_err(|e| RewindError::io_at("create dir", &tmp, e))?;

        debug!("Opened storage at {:?}", root);
        Ok(Self::from_parts(root, metadata))
    }

    /// Open the store at `root`, initializing it with `config` if absent
    pub fn init_or_open(root: &Path, config: RewindConfig) -> Result<Self> {
        if root.join("metadata.json").exists() {
            Self::open(root)
        } else {
            Self::init(root, config)
        }
    }

    fn from_parts(root: &Path, metadata: StorageMetadata) -> Self {
        Self {
            root: root.to_path_buf(),
            codec: BlobCodec::new(metadata.config.compression_strategy.clone()),
            counters: Counters::default(),
            metadata,
        }
    }

    /// Storage root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Metadata loaded from `metadata.json`
    pub fn metadata(&self) -> &StorageMetadata {
        &self.metadata
    }

    /// Store `bytes` and return their hash
    ///
    /// Idempotent: storing identical bytes again writes nothing and returns
    /// the same hash.
    pub fn put(&self, bytes: &[u8]) -> Result<BlobHash> {
        Ok(self.store_blob(bytes, None)?.hash)
    }

    /// Store `bytes`, passing the originating path to the compression strategy
    ///
    /// # Returns
    ///
    /// The hash plus whether this call physically wrote the blob, so a
    /// capture can count its own writes while other sessions share the store.
    pub fn store_blob(&self, bytes: &[u8], hint: Option<&Path>) -> Result<StoredBlob> {
        let hash = BlobHash::of(bytes);
        let written = self.write_if_absent(Space::Blob, &hash, || self.codec.encode(hint, bytes))?;
        if written {
            self.counters.blobs_written.fetch_add(1, Ordering::Relaxed);
            self.counters
                .bytes_written
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
            trace!("Stored blob {} ({} bytes)", hash.short(), bytes.len());
        } else {
            self.counters.dedup_hits.fetch_add(1, Ordering::Relaxed);
            trace!("Blob {} already present", hash.short());
        }
        Ok(StoredBlob { hash, written })
    }

    /// Load a blob, verifying its hash
    ///
    /// # Errors
    ///
    /// - [`RewindError::NotFound`] if the hash is unknown
    /// - [`RewindError::IntegrityMismatch`] if the stored bytes no longer
    ///   hash to `hash`
    pub fn get(&self, hash: &BlobHash) -> Result<Vec<u8>> {
        self.read_verified(Space::Blob, hash)
    }

    /// Check whether a blob is stored
    pub fn exists(&self, hash: &BlobHash) -> bool {
        self.object_path(Space::Blob, hash).is_file()
    }

    /// Store a tree manifest and return its tree hash
    pub fn put_tree(&self, manifest: &TreeManifest) -> Result<TreeHash> {
        let bytes = manifest.to_bytes()?;
        let hash = BlobHash::of(&bytes);
        if self.write_if_absent(Space::Tree, &hash, || self.codec.encode(None, &bytes))? {
            self.counters.trees_written.fetch_add(1, Ordering::Relaxed);
            trace!("Stored tree {} ({} entries)", hash.short(), manifest.len());
        }
        Ok(hash)
    }

    /// Load a tree manifest, verifying its hash
    pub fn get_tree(&self, hash: &TreeHash) -> Result<TreeManifest> {
        let bytes = self.read_verified(Space::Tree, hash)?;
        TreeManifest::from_bytes(&bytes)
    }

    /// Check whether a tree manifest is stored
    pub fn tree_exists(&self, hash: &TreeHash) -> bool {
        self.object_path(Space::Tree, hash).is_file()
    }

    /// Hashes of every stored blob, sorted
    pub fn list_blobs(&self) -> Result<Vec<BlobHash>> {
        self.list(Space::Blob)
    }

    /// Hashes of every stored tree manifest, sorted
    pub fn list_trees(&self) -> Result<Vec<TreeHash>> {
        self.list(Space::Tree)
    }

    /// Remove every blob not in `live`
    ///
    /// Must not run while a capture or restore may still read blobs; the
    /// engine holds the GC gate exclusively around this call.
    #[instrument(skip(self, live), fields(live = live.len()))]
    pub fn delete_unreferenced(&self, live: &FastSet<BlobHash>) -> Result<GcStats> {
        self.sweep(Space::Blob, live, false)
    }

    /// Remove every tree manifest not in `live`
    pub fn delete_unreferenced_trees(&self, live: &FastSet<TreeHash>) -> Result<GcStats> {
        self.sweep(Space::Tree, live, false)
    }

    /// Report what [`delete_unreferenced`](Self::delete_unreferenced) would remove
    pub fn find_unreferenced(&self, live: &FastSet<BlobHash>) -> Result<GcStats> {
        self.sweep(Space::Blob, live, true)
    }

    /// Report which tree manifests are unreferenced without deleting them
    pub fn find_unreferenced_trees(&self, live: &FastSet<TreeHash>) -> Result<GcStats> {
        self.sweep(Space::Tree, live, true)
    }

    /// Move a corrupted blob out of the keyspace
    ///
    /// # Returns
    ///
    /// Where the blob now lives under `quarantine/`.
    pub fn quarantine(&self, hash: &BlobHash) -> Result<PathBuf> {
        self.move_to_quarantine(Space::Blob, hash)
    }

    /// Move a corrupted tree manifest out of the keyspace
    pub fn quarantine_tree(&self, hash: &TreeHash) -> Result<PathBuf> {
        self.move_to_quarantine(Space::Tree, hash)
    }

    fn move_to_quarantine(&self, space: Space, hash: &BlobHash) -> Result<PathBuf> {
        let from = self.object_path(space, hash);
        let dir = self.root.join("quarantine");
        fs::create_dir_all(&dir).map_err(|e| RewindError::io_at("create dir", &dir, e))?;
        let to = dir.join(format!("{}-{}", space.kind(), hash.as_str()));
        fs::rename(&from, &to).map_err(|e| RewindError::io_at("quarantine", &from, e))?;
        warn!("Quarantined {} {}", space.kind(), hash.short());
        Ok(to)
    }

    /// Remove leftovers from interrupted writes
    pub fn clean_tmp(&self) -> Result<usize> {
        let tmp = self.root.join("tmp");
        let mut removed = 0;
        if let Ok(entries) = fs::read_dir(&tmp) {
            for entry in entries.flatten() {
                if fs::remove_file(entry.path()).is_ok() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Activity counters since the store was opened
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            blobs_written: self.counters.blobs_written.load(Ordering::Relaxed),
            bytes_written: self.counters.bytes_written.load(Ordering::Relaxed),
            dedup_hits: self.counters.dedup_hits.load(Ordering::Relaxed),
            trees_written: self.counters.trees_written.load(Ordering::Relaxed),
            compression: self.codec.stats(),
        }
    }

    /// Count stored objects and their size on disk
    pub fn disk_usage(&self) -> Result<DiskUsage> {
        let mut usage = DiskUsage::default();
        for entry in WalkDir::new(self.root.join(Space::Blob.dir()))
            .min_depth(2)
            .max_depth(2)
        {
            let entry = entry.map_err(|e| RewindError::internal(e.to_string()))?;
            if entry.file_type().is_file() {
                usage.blob_count += 1;
                let metadata = entry
                    .metadata()
                    .map_err(|e| RewindError::io_at("stat", entry.path(), e.into()))?;
                usage.blob_bytes += metadata.len();
            }
        }
        usage.tree_count = self.list_trees()?.len();
        Ok(usage)
    }

    fn object_path(&self, space: Space, hash: &BlobHash) -> PathBuf {
        let (prefix, suffix) = hash.as_str().split_at(2);
        self.root.join(space.dir()).join(prefix).join(suffix)
    }

    /// Returns `true` when this call wrote the object
    fn write_if_absent(
        &self,
        space: Space,
        hash: &BlobHash,
        encode: impl FnOnce() -> Vec<u8>,
    ) -> Result<bool> {
        let path = self.object_path(space, hash);
        if path.is_file() {
            return Ok(false);
        }

        let shard = path
            .parent()
            .ok_or_else(|| RewindError::internal(format!("object path {:?} has no parent", path)))?;
        fs::create_dir_all(shard).map_err(|e| RewindError::io_at("create dir", shard, e))?;

        let tmp_dir = self.root.join("tmp");
        let mut temp = NamedTempFile::new_in(&tmp_dir)
            .map_err(|e| RewindError::io_at("create temp file", &tmp_dir, e))?;
        temp.write_all(&encode())
            .and_then(|_| temp.as_file().sync_data())
            .map_err(|e| RewindError::io_at("write", temp.path().to_path_buf(), e))?;

        match temp.persist_noclobber(&path) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                debug!("Lost write race for {} {}", space.kind(), hash.short());
                Ok(false)
            }
            Err(e) => Err(RewindError::io_at("persist", &path, e.error)),
        }
    }

    fn read_verified(&self, space: Space, hash: &BlobHash) -> Result<Vec<u8>> {
        let path = self.object_path(space, hash);
        let framed = match fs::read(&path) {
            Ok(framed) => framed,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(RewindError::not_found(space.kind(), hash.as_str()))
            }
            Err(e) => return Err(RewindError::io_at("read", &path, e)),
        };

        let content = self.codec.decode(&framed).map_err(|e| RewindError::IntegrityMismatch {
            hash: hash.to_string(),
            actual: format!("undecodable ({})", e),
        })?;

        let actual = hash_data(&content);
        if actual != hash.as_str() {
            return Err(RewindError::IntegrityMismatch {
                hash: hash.to_string(),
                actual,
            });
        }
        Ok(content)
    }

    fn list(&self, space: Space) -> Result<Vec<BlobHash>> {
        let mut hashes = Vec::new();
        for entry in WalkDir::new(self.root.join(space.dir()))
            .min_depth(2)
            .max_depth(2)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| RewindError::internal(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let prefix = entry
                .path()
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            let suffix = entry.file_name().to_str().unwrap_or_default();
            match BlobHash::parse(&format!("{}{}", prefix, suffix)) {
                Ok(hash) => hashes.push(hash),
                Err(_) => trace!("Ignoring stray file {:?}", entry.path()),
            }
        }
        Ok(hashes)
    }

    fn sweep(&self, space: Space, live: &FastSet<BlobHash>, dry_run: bool) -> Result<GcStats> {
        let start = Instant::now();
        let mut stats = GcStats {
            dry_run,
            ..Default::default()
        };

        let all = self.list(space)?;
        let mut removed = 0;
        for hash in &all {
            if live.contains(hash) {
                continue;
            }
            let path = self.object_path(space, hash);
            let metadata = fs::metadata(&path).map_err(|e| RewindError::io_at("stat", &path, e))?;
            stats.bytes_reclaimed += metadata.len();
            stats.unreferenced.push(hash.to_string());
            if !dry_run {
                fs::remove_file(&path).map_err(|e| RewindError::io_at("remove", &path, e))?;
                if let Some(shard) = path.parent() {
                    utils::remove_dir_if_empty(shard)?;
                }
            }
            removed += 1;
        }

        match space {
            Space::Blob => {
                stats.blobs_examined = all.len();
                stats.blobs_deleted = removed;
            }
            Space::Tree => {
                stats.trees_examined = all.len();
                stats.trees_deleted = removed;
            }
        }
        stats.duration_ms = start.elapsed().as_millis() as u64;
        debug!(
            "Swept {} {}s: {} unreferenced (dry run: {})",
            all.len(),
            space.kind(),
            removed,
            dry_run
        );
        Ok(stats)
    }
}
