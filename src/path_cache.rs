//! TTL cache for resolved working-directory roots
//!
//! Session roots are canonicalized before every capture and restore so that
//! two spellings of one directory land on the same session state. The
//! cache keeps recent resolutions for a configurable time; the clock is
//! injected so expiry is testable without sleeping.

use crate::collections::{fast_map, FastMap};
use crate::error::{Result, RewindError};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Source of monotonic time
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> Instant;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock advanced by hand
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    /// Clock frozen at the current instant
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

/// Expiry and size limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathCacheConfig {
    /// How long a resolution stays valid
    pub ttl: Duration,
    /// Entries kept before the oldest is evicted
    pub max_entries: usize,
}

impl Default for PathCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            max_entries: 256,
        }
    }
}

/// Hit and miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PathCacheStats {
    /// Live entries
    pub entries: usize,
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that resolved the path
    pub misses: u64,
    /// Entries dropped for age or size
    pub evictions: u64,
}

impl PathCacheStats {
    /// Fraction of lookups served from the cache
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Entry {
    resolved: PathBuf,
    inserted_at: Instant,
}

struct Inner {
    entries: FastMap<PathBuf, Entry>,
    stats: PathCacheStats,
}

/// Canonical path cache
pub struct PathCache {
    config: PathCacheConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for PathCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathCache").field("config", &self.config).finish()
    }
}

impl PathCache {
    /// Cache using the wall clock
    pub fn new(config: PathCacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Cache using an injected clock
    pub fn with_clock(config: PathCacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(Inner {
                entries: fast_map(),
                stats: PathCacheStats::default(),
            }),
        }
    }

    /// Canonical form of `path`
    ///
    /// # Errors
    ///
    /// [`RewindError::IoAt`] if the path does not exist
    pub fn resolve(&self, path: &Path) -> Result<PathBuf> {
        let now = self.clock.now();
        {
            let mut inner = self.inner.lock();
            let fresh = inner
                .entries
                .get(path)
                .filter(|e| now.saturating_duration_since(e.inserted_at) < self.config.ttl)
                .map(|e| e.resolved.clone());
            match fresh {
                Some(resolved) => {
                    inner.stats.hits += 1;
                    return Ok(resolved);
                }
                None => {
                    if inner.entries.remove(path).is_some() {
                        inner.stats.evictions += 1;
                    }
                    inner.stats.misses += 1;
                }
            }
        }

        // Resolve outside the lock; concurrent misses for one path are harmless
        let resolved = path
            .canonicalize()
            .map_err(|e| RewindError::io_at("canonicalize", path, e))?;
        trace!("Resolved {:?} to {:?}", path, resolved);

        if self.config.max_entries > 0 {
            let mut inner = self.inner.lock();
            self.evict(&mut inner, now);
            inner.entries.insert(
                path.to_path_buf(),
                Entry {
                    resolved: resolved.clone(),
                    inserted_at: now,
                },
            );
        }
        Ok(resolved)
    }

    fn evict(&self, inner: &mut Inner, now: Instant) {
        let ttl = self.config.ttl;
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, e| now.saturating_duration_since(e.inserted_at) < ttl);
        let mut evicted = before - inner.entries.len();

        while inner.entries.len() >= self.config.max_entries {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    inner.entries.remove(&key);
                    evicted += 1;
                }
                None => break,
            }
        }
        inner.stats.evictions += evicted as u64;
    }

    /// Forget one path
    pub fn invalidate(&self, path: &Path) {
        self.inner.lock().entries.remove(path);
    }

    /// Forget everything
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    /// Counters
    pub fn stats(&self) -> PathCacheStats {
        let inner = self.inner.lock();
        PathCacheStats {
            entries: inner.entries.len(),
            ..inner.stats
        }
    }
}
