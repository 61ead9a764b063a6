//! Hash map aliases that switch between gxhash and std hashing based on the
//! `gxhash` feature. Building without the feature avoids the AES-NI/SSE2
//! requirement at the cost of slower in-memory lookups.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use dashmap::DashMap;

/// Build hasher used by every in-memory map in the crate
#[cfg(feature = "gxhash")]
pub use gxhash::GxBuildHasher as FastBuildHasher;

/// Build hasher used by every in-memory map in the crate
#[cfg(not(feature = "gxhash"))]
pub type FastBuildHasher = std::hash::RandomState;

/// HashMap keyed with [`FastBuildHasher`]
pub type FastMap<K, V> = HashMap<K, V, FastBuildHasher>;

/// HashSet keyed with [`FastBuildHasher`]
pub type FastSet<T> = HashSet<T, FastBuildHasher>;

/// Concurrent map keyed with [`FastBuildHasher`]
pub type ConcurrentMap<K, V> = DashMap<K, V, FastBuildHasher>;

/// Create an empty [`FastMap`]
pub fn fast_map<K, V>() -> FastMap<K, V> {
    HashMap::with_hasher(FastBuildHasher::default())
}

/// Create an empty [`FastSet`]
pub fn fast_set<T>() -> FastSet<T> {
    HashSet::with_hasher(FastBuildHasher::default())
}

/// Create a [`ConcurrentMap`] with room for `capacity` entries
pub fn concurrent_map<K: Eq + Hash, V>(capacity: usize) -> ConcurrentMap<K, V> {
    DashMap::with_capacity_and_hasher(capacity, FastBuildHasher::default())
}
