//! Per-session operation locks
//!
//! Capture, restore and GC mutate a session's working directory or its
//! index entries, so at most one of them runs per session. A second request
//! fails fast with [`RewindError::ConcurrencyConflict`] naming the holder
//! instead of queueing behind it.
//!
//! GC additionally removes shared blobs, so it takes a store-wide gate in
//! write mode while captures and restores hold it in read mode. Sessions
//! never wait on each other except through that gate.
//!
//! Reads (diff, list, get) take no lock.

use crate::collections::{concurrent_map, ConcurrentMap};
use crate::error::{Result, RewindError};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Operations that need exclusive access to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Working directory capture and checkpoint creation
    Capture,
    /// Restore to an earlier checkpoint
    Restore,
    /// Garbage collection
    Gc,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Capture => f.write_str("capture"),
            OperationKind::Restore => f.write_str("restore"),
            OperationKind::Gc => f.write_str("gc"),
        }
    }
}

type Slot = Arc<Mutex<Option<OperationKind>>>;

/// Lock table keyed by session id
pub struct SessionLocks {
    slots: ConcurrentMap<String, Slot>,
    gc_gate: RwLock<()>,
}

impl fmt::Debug for SessionLocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLocks")
            .field("sessions", &self.slots.len())
            .finish()
    }
}

impl Default for SessionLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLocks {
    /// Empty lock table
    pub fn new() -> Self {
        Self {
            slots: concurrent_map(16),
            gc_gate: RwLock::new(()),
        }
    }

    fn slot(&self, session_id: &str) -> Slot {
        Arc::clone(
            self.slots
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .value(),
        )
    }

    fn claim(&self, session_id: &str, operation: OperationKind) -> Result<Slot> {
        let slot = self.slot(session_id);
        {
            let mut holder = slot.lock();
            if let Some(current) = *holder {
                return Err(Self::busy(session_id, operation, &current.to_string()));
            }
            *holder = Some(operation);
        }
        trace!("Acquired {} lock on session {}", operation, session_id);
        Ok(slot)
    }

    fn busy(session_id: &str, operation: OperationKind, holder: &str) -> RewindError {
        RewindError::ConcurrencyConflict {
            session_id: session_id.to_string(),
            requested: operation.to_string(),
            holder: holder.to_string(),
        }
    }

    /// Take the session lock for a capture or restore
    ///
    /// # Errors
    ///
    /// [`RewindError::ConcurrencyConflict`] if the session is busy or a GC
    /// is running
    pub fn acquire(&self, session_id: &str, operation: OperationKind) -> Result<SessionGuard<'_>> {
        let gate = self
            .gc_gate
            .try_read()
            .ok_or_else(|| Self::busy(session_id, operation, "gc"))?;
        let slot = self.claim(session_id, operation)?;
        Ok(SessionGuard {
            session_id: session_id.to_string(),
            slot,
            _gate: gate,
        })
    }

    /// Take the store-wide GC lock and mark every listed session busy
    ///
    /// # Errors
    ///
    /// [`RewindError::ConcurrencyConflict`] if any capture, restore or GC
    /// is in flight
    pub fn acquire_gc<'a>(&'a self, sessions: &[String]) -> Result<GcGuard<'a>> {
        let gate = self
            .gc_gate
            .try_write()
            .ok_or_else(|| Self::busy("*", OperationKind::Gc, "another operation"))?;

        let mut guard = GcGuard {
            slots: Vec::with_capacity(sessions.len()),
            _gate: gate,
        };
        for session_id in sessions {
            // On error, dropping `guard` releases the claims made so far
            let slot = self.claim(session_id, OperationKind::Gc)?;
            guard.slots.push((session_id.clone(), slot));
        }
        Ok(guard)
    }

    /// Operation currently holding `session_id`, if any
    pub fn holder(&self, session_id: &str) -> Option<OperationKind> {
        self.slots.get(session_id).and_then(|slot| *slot.lock())
    }
}

fn release(slot: &Slot) {
    *slot.lock() = None;
}

/// Held for the duration of a capture or restore
pub struct SessionGuard<'a> {
    session_id: String,
    slot: Slot,
    _gate: RwLockReadGuard<'a, ()>,
}

impl SessionGuard<'_> {
    /// Session this guard protects
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        release(&self.slot);
        trace!("Released lock on session {}", self.session_id);
    }
}

/// Held for the duration of a GC
pub struct GcGuard<'a> {
    slots: Vec<(String, Slot)>,
    _gate: RwLockWriteGuard<'a, ()>,
}

impl Drop for GcGuard<'_> {
    fn drop(&mut self) {
        for (_, slot) in &self.slots {
            release(slot);
        }
    }
}
