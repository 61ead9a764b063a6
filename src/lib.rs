//! # Rewind - checkpoints and time travel for working directories
//!
//! A checkpoint engine for interactive coding sessions: snapshot a working
//! directory whenever something meaningful happens, browse and diff the
//! history, and restore any earlier state without losing the latest one.
//!
//! ## Overview
//!
//! Rewind behaves like a small version-control system scoped to sessions:
//! - Content-addressed storage deduplicates identical files across every
//!   checkpoint and every session
//! - Each checkpoint points at one tree manifest and at most one parent, so a
//!   session's history is a tree that branches whenever you restore and then
//!   continue working
//! - Every restore first records the live state as a pre-restore checkpoint,
//!   so a restore never silently discards edits
//! - Restores stage all writes before touching the working directory and
//!   report exactly which paths were not applied if something fails
//!
//! ## Architecture
//!
//! Components, leaf first:
//!
//! - [`store`]: blobs and tree manifests keyed by SHA-256, write-if-absent
//! - [`tree`]: captures a directory as an ordered manifest
//! - [`index`]: append-only checkpoint records, per-session logs and current
//!   pointers, with [`timeline`] arenas for navigation
//! - [`diff`]: file-level deltas and lazy line-level diffs
//! - [`restore`]: the restore state machine
//! - [`engine`]: the [`Rewind`] facade with locking, workers and events
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rewind::Rewind;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Rewind::builder().build("./.rewind")?;
//! engine.register_session("session-1", "./my_project")?;
//!
//! let first = engine.checkpoint("session-1", "Initial state")?;
//!
//! // Make some changes to your files...
//! let second = engine.checkpoint("session-1", "Added new feature")?;
//!
//! for delta in engine.diff(&first.id, &second.id)?.iter() {
//!     println!("{} {}", delta.change.label(), delta.path);
//! }
//!
//! // Go back; the next checkpoint branches from `first`
//! engine.restore("session-1", &first.id)?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Background Operations
//!
//! ```rust,no_run
//! # use rewind::Rewind;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let engine = Rewind::open("./.rewind")?;
//! let handle = engine.spawn_checkpoint("session-1", "end of turn 12");
//! // ... later, or from another thread
//! handle.cancel();
//! match handle.wait() {
//!     Ok(checkpoint) => println!("created {}", checkpoint.short_id()),
//!     Err(e) if e.is_recoverable() => println!("try again: {}", e),
//!     Err(e) => return Err(e.into()),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Events
//!
//! ```rust,no_run
//! # use rewind::{EngineEvent, Rewind};
//! # async fn run(engine: Rewind) {
//! let mut events = engine.subscribe();
//! while let Ok(event) = events.recv().await {
//!     if let EngineEvent::RestoreCompleted { target_checkpoint_id, .. } = event {
//!         println!("restored to {}", target_checkpoint_id);
//!     }
//! }
//! # }
//! ```
//!
//! ## Concurrency
//!
//! Capture, restore and GC of one session are mutually exclusive; a second
//! attempt fails fast with [`RewindError::ConcurrencyConflict`]. Different
//! sessions run in parallel and reads never lock. GC only runs when asked.
//!
//! ## Error Handling
//!
//! All operations return [`Result<T>`](error::Result) with a [`RewindError`]
//! that carries the path, operation or id involved. See [`error`] for the
//! taxonomy.

pub mod checkpoint;
pub mod compression;
pub mod diff;
pub mod engine;
pub mod error;
pub mod events;
pub mod index;
pub mod path_cache;
pub mod restore;
pub mod session;
pub mod store;
pub mod timeline;
pub mod tree;
pub mod types;
pub mod verification;
pub mod worker;

mod collections;
mod utils;

pub use checkpoint::{Checkpoint, CheckpointKind, CheckpointMetadata};
pub use compression::CompressionStrategy;
pub use diff::{diff_trees, Change, Delta, DeltaSet, LineDetail};
pub use engine::{Rewind, RewindBuilder};
pub use error::{Result, RewindError};
pub use events::EngineEvent;
pub use path_cache::{Clock, ManualClock, PathCacheConfig, SystemClock};
pub use restore::{ApplyObserver, RestoreOptions, RestorePhase, RestoreReport};
pub use store::{BlobHash, ContentStore, TreeHash};
pub use timeline::{Timeline, TimelineNode, TimelineStats};
pub use tree::{IgnorePredicate, TreeBuilder, TreeEntry, TreeManifest};
pub use types::*;
pub use utils::format_bytes;
pub use verification::{RepairReport, SessionVerificationReport, VerificationReport};
pub use worker::{CancelToken, OperationHandle};
