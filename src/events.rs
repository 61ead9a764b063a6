//! Fire-and-forget engine notifications
//!
//! Consumers (UI panels, loggers) subscribe to an [`EventBus`] and receive
//! every event published after they subscribed. Publishing never blocks and
//! never fails: with no subscribers the event is dropped, and a subscriber
//! that falls more than the channel capacity behind sees
//! `RecvError::Lagged` and skips ahead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Something observable happened to a session's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A checkpoint record was persisted
    CheckpointCreated {
        /// Owning session
        session_id: String,
        /// New checkpoint
        checkpoint_id: String,
        /// Its parent, if any
        parent_id: Option<String>,
        /// Message given at creation
        message: String,
        /// Persist time
        at: DateTime<Utc>,
    },
    /// A restore committed and the current pointer moved
    RestoreCompleted {
        /// Owning session
        session_id: String,
        /// Checkpoint that is now current
        target_checkpoint_id: String,
        /// Snapshot taken before applying
        pre_restore_checkpoint_id: String,
        /// Paths written or removed
        files_changed: usize,
        /// Commit time
        at: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// Session the event belongs to
    pub fn session_id(&self) -> &str {
        match self {
            EngineEvent::CheckpointCreated { session_id, .. }
            | EngineEvent::RestoreCompleted { session_id, .. } => session_id,
        }
    }
}

/// Broadcast channel for [`EngineEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish without waiting for or requiring subscribers
    pub fn publish(&self, event: EngineEvent) {
        // Err only means nobody is listening
        if let Ok(receivers) = self.sender.send(event) {
            trace!("Published event to {} subscriber(s)", receivers);
        }
    }

    /// New subscription starting at the next published event
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Current number of subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
