//! Event types for the HeartSync event system
//!
//! Session workers emit [`SessionEvent`]s on an [`EventBus`]; the HTTP layer
//! forwards them to operators over SSE.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Session lifecycle and progress events
///
/// Session identifiers are the process-local integers handed out by the
/// session registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum SessionEvent {
    /// Decision worker started for a new session
    SessionStarted {
        session_id: u64,
        /// Directory receiving this session's logs and artifacts
        log_dir: String,
        /// Checkpoint the agent was resumed from (None = fresh agent)
        resumed_from: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A song (or the start signal) was pushed to the session's outbound channel
    SongOffered {
        session_id: u64,
        /// Outbound payload exactly as served to the browser
        payload: String,
        timestamp: DateTime<Utc>,
    },

    /// One decision step finished
    StepCompleted {
        session_id: u64,
        /// Step number within the session (1-based)
        step: u64,
        /// "accept" or "reject"
        action: String,
        reward: f64,
        heart_bpm: u32,
        song_bpm: u32,
        terminated: bool,
        truncated: bool,
        timestamp: DateTime<Utc>,
    },

    /// An episode reached termination or truncation
    EpisodeFinished {
        session_id: u64,
        /// Episode number within the session (1-based)
        episode: u64,
        total_reward: f64,
        steps: u64,
        truncated: bool,
        timestamp: DateTime<Utc>,
    },

    /// Decision worker exited and its artifacts were persisted
    SessionEnded {
        session_id: u64,
        /// True when the operator stopped the session
        cancelled: bool,
        total_steps: u64,
        /// Final checkpoint pushed on the reuse pool
        checkpoint: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Decision worker failed; whatever could be persisted was persisted
    SessionFailed {
        session_id: u64,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl SessionEvent {
    /// Event type name, used as the SSE event name
    pub fn event_type(&self) -> &'static str {
        match self {
            SessionEvent::SessionStarted { .. } => "SessionStarted",
            SessionEvent::SongOffered { .. } => "SongOffered",
            SessionEvent::StepCompleted { .. } => "StepCompleted",
            SessionEvent::EpisodeFinished { .. } => "EpisodeFinished",
            SessionEvent::SessionEnded { .. } => "SessionEnded",
            SessionEvent::SessionFailed { .. } => "SessionFailed",
        }
    }

    /// Session the event belongs to
    pub fn session_id(&self) -> u64 {
        match self {
            SessionEvent::SessionStarted { session_id, .. }
            | SessionEvent::SongOffered { session_id, .. }
            | SessionEvent::StepCompleted { session_id, .. }
            | SessionEvent::EpisodeFinished { session_id, .. }
            | SessionEvent::SessionEnded { session_id, .. }
            | SessionEvent::SessionFailed { session_id, .. } => *session_id,
        }
    }
}

/// Broadcast bus for [`SessionEvent`]s
///
/// Cloning is cheap; all clones share one channel.
///
/// # Examples
///
/// ```
/// use heartsync_common::events::{EventBus, SessionEvent};
///
/// let bus = EventBus::new(100);
/// let mut rx = bus.subscribe();
///
/// bus.emit_lossy(SessionEvent::SessionFailed {
///     session_id: 3,
///     error: "disk full".to_string(),
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert_eq!(rx.try_recv().unwrap().session_id(), 3);
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// Slow subscribers lose the oldest events once `capacity` is exceeded.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: SessionEvent,
    ) -> Result<usize, broadcast::error::SendError<SessionEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
