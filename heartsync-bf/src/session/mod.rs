//! Per-session coordination
//!
//! A session owns two channels: frames flow in from the browser to the
//! heart-rate estimator, actions flow out from the decision worker to the
//! browser. The [`registry::SessionRegistry`] maps session ids to those
//! channels; the HTTP layer never touches a session's state directly.

pub mod hooks;
pub mod registry;
pub mod worker;

use std::fmt;

pub use registry::SessionRegistry;
pub use worker::{SessionWorker, WorkerContext, WorkerSummary};

/// Process-local session identifier, unique for the life of the process
pub type SessionId = u64;

/// Payload of the "start" signal
pub const START_PAYLOAD: &str = "start";

/// Payload of the "end" sentinel
pub const END_PAYLOAD: &str = "end";

/// One item on a session's outbound channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    /// Episode reset; the browser starts streaming frames
    Start,
    /// Play this song (path as served to the browser)
    Play(String),
    /// Session is over; nothing follows
    End,
}

impl OutboundAction {
    /// Wire payload returned by `GET /action`
    pub fn payload(&self) -> &str {
        match self {
            OutboundAction::Start => START_PAYLOAD,
            OutboundAction::Play(path) => path,
            OutboundAction::End => END_PAYLOAD,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, OutboundAction::End)
    }
}

impl fmt::Display for OutboundAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.payload())
    }
}

/// Name of a session's log directory: `log<YYYY-MM-DD-HH-MM-SS>-<id>`
///
/// The id is zero-padded so lexical order stays chronological for sessions
/// started within the same second.
pub fn session_dir_name(stamp: &str, session_id: SessionId) -> String {
    format!("log{}-{:06}", stamp, session_id)
}
