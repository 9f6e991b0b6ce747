//! Episode state machine and its experience log

pub mod experience;
pub mod machine;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::catalog::{SongFeatures, SongId};

pub use experience::{
    read_experience_log, ExperienceEntry, ExperienceHeader, ExperienceLog, EXPERIENCE_LOG_FILE,
};
pub use machine::{EpisodeStateMachine, StepOutcome};

/// Reward added on natural termination, before subtracting the distance to goal
pub const TERMINATION_BONUS: f64 = 100.0;

/// Fixed reward on truncation
pub const TRUNCATION_PENALTY: f64 = -1000.0;

/// The two choices offered per step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Play the offered song
    Accept,
    /// Skip to another song
    Reject,
}

impl Action {
    pub const ALL: [Action; 2] = [Action::Accept, Action::Reject];

    /// Index used in the experience log (accept = 0, reject = 1)
    pub fn index(self) -> u8 {
        match self {
            Action::Accept => 0,
            Action::Reject => 1,
        }
    }

    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Action::Accept),
            1 => Some(Action::Reject),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Accept => f.write_str("accept"),
            Action::Reject => f.write_str("reject"),
        }
    }
}

/// Observation handed to the decision agent
#[derive(Debug, Clone)]
pub struct EpisodeState {
    /// Latest heart-rate reading, truncated to whole BPM
    pub heart_bpm: u32,
    /// Song currently on offer
    pub song: SongId,
    /// Features of the song on offer
    pub features: Arc<SongFeatures>,
}

impl EpisodeState {
    pub fn song_bpm(&self) -> u32 {
        self.features.bpm
    }
}

/// Absolute difference between two BPM values
pub fn distance(a: u32, b: u32) -> f64 {
    (a as f64 - b as f64).abs()
}
