//! Decision agents
//!
//! [`DecisionAgent`] is the seam for the optimizer that picks accept/reject.
//! The service ships [`TabularAgent`], an epsilon-greedy Q-learning agent
//! keyed on bucketed (heart BPM, song BPM); its checkpoint artifact is the
//! JSON-serialized table.

use std::collections::HashMap;
use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::checkpoint::CheckpointHandle;
use crate::config::TrainingConfig;
use crate::episode::{Action, EpisodeState};
use crate::error::{Error, Result};

/// Picks actions and learns from transitions
pub trait DecisionAgent: Send {
    /// Choose the next action for `state`
    fn act(&mut self, state: &EpisodeState) -> Action;

    /// Learn from one transition; `done` marks the end of an episode
    fn observe(
        &mut self,
        state: &EpisodeState,
        action: Action,
        reward: f64,
        next_state: &EpisodeState,
        done: bool,
    );

    /// Persist trained state to `path`
    fn save(&self, path: &Path) -> Result<()>;
}

/// Creates agents, fresh or resumed from a checkpoint
pub trait AgentFactory: Send + Sync {
    fn fresh(&self) -> Box<dyn DecisionAgent>;

    fn load(&self, checkpoint: &CheckpointHandle) -> Result<Box<dyn DecisionAgent>>;
}

/// Table key: (heart BPM bucket, song BPM bucket)
type StateKey = (u32, u32);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QEntry {
    heart_bucket: u32,
    song_bucket: u32,
    /// Indexed by [`Action::index`]
    values: [f64; 2],
}

/// On-disk layout of a tabular checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QTableFile {
    bucket_bpm: u32,
    epsilon: f64,
    learning_rate: f64,
    discount: f64,
    updates: u64,
    entries: Vec<QEntry>,
}

/// Epsilon-greedy tabular Q-learning
pub struct TabularAgent {
    bucket_bpm: u32,
    epsilon: f64,
    learning_rate: f64,
    discount: f64,
    table: HashMap<StateKey, [f64; 2]>,
    updates: u64,
    rng: StdRng,
}

impl TabularAgent {
    pub fn new(config: &TrainingConfig) -> Self {
        Self {
            bucket_bpm: config.bucket_bpm.max(1),
            epsilon: config.epsilon,
            learning_rate: config.learning_rate,
            discount: config.discount,
            table: HashMap::new(),
            updates: 0,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Read a table written by [`DecisionAgent::save`]
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Checkpoint(format!("Cannot read {}: {}", path.display(), e)))?;
        let file: QTableFile = serde_json::from_str(&contents)
            .map_err(|e| Error::Checkpoint(format!("Malformed checkpoint {}: {}", path.display(), e)))?;

        Ok(Self {
            bucket_bpm: file.bucket_bpm.max(1),
            epsilon: file.epsilon,
            learning_rate: file.learning_rate,
            discount: file.discount,
            table: file
                .entries
                .into_iter()
                .map(|e| ((e.heart_bucket, e.song_bucket), e.values))
                .collect(),
            updates: file.updates,
            rng: StdRng::from_entropy(),
        })
    }

    fn key(&self, state: &EpisodeState) -> StateKey {
        (
            state.heart_bpm / self.bucket_bpm,
            state.song_bpm() / self.bucket_bpm,
        )
    }

    /// Q-values of a state (zeros for unseen states)
    pub fn q_values(&self, state: &EpisodeState) -> [f64; 2] {
        self.table.get(&self.key(state)).copied().unwrap_or([0.0; 2])
    }

    /// Highest-valued action; ties go to accept
    pub fn greedy_action(&self, state: &EpisodeState) -> Action {
        let q = self.q_values(state);
        if q[Action::Reject.index() as usize] > q[Action::Accept.index() as usize] {
            Action::Reject
        } else {
            Action::Accept
        }
    }

    pub fn states_seen(&self) -> usize {
        self.table.len()
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }
}

impl DecisionAgent for TabularAgent {
    fn act(&mut self, state: &EpisodeState) -> Action {
        if self.rng.gen::<f64>() < self.epsilon {
            *Action::ALL.choose(&mut self.rng).unwrap_or(&Action::Accept)
        } else {
            self.greedy_action(state)
        }
    }

    fn observe(
        &mut self,
        state: &EpisodeState,
        action: Action,
        reward: f64,
        next_state: &EpisodeState,
        done: bool,
    ) {
        let future = if done {
            0.0
        } else {
            let next = self.q_values(next_state);
            next[0].max(next[1])
        };

        let key = self.key(state);
        let alpha = self.learning_rate;
        let gamma = self.discount;
        let q = self.table.entry(key).or_insert([0.0; 2]);
        let slot = &mut q[action.index() as usize];
        *slot += alpha * (reward + gamma * future - *slot);
        self.updates += 1;
    }

    fn save(&self, path: &Path) -> Result<()> {
        let mut entries: Vec<QEntry> = self
            .table
            .iter()
            .map(|(&(heart_bucket, song_bucket), &values)| QEntry {
                heart_bucket,
                song_bucket,
                values,
            })
            .collect();
        entries.sort_by_key(|e| (e.heart_bucket, e.song_bucket));

        let file = QTableFile {
            bucket_bpm: self.bucket_bpm,
            epsilon: self.epsilon,
            learning_rate: self.learning_rate,
            discount: self.discount,
            updates: self.updates,
            entries,
        };
        std::fs::write(path, serde_json::to_string_pretty(&file)?)?;
        debug!(path = %path.display(), states = self.table.len(), "Q-table written");
        Ok(())
    }
}

/// Builds [`TabularAgent`]s from the training configuration
pub struct TabularAgentFactory {
    config: TrainingConfig,
}

impl TabularAgentFactory {
    pub fn new(config: TrainingConfig) -> Self {
        Self { config }
    }
}

impl AgentFactory for TabularAgentFactory {
    fn fresh(&self) -> Box<dyn DecisionAgent> {
        Box::new(TabularAgent::new(&self.config))
    }

    fn load(&self, checkpoint: &CheckpointHandle) -> Result<Box<dyn DecisionAgent>> {
        Ok(Box::new(TabularAgent::load(checkpoint.path())?))
    }
}
