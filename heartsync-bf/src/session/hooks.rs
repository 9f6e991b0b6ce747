//! Hooks run by the session worker after every step

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::agent::DecisionAgent;
use crate::checkpoint::{save_checkpoint, CheckpointHandle};
use crate::error::Result;

/// Episodes averaged by [`BestRewardCheckpointHook`]
pub const REWARD_WINDOW: usize = 100;

/// Whether the worker keeps going after a hook ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookControl {
    Continue,
    Stop,
}

/// Training progress visible to hooks
#[derive(Debug, Clone, Copy)]
pub struct TrainingProgress<'a> {
    /// Steps taken by this worker so far, across episodes
    pub total_steps: u64,
    /// Total reward of every completed episode, oldest first
    pub episode_rewards: &'a [f64],
}

pub trait TrainingHook: Send {
    fn on_step(
        &mut self,
        progress: &TrainingProgress<'_>,
        agent: &dyn DecisionAgent,
    ) -> Result<HookControl>;
}

/// Stops the worker once the session's token fires
pub struct CancellationHook {
    token: CancellationToken,
}

impl CancellationHook {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }
}

impl TrainingHook for CancellationHook {
    fn on_step(&mut self, progress: &TrainingProgress<'_>, _: &dyn DecisionAgent) -> Result<HookControl> {
        if self.token.is_cancelled() {
            info!(steps = progress.total_steps, "Stop requested, finishing session");
            return Ok(HookControl::Stop);
        }
        Ok(HookControl::Continue)
    }
}

/// Stops the worker after a fixed number of steps
pub struct StepBudgetHook {
    limit: u64,
}

impl StepBudgetHook {
    pub fn new(limit: u64) -> Self {
        Self { limit }
    }
}

impl TrainingHook for StepBudgetHook {
    fn on_step(&mut self, progress: &TrainingProgress<'_>, _: &dyn DecisionAgent) -> Result<HookControl> {
        if progress.total_steps >= self.limit {
            info!(limit = self.limit, "Step budget reached");
            return Ok(HookControl::Stop);
        }
        Ok(HookControl::Continue)
    }
}

/// Saves the agent whenever the recent mean episode reward improves
///
/// Evaluated every `every_steps` steps over the last [`REWARD_WINDOW`]
/// completed episodes.
pub struct BestRewardCheckpointHook {
    every_steps: u64,
    path: PathBuf,
    best_mean: Option<f64>,
    saved: Option<CheckpointHandle>,
}

impl BestRewardCheckpointHook {
    pub fn new(every_steps: u64, path: PathBuf) -> Self {
        Self {
            every_steps: every_steps.max(1),
            path,
            best_mean: None,
            saved: None,
        }
    }

    pub fn best_mean(&self) -> Option<f64> {
        self.best_mean
    }

    /// Last artifact written by this hook
    pub fn saved(&self) -> Option<&CheckpointHandle> {
        self.saved.as_ref()
    }
}

fn recent_mean(rewards: &[f64]) -> Option<f64> {
    if rewards.is_empty() {
        return None;
    }
    let recent = &rewards[rewards.len().saturating_sub(REWARD_WINDOW)..];
    Some(recent.iter().sum::<f64>() / recent.len() as f64)
}

impl TrainingHook for BestRewardCheckpointHook {
    fn on_step(
        &mut self,
        progress: &TrainingProgress<'_>,
        agent: &dyn DecisionAgent,
    ) -> Result<HookControl> {
        if progress.total_steps % self.every_steps != 0 {
            return Ok(HookControl::Continue);
        }
        let Some(mean) = recent_mean(progress.episode_rewards) else {
            return Ok(HookControl::Continue);
        };

        debug!(
            steps = progress.total_steps,
            mean_reward = mean,
            best = ?self.best_mean,
            "Evaluating mean episode reward"
        );
        if self.best_mean.map_or(true, |best| mean > best) {
            self.saved = Some(save_checkpoint(agent, &self.path)?);
            self.best_mean = Some(mean);
            info!(mean_reward = mean, "New best mean reward");
        }
        Ok(HookControl::Continue)
    }
}
