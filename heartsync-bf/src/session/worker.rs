//! Session decision worker
//!
//! Runs episodes back to back until the session is stopped or its step
//! budget is used up:
//!
//! 1. Resume an agent from the checkpoint pool (or start a fresh one)
//! 2. `reset`, then `act` / `step` / `observe` until the episode finishes
//! 3. After every step, run the hooks (cancellation, step budget, best-reward
//!    checkpoint); any hook may end the session at that step boundary
//! 4. On exit: close the episode (sends `end`, writes the experience log),
//!    save `last_model.ckpt` and push it on the pool

use std::path::PathBuf;
use std::sync::Arc;

use heartsync_common::events::{EventBus, SessionEvent};
use heartsync_common::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::hooks::{
    BestRewardCheckpointHook, CancellationHook, HookControl, StepBudgetHook, TrainingHook,
    TrainingProgress,
};
use super::SessionId;
use crate::agent::{AgentFactory, DecisionAgent};
use crate::checkpoint::{save_checkpoint, CheckpointHandle, CheckpointPool, BEST_MODEL_FILE, LAST_MODEL_FILE};
use crate::config::TrainingConfig;
use crate::episode::EpisodeStateMachine;
use crate::error::Result;

/// Everything a worker needs besides its episode
pub struct WorkerContext {
    pub session_id: SessionId,
    /// Directory receiving the experience log and artifacts
    pub session_dir: PathBuf,
    pub training: TrainingConfig,
    pub agents: Arc<dyn AgentFactory>,
    pub checkpoints: Arc<CheckpointPool>,
    pub events: EventBus,
    pub cancel: CancellationToken,
}

/// What a finished worker did
#[derive(Debug, Clone)]
pub struct WorkerSummary {
    pub session_id: SessionId,
    pub total_steps: u64,
    pub episodes: u64,
    pub cancelled: bool,
    /// Final artifact, already pushed on the pool
    pub checkpoint: Option<CheckpointHandle>,
}

pub struct SessionWorker {
    ctx: WorkerContext,
    env: EpisodeStateMachine,
    total_steps: u64,
    episode_rewards: Vec<f64>,
}

impl SessionWorker {
    pub fn new(ctx: WorkerContext, env: EpisodeStateMachine) -> Self {
        Self {
            ctx,
            env,
            total_steps: 0,
            episode_rewards: Vec::new(),
        }
    }

    /// Run until stopped; artifacts are persisted on every exit path
    pub async fn run(mut self) -> Result<WorkerSummary> {
        let session_id = self.ctx.session_id;
        let (mut agent, resumed_from) = self.load_agent();

        self.ctx.events.emit_lossy(SessionEvent::SessionStarted {
            session_id,
            log_dir: self.ctx.session_dir.display().to_string(),
            resumed_from: resumed_from.as_ref().map(ToString::to_string),
            timestamp: time::now(),
        });
        info!(
            session_id,
            log_dir = %self.ctx.session_dir.display(),
            resumed_from = ?resumed_from.as_ref().map(ToString::to_string),
            "Session worker started"
        );

        let trained = self.train(agent.as_mut()).await;
        let closed = self.env.close();
        let checkpoint = self.persist_agent(agent.as_ref());
        let cancelled = self.ctx.cancel.is_cancelled();

        match trained.and(closed) {
            Ok(()) => {
                self.ctx.events.emit_lossy(SessionEvent::SessionEnded {
                    session_id,
                    cancelled,
                    total_steps: self.total_steps,
                    checkpoint: checkpoint.as_ref().map(ToString::to_string),
                    timestamp: time::now(),
                });
                info!(
                    session_id,
                    steps = self.total_steps,
                    episodes = self.episode_rewards.len(),
                    cancelled,
                    "Session worker finished"
                );
                Ok(WorkerSummary {
                    session_id,
                    total_steps: self.total_steps,
                    episodes: self.episode_rewards.len() as u64,
                    cancelled,
                    checkpoint,
                })
            }
            Err(e) => {
                error!(session_id, error = %e, steps = self.total_steps, "Session worker failed");
                self.ctx.events.emit_lossy(SessionEvent::SessionFailed {
                    session_id,
                    error: e.to_string(),
                    timestamp: time::now(),
                });
                Err(e)
            }
        }
    }

    /// Pop the newest pooled artifact; fall back to a fresh agent if it cannot be loaded
    fn load_agent(&self) -> (Box<dyn DecisionAgent>, Option<CheckpointHandle>) {
        match self.ctx.checkpoints.pop() {
            Some(handle) => match self.ctx.agents.load(&handle) {
                Ok(agent) => {
                    info!(session_id = self.ctx.session_id, checkpoint = %handle, "Resuming agent");
                    (agent, Some(handle))
                }
                Err(e) => {
                    warn!(
                        session_id = self.ctx.session_id,
                        checkpoint = %handle,
                        error = %e,
                        "Pooled checkpoint unusable, starting fresh agent"
                    );
                    (self.ctx.agents.fresh(), None)
                }
            },
            None => (self.ctx.agents.fresh(), None),
        }
    }

    fn hooks(&self) -> Vec<Box<dyn TrainingHook>> {
        let mut hooks: Vec<Box<dyn TrainingHook>> =
            vec![Box::new(CancellationHook::new(self.ctx.cancel.clone()))];
        if let Some(limit) = self.ctx.training.total_timesteps {
            hooks.push(Box::new(StepBudgetHook::new(limit)));
        }
        hooks.push(Box::new(BestRewardCheckpointHook::new(
            self.ctx.training.checkpoint_every_steps,
            self.ctx.session_dir.join(BEST_MODEL_FILE),
        )));
        hooks
    }

    async fn train(&mut self, agent: &mut dyn DecisionAgent) -> Result<()> {
        let session_id = self.ctx.session_id;
        let mut hooks = self.hooks();

        loop {
            if self.ctx.cancel.is_cancelled() {
                return Ok(());
            }

            // Reset may wait indefinitely for the estimator; a stop request ends that wait
            let mut state = tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => return Ok(()),
                state = self.env.reset() => state?,
            };

            let mut episode_reward = 0.0;
            let mut episode_steps: u64 = 0;

            loop {
                let action = agent.act(&state);
                let outcome = self.env.step(action).await?;
                let done = outcome.terminated || outcome.truncated;

                self.total_steps += 1;
                episode_steps += 1;
                episode_reward += outcome.reward;
                agent.observe(&state, action, outcome.reward, &outcome.state, done);

                self.ctx.events.emit_lossy(SessionEvent::StepCompleted {
                    session_id,
                    step: self.total_steps,
                    action: action.to_string(),
                    reward: outcome.reward,
                    heart_bpm: outcome.state.heart_bpm,
                    song_bpm: outcome.state.song_bpm(),
                    terminated: outcome.terminated,
                    truncated: outcome.truncated,
                    timestamp: time::now(),
                });

                if done {
                    self.episode_rewards.push(episode_reward);
                    self.ctx.events.emit_lossy(SessionEvent::EpisodeFinished {
                        session_id,
                        episode: self.episode_rewards.len() as u64,
                        total_reward: episode_reward,
                        steps: episode_steps,
                        truncated: outcome.truncated,
                        timestamp: time::now(),
                    });
                }

                let progress = TrainingProgress {
                    total_steps: self.total_steps,
                    episode_rewards: &self.episode_rewards,
                };
                let mut stop = false;
                for hook in hooks.iter_mut() {
                    match hook.on_step(&progress, &*agent) {
                        Ok(HookControl::Stop) => stop = true,
                        Ok(HookControl::Continue) => {}
                        Err(e) => warn!(session_id, error = %e, "Training hook failed"),
                    }
                }
                if stop {
                    return Ok(());
                }
                if done {
                    break;
                }
                state = outcome.state;
            }
        }
    }

    /// Save `last_model.ckpt` and offer it to the next session
    fn persist_agent(&self, agent: &dyn DecisionAgent) -> Option<CheckpointHandle> {
        match save_checkpoint(agent, &self.ctx.session_dir.join(LAST_MODEL_FILE)) {
            Ok(handle) => {
                self.ctx.checkpoints.push(handle.clone());
                Some(handle)
            }
            Err(e) => {
                error!(session_id = self.ctx.session_id, error = %e, "Final checkpoint not saved");
                None
            }
        }
    }
}
