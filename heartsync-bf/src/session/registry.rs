//! Session registry: id allocation and per-session channels
//!
//! `create_session` wires up one session:
//!
//! ```text
//! POST /image ──frames──▶ estimator task ──HeartRateReading──▶ worker ──actions──▶ GET /action
//! ```
//!
//! The registry entry lives until the consumer has taken the final `end`
//! action, so the sentinel is always deliverable even after the worker exits.
//! Sessions nobody talks to for `session.idle_timeout_seconds` are cancelled
//! and dropped from the table once their worker has persisted its artifacts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use heartsync_common::events::EventBus;
use heartsync_common::time::directory_stamp;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::worker::{SessionWorker, WorkerContext};
use super::{session_dir_name, OutboundAction, SessionId};
use crate::agent::{AgentFactory, TabularAgentFactory};
use crate::catalog::features::FeatureParams;
use crate::catalog::{AudioFeatureExtractor, FeatureExtractor, SongCatalog, SongFeatureCache};
use crate::checkpoint::CheckpointPool;
use crate::config::ServiceConfig;
use crate::episode::{EpisodeStateMachine, ExperienceHeader, EXPERIENCE_LOG_FILE};
use crate::error::{Error, Result};
use crate::estimator::{spawn_estimator, Frame, HeartRateEstimator, HeartRateReading};

/// Channels of one registered session
struct SessionHandle {
    /// Dropped once the worker has exited, which stops the estimator
    frames: Option<UnboundedSender<Frame>>,
    actions: Arc<Mutex<UnboundedReceiver<OutboundAction>>>,
    activity: Arc<SessionActivity>,
    cancel: CancellationToken,
}

/// Consumer traffic seen for one session
#[derive(Debug)]
struct SessionActivity {
    last_seen: std::sync::Mutex<Instant>,
    pending_dequeues: AtomicUsize,
    /// Set when the idle watchdog cancelled the session
    reclaimed: AtomicBool,
}

impl SessionActivity {
    fn new() -> Self {
        Self {
            last_seen: std::sync::Mutex::new(Instant::now()),
            pending_dequeues: AtomicUsize::new(0),
            reclaimed: AtomicBool::new(false),
        }
    }

    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    /// Time since the last request; `None` while a consumer is waiting on `/action`
    fn idle_for(&self) -> Option<Duration> {
        if self.pending_dequeues.load(Ordering::SeqCst) > 0 {
            return None;
        }
        let last_seen = *self.last_seen.lock().unwrap_or_else(|p| p.into_inner());
        Some(last_seen.elapsed())
    }

    fn begin_dequeue(&self) -> PendingDequeue<'_> {
        self.pending_dequeues.fetch_add(1, Ordering::SeqCst);
        self.touch();
        PendingDequeue(self)
    }
}

/// Marks a consumer as waiting until dropped, including when the request is abandoned
struct PendingDequeue<'a>(&'a SessionActivity);

impl Drop for PendingDequeue<'_> {
    fn drop(&mut self) {
        self.0.touch();
        self.0.pending_dequeues.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Cancel the session once it has been idle for `timeout`
fn spawn_idle_watchdog(
    session_id: SessionId,
    activity: Arc<SessionActivity>,
    timeout: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = (timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            match activity.idle_for() {
                Some(idle) if idle >= timeout => {
                    warn!(
                        session_id,
                        idle_secs = idle.as_secs_f64(),
                        "No consumer traffic, cancelling session"
                    );
                    activity.reclaimed.store(true, Ordering::SeqCst);
                    cancel.cancel();
                    return;
                }
                _ => {}
            }
        }
    })
}

/// Process-wide session coordinator
pub struct SessionRegistry {
    config: ServiceConfig,
    song_directory: PathBuf,
    logs_directory: PathBuf,
    features: Arc<SongFeatureCache>,
    agents: Arc<dyn AgentFactory>,
    checkpoints: Arc<CheckpointPool>,
    events: EventBus,
    next_id: AtomicU64,
    sessions: Arc<RwLock<HashMap<SessionId, SessionHandle>>>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl SessionRegistry {
    /// Registry with the audio feature extractor and the tabular agent
    pub fn new(
        config: ServiceConfig,
        root_folder: &Path,
        checkpoints: Arc<CheckpointPool>,
        events: EventBus,
    ) -> Self {
        let song_directory = config.song_directory(root_folder);
        let extractor = AudioFeatureExtractor::new(
            song_directory.clone(),
            FeatureParams::from_config(&config.episode, &config.catalog),
        );

        Self {
            agents: Arc::new(TabularAgentFactory::new(config.training.clone())),
            features: Arc::new(SongFeatureCache::new(Arc::new(extractor))),
            logs_directory: ServiceConfig::logs_directory(root_folder),
            song_directory,
            config,
            checkpoints,
            events,
            next_id: AtomicU64::new(0),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            workers: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn with_feature_extractor(mut self, extractor: Arc<dyn FeatureExtractor>) -> Self {
        self.features = Arc::new(SongFeatureCache::new(extractor));
        self
    }

    pub fn with_agent_factory(mut self, agents: Arc<dyn AgentFactory>) -> Self {
        self.agents = agents;
        self
    }

    pub fn logs_directory(&self) -> &Path {
        &self.logs_directory
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointPool> {
        &self.checkpoints
    }

    /// Register a session and start its estimator and worker
    ///
    /// Fails with `EmptyCatalog` before an id is allocated when there are no songs.
    pub async fn create_session(&self) -> Result<SessionId> {
        let catalog = SongCatalog::load(&self.song_directory, self.config.catalog.repeat_shuffle)?;
        let reading = HeartRateReading::new();
        let estimator = HeartRateEstimator::new(self.config.estimator.clone(), reading.clone())?;

        let session_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session_dir = self
            .logs_directory
            .join(session_dir_name(&directory_stamp(Local::now()), session_id));
        tokio::fs::create_dir_all(&session_dir).await?;

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (action_tx, action_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let estimator_cancel = cancel.child_token();

        let song_prefix = self
            .song_directory
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "songs".to_string());
        let env = EpisodeStateMachine::new(
            session_id,
            self.config.episode.clone(),
            ExperienceHeader::from_config(&self.config.episode, &self.config.catalog),
            catalog,
            Arc::clone(&self.features),
            reading,
            action_tx,
        )
        .with_song_prefix(song_prefix)
        .with_log_path(session_dir.join(EXPERIENCE_LOG_FILE))
        .with_events(self.events.clone());

        let worker = SessionWorker::new(
            WorkerContext {
                session_id,
                session_dir: session_dir.clone(),
                training: self.config.training.clone(),
                agents: Arc::clone(&self.agents),
                checkpoints: Arc::clone(&self.checkpoints),
                events: self.events.clone(),
                cancel: cancel.clone(),
            },
            env,
        );

        let activity = Arc::new(SessionActivity::new());
        if let Some(timeout) = self.config.session.idle_timeout() {
            spawn_idle_watchdog(session_id, Arc::clone(&activity), timeout, cancel.clone());
        }

        self.sessions.write().await.insert(
            session_id,
            SessionHandle {
                frames: Some(frame_tx),
                actions: Arc::new(Mutex::new(action_rx)),
                activity: Arc::clone(&activity),
                cancel,
            },
        );

        spawn_estimator(session_id, estimator, frame_rx, estimator_cancel.clone());

        let sessions = Arc::clone(&self.sessions);
        let handle = tokio::spawn(async move {
            if let Err(e) = worker.run().await {
                // Already reported as SessionFailed by the worker
                debug!(session_id, error = %e, "Session worker exited with error");
            }
            estimator_cancel.cancel();

            let mut sessions = sessions.write().await;
            if activity.reclaimed.load(Ordering::SeqCst) {
                // Nobody is left to take the final `end`
                if sessions.remove(&session_id).is_some() {
                    info!(session_id, "Idle session reclaimed");
                }
            } else if let Some(entry) = sessions.get_mut(&session_id) {
                entry.frames = None;
            }
        });

        {
            let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
            workers.retain(|w| !w.is_finished());
            workers.push(handle);
        }

        info!(session_id, log_dir = %session_dir.display(), "Session created");
        Ok(session_id)
    }

    /// Hand a frame to the session's estimator
    ///
    /// Frames for a session whose worker already exited are dropped.
    pub async fn enqueue_frame(&self, session_id: SessionId, frame: Frame) -> Result<()> {
        let sessions = self.sessions.read().await;
        let entry = sessions
            .get(&session_id)
            .ok_or(Error::UnknownSession(session_id))?;
        entry.activity.touch();

        match &entry.frames {
            Some(frames) if frames.send(frame).is_ok() => {}
            _ => debug!(session_id, "Session finishing, frame dropped"),
        }
        Ok(())
    }

    /// Wait for the session's next outbound action
    ///
    /// Taking `end` unregisters the session. A channel that closed without
    /// `end` is reported as `end` once.
    pub async fn dequeue_action(&self, session_id: SessionId) -> Result<OutboundAction> {
        let (actions, activity) = {
            let sessions = self.sessions.read().await;
            let entry = sessions
                .get(&session_id)
                .ok_or(Error::UnknownSession(session_id))?;
            (Arc::clone(&entry.actions), Arc::clone(&entry.activity))
        };

        let next = {
            let _pending = activity.begin_dequeue();
            actions.lock().await.recv().await
        };
        match next {
            Some(action) => {
                if action.is_end() {
                    self.unregister(session_id).await;
                }
                Ok(action)
            }
            None => {
                warn!(session_id, "Action channel closed without end");
                self.unregister(session_id).await;
                Ok(OutboundAction::End)
            }
        }
    }

    /// Ask the session's worker to stop at its next step boundary
    ///
    /// Stopping a session that already finished is a no-op.
    pub async fn cancel_session(&self, session_id: SessionId) -> Result<()> {
        match self.sessions.read().await.get(&session_id) {
            Some(entry) => {
                if !entry.cancel.is_cancelled() {
                    info!(session_id, "Stop requested");
                }
                entry.cancel.cancel();
                Ok(())
            }
            None if session_id < self.next_id.load(Ordering::SeqCst) => {
                debug!(session_id, "Stop for finished session ignored");
                Ok(())
            }
            None => Err(Error::UnknownSession(session_id)),
        }
    }

    /// Registered sessions, including ones whose `end` is still pending
    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Stop every session and wait until their artifacts are persisted
    pub async fn shutdown(&self) {
        for entry in self.sessions.read().await.values() {
            entry.cancel.cancel();
        }

        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().unwrap_or_else(|p| p.into_inner());
            guard.drain(..).collect()
        };
        info!(workers = workers.len(), "Waiting for session workers");
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Session worker task aborted");
            }
        }
    }

    async fn unregister(&self, session_id: SessionId) {
        if self.sessions.write().await.remove(&session_id).is_some() {
            info!(session_id, "Session unregistered");
        }
    }
}
