//! The per-session decision process
//!
//! Observation: current heart rate plus the song on offer (tempo and chroma).
//! Actions: accept (play it) or reject (draw another). Reward is the change
//! in distance from the goal heart rate; finishing the song budget earns
//! `100 - distance`, running out of steps costs a flat `-1000`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use heartsync_common::events::{EventBus, SessionEvent};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use super::experience::{ExperienceEntry, ExperienceHeader, ExperienceLog};
use super::{distance, Action, EpisodeState, TERMINATION_BONUS, TRUNCATION_PENALTY};
use crate::catalog::{SongCatalog, SongFeatureCache, SongFeatures, SongId};
use crate::config::EpisodeConfig;
use crate::error::{Error, Result};
use crate::estimator::HeartRateReading;
use crate::session::{OutboundAction, SessionId};

/// Interval between heart-rate readiness polls
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Polls between two "still waiting" warnings
const POLLS_PER_WARNING: u64 = 100;

/// Where an episode instance is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NotStarted,
    Ready,
    Stepping,
    Terminated,
    Truncated,
}

impl Phase {
    pub fn is_finished(self) -> bool {
        matches!(self, Phase::Terminated | Phase::Truncated)
    }
}

/// Result of one `step`
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub state: EpisodeState,
    pub reward: f64,
    pub terminated: bool,
    pub truncated: bool,
}

pub struct EpisodeStateMachine {
    session_id: SessionId,
    config: EpisodeConfig,
    /// Directory name put in front of song ids on the outbound channel
    song_prefix: String,
    catalog: SongCatalog,
    features: Arc<SongFeatureCache>,
    reading: HeartRateReading,
    outbound: UnboundedSender<OutboundAction>,
    events: Option<EventBus>,
    log: ExperienceLog,
    log_path: Option<PathBuf>,
    phase: Phase,
    state: Option<EpisodeState>,
    songs_left: u32,
    steps_left: u32,
    closed: bool,
}

impl EpisodeStateMachine {
    pub fn new(
        session_id: SessionId,
        config: EpisodeConfig,
        header: ExperienceHeader,
        catalog: SongCatalog,
        features: Arc<SongFeatureCache>,
        reading: HeartRateReading,
        outbound: UnboundedSender<OutboundAction>,
    ) -> Self {
        Self {
            session_id,
            songs_left: config.songs_per_episode,
            steps_left: config.max_steps,
            config,
            song_prefix: "songs".to_string(),
            catalog,
            features,
            reading,
            outbound,
            events: None,
            log: ExperienceLog::new(header),
            log_path: None,
            phase: Phase::NotStarted,
            state: None,
            closed: false,
        }
    }

    /// Prefix for outbound song paths (the song directory's name)
    pub fn with_song_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.song_prefix = prefix.into();
        self
    }

    /// File the experience log is written to on `close`
    pub fn with_log_path(mut self, path: PathBuf) -> Self {
        self.log_path = Some(path);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Start a new episode
    ///
    /// Signals `start`, waits for a warmed-up heart-rate reading and draws the
    /// first song. Counters go back to their configured maxima.
    pub async fn reset(&mut self) -> Result<EpisodeState> {
        self.send(OutboundAction::Start)?;

        let heart_bpm = self.wait_for_reading().await as u32;
        let (song, features) = self.draw_song().await?;
        let state = EpisodeState {
            heart_bpm,
            song,
            features,
        };

        self.songs_left = self.config.songs_per_episode;
        self.steps_left = self.config.max_steps;
        self.phase = Phase::Ready;
        self.state = Some(state.clone());

        debug!(
            session_id = self.session_id,
            "{}",
            render_state(&state, None)
        );
        Ok(state)
    }

    /// Apply one action
    pub async fn step(&mut self, action: Action) -> Result<StepOutcome> {
        if self.phase.is_finished() {
            return Err(Error::EpisodeFinished);
        }
        let previous = self.state.clone().ok_or(Error::EpisodeNotStarted)?;
        self.phase = Phase::Stepping;

        let heart_bpm = match action {
            Action::Accept => {
                self.songs_left = self.songs_left.saturating_sub(1);
                let payload = format!("{}/{}", self.song_prefix, previous.song);
                self.send(OutboundAction::Play(payload))?;
                tokio::time::sleep(self.config.song_duration()).await;
                self.wait_for_reading().await as u32
            }
            Action::Reject => previous.heart_bpm,
        };
        let (song, features) = self.draw_song().await?;
        let state = EpisodeState {
            heart_bpm,
            song,
            features,
        };

        let goal = self.config.goal_heart_bpm;
        let mut reward = distance(previous.heart_bpm, goal) - distance(state.heart_bpm, goal);

        let terminated = self.songs_left == 0;
        if terminated {
            reward = TERMINATION_BONUS - distance(state.heart_bpm, goal);
        }

        self.steps_left = self.steps_left.saturating_sub(1);
        let truncated = self.steps_left == 0;
        if truncated {
            reward = TRUNCATION_PENALTY;
        }

        self.log.record(ExperienceEntry {
            heart_bpm: previous.heart_bpm,
            song_file: previous.song.to_string(),
            action,
            reward,
            next_heart_bpm: state.heart_bpm,
            next_song_file: state.song.to_string(),
            terminated,
            truncated,
        });

        debug!(
            session_id = self.session_id,
            %action,
            reward,
            "{}",
            render_state(&state, Some(&previous))
        );
        if terminated {
            info!(session_id = self.session_id, "End of episode");
        }

        self.phase = if truncated {
            Phase::Truncated
        } else if terminated {
            Phase::Terminated
        } else {
            Phase::Stepping
        };
        self.state = Some(state.clone());

        Ok(StepOutcome {
            state,
            reward,
            terminated,
            truncated,
        })
    }

    /// Send `end` and write the experience log; later calls do nothing
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if self.outbound.send(OutboundAction::End).is_err() {
            debug!(session_id = self.session_id, "Outbound channel already gone at close");
        }

        match &self.log_path {
            Some(path) => self.log.save(path),
            None => Ok(()),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> Option<&EpisodeState> {
        self.state.as_ref()
    }

    pub fn songs_left(&self) -> u32 {
        self.songs_left
    }

    pub fn steps_left(&self) -> u32 {
        self.steps_left
    }

    pub fn log(&self) -> &ExperienceLog {
        &self.log
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn send(&self, action: OutboundAction) -> Result<()> {
        let payload = action.payload().to_string();
        self.outbound
            .send(action)
            .map_err(|_| Error::ChannelClosed(format!("session {} outbound actions", self.session_id)))?;

        if let Some(events) = &self.events {
            events.emit_lossy(SessionEvent::SongOffered {
                session_id: self.session_id,
                payload,
                timestamp: heartsync_common::time::now(),
            });
        }
        Ok(())
    }

    async fn draw_song(&mut self) -> Result<(SongId, Arc<SongFeatures>)> {
        let song = self.catalog.next_song()?;
        let cache = Arc::clone(&self.features);
        let lookup = song.clone();
        let features = tokio::task::spawn_blocking(move || cache.get(&lookup))
            .await
            .map_err(|e| Error::Features(format!("Feature task failed: {}", e)))??;
        Ok((song, features))
    }

    /// Poll until the estimator publishes a non-sentinel value
    ///
    /// Unbounded unless `warmup_timeout_seconds` is configured; on timeout the
    /// current value is used as is.
    async fn wait_for_reading(&self) -> f64 {
        let started = Instant::now();
        let timeout = self.config.warmup_timeout();
        let mut polls: u64 = 0;

        while !self.reading.is_warmed_up() {
            if let Some(limit) = timeout {
                if started.elapsed() >= limit {
                    warn!(
                        session_id = self.session_id,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "Heart rate still not available, using current reading"
                    );
                    break;
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
            polls += 1;
            if polls % POLLS_PER_WARNING == 0 {
                warn!(session_id = self.session_id, polls, "Waiting for more images");
            }
        }

        self.reading.get()
    }
}

fn trend(now: u32, before: u32) -> char {
    if now > before {
        '↑'
    } else if now < before {
        '↓'
    } else {
        '-'
    }
}

/// `song_bpm: 120 BPM ↑ heart_bpm: 72 BPM -`
fn render_state(state: &EpisodeState, previous: Option<&EpisodeState>) -> String {
    let fields = [
        ("song_bpm", state.song_bpm(), previous.map(EpisodeState::song_bpm)),
        ("heart_bpm", state.heart_bpm, previous.map(|p| p.heart_bpm)),
    ];
    fields
        .iter()
        .map(|(name, value, before)| match before {
            Some(before) => format!("{}: {} BPM {}", name, value, trend(*value, *before)),
            None => format!("{}: {} BPM", name, value),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
