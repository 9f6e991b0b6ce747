//! Configuration for the biofeedback service
//!
//! One TOML file (`heartsync-bf.toml`) holds bootstrap settings and the
//! experiment parameters. Every field has a built-in default, so a missing
//! file still yields a runnable service.
//!
//! ```toml
//! root_folder = "/srv/heartsync"
//! port = 5750
//!
//! [episode]
//! goal_heart_bpm = 60
//! songs_per_episode = 10
//! song_duration_seconds = 20
//!
//! [catalog]
//! song_directory = "songs"
//!
//! [session]
//! idle_timeout_seconds = 120
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use heartsync_common::config::LoggingConfig;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Service name used for config file lookup and logging
pub const MODULE_NAME: &str = "heartsync-bf";

/// Complete service configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    /// Root folder holding songs and session logs
    pub root_folder: Option<PathBuf>,
    /// HTTP server port
    pub port: u16,
    /// HTTP bind address
    pub bind_address: String,
    pub logging: LoggingConfig,
    pub episode: EpisodeConfig,
    pub estimator: EstimatorConfig,
    pub catalog: CatalogConfig,
    pub training: TrainingConfig,
    pub session: SessionConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            root_folder: None,
            port: 5750,
            bind_address: "127.0.0.1".to_string(),
            logging: LoggingConfig::default(),
            episode: EpisodeConfig::default(),
            estimator: EstimatorConfig::default(),
            catalog: CatalogConfig::default(),
            training: TrainingConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Reject parameter combinations that would make every session fail
    pub fn validate(&self) -> Result<()> {
        if self.episode.songs_per_episode == 0 {
            return Err(Error::Config("episode.songs_per_episode must be > 0".into()));
        }
        if self.episode.max_steps == 0 {
            return Err(Error::Config("episode.max_steps must be > 0".into()));
        }
        if self.episode.song_duration_seconds < 0.0 {
            return Err(Error::Config("episode.song_duration_seconds must be >= 0".into()));
        }
        if self.estimator.frame_width == 0 || self.estimator.frame_height == 0 {
            return Err(Error::Config("estimator frame size must be non-zero".into()));
        }
        if self.estimator.min_hz >= self.estimator.max_hz {
            return Err(Error::Config("estimator.min_hz must be below max_hz".into()));
        }
        if self.catalog.hop_length == 0 {
            return Err(Error::Config("catalog.hop_length must be > 0".into()));
        }
        if self.training.checkpoint_every_steps == 0 {
            return Err(Error::Config("training.checkpoint_every_steps must be > 0".into()));
        }
        if matches!(self.session.idle_timeout_seconds, Some(secs) if secs <= 0.0) {
            return Err(Error::Config("session.idle_timeout_seconds must be > 0".into()));
        }
        Ok(())
    }

    /// Song directory, resolved against the root folder when relative
    pub fn song_directory(&self, root_folder: &Path) -> PathBuf {
        if self.catalog.song_directory.is_absolute() {
            self.catalog.song_directory.clone()
        } else {
            root_folder.join(&self.catalog.song_directory)
        }
    }

    /// Directory receiving one sub-directory per session
    pub fn logs_directory(root_folder: &Path) -> PathBuf {
        root_folder.join("logs")
    }
}

/// Decision-process parameters, fixed for the life of a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EpisodeConfig {
    pub goal_heart_bpm: u32,
    pub max_heart_bpm: u32,
    pub max_song_bpm: u32,
    /// Step budget per episode; exhausting it truncates the episode
    pub max_steps: u32,
    /// Accepted songs per episode; reaching it terminates the episode
    pub songs_per_episode: u32,
    /// How long an accepted song plays before the heart rate is read again
    pub song_duration_seconds: f64,
    /// Give up waiting for a warmed-up estimator after this long (absent = wait forever)
    pub warmup_timeout_seconds: Option<f64>,
}

impl Default for EpisodeConfig {
    fn default() -> Self {
        Self {
            goal_heart_bpm: 60,
            max_heart_bpm: 300,
            max_song_bpm: 300,
            max_steps: 1000,
            songs_per_episode: 10,
            song_duration_seconds: 20.0,
            warmup_timeout_seconds: None,
        }
    }
}

impl EpisodeConfig {
    pub fn song_duration(&self) -> Duration {
        Duration::from_secs_f64(self.song_duration_seconds.max(0.0))
    }

    pub fn warmup_timeout(&self) -> Option<Duration> {
        self.warmup_timeout_seconds
            .map(|secs| Duration::from_secs_f64(secs.max(0.0)))
    }
}

/// Heart-rate estimator parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Width every uploaded frame is resized to
    pub frame_width: usize,
    /// Height every uploaded frame is resized to
    pub frame_height: usize,
    /// Pyramid depth; frames are reduced `pyramid_levels + 1` times
    pub pyramid_levels: usize,
    /// Rolling window length in frames
    pub buffer_size: usize,
    /// Frame rate the browser uploads at
    pub fps: f64,
    /// Lower edge of the physiological band (0.8 Hz = 48 BPM)
    pub min_hz: f64,
    /// Upper edge of the physiological band (2.5 Hz = 150 BPM)
    pub max_hz: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            frame_width: 640,
            frame_height: 480,
            pyramid_levels: 3,
            buffer_size: 150,
            fps: 10.0,
            min_hz: 0.8,
            max_hz: 2.5,
        }
    }
}

/// Song catalog and feature extraction parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CatalogConfig {
    /// `<category>/<file>` tree of songs (relative to the root folder unless absolute)
    pub song_directory: PathBuf,
    /// Draw with replacement instead of cycling through every song
    pub repeat_shuffle: bool,
    /// Reference sample rate the chroma hop length is expressed in
    pub sampling_rate: u32,
    /// Chroma hop length in samples at `sampling_rate`
    pub hop_length: usize,
    /// Zero rows added around the 12 chroma rows
    pub chroma_padding: usize,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            song_directory: PathBuf::from("songs"),
            repeat_shuffle: false,
            sampling_rate: 22050,
            hop_length: 512,
            chroma_padding: 30,
        }
    }
}

/// Reference agent and checkpoint cadence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainingConfig {
    /// Evaluate (and possibly save) the best-reward checkpoint every N steps
    pub checkpoint_every_steps: u64,
    /// Stop the worker after this many steps (absent = run until stopped)
    pub total_timesteps: Option<u64>,
    /// Exploration rate of the reference agent
    pub epsilon: f64,
    pub learning_rate: f64,
    pub discount: f64,
    /// Width of the BPM buckets the reference agent's table is keyed on
    pub bucket_bpm: u32,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            checkpoint_every_steps: 10,
            total_timesteps: None,
            epsilon: 0.1,
            learning_rate: 0.1,
            discount: 0.9,
            bucket_bpm: 10,
        }
    }
}

/// Session lifetime parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Cancel a session after this long without `/image` or `/action` traffic
    /// (absent = never). A pending `/action` request counts as traffic.
    pub idle_timeout_seconds: Option<f64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: Some(120.0),
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_seconds
            .filter(|secs| *secs > 0.0)
            .map(Duration::from_secs_f64)
    }
}
