//! Integration tests for session registration, teardown and the checkpoint pool

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use heartsync_bf::agent::{AgentFactory, DecisionAgent};
use heartsync_bf::catalog::{ChromaMatrix, FeatureExtractor, SongFeatures, SongId};
use heartsync_bf::checkpoint::{CheckpointHandle, CheckpointPool, LAST_MODEL_FILE};
use heartsync_bf::config::{EpisodeConfig, ServiceConfig, SessionConfig, TrainingConfig};
use heartsync_bf::episode::{read_experience_log, Action, EpisodeState, EXPERIENCE_LOG_FILE};
use heartsync_bf::estimator::Frame;
use heartsync_bf::session::{OutboundAction, SessionId, SessionRegistry};
use heartsync_bf::Error;
use heartsync_common::events::{EventBus, SessionEvent};
use tempfile::TempDir;

struct FixedFeatures;

impl FeatureExtractor for FixedFeatures {
    fn extract(&self, _song: &SongId) -> heartsync_bf::Result<SongFeatures> {
        Ok(SongFeatures {
            bpm: 100,
            chroma: ChromaMatrix::zeros(12, 2),
        })
    }
}

/// Accepts every song, so every step plays one
struct AcceptEverything;

impl DecisionAgent for AcceptEverything {
    fn act(&mut self, _state: &EpisodeState) -> Action {
        Action::Accept
    }

    fn observe(&mut self, _: &EpisodeState, _: Action, _: f64, _: &EpisodeState, _: bool) {}

    fn save(&self, path: &Path) -> heartsync_bf::Result<()> {
        std::fs::write(path, b"accept")?;
        Ok(())
    }
}

struct AcceptingAgents;

impl AgentFactory for AcceptingAgents {
    fn fresh(&self) -> Box<dyn DecisionAgent> {
        Box::new(AcceptEverything)
    }

    fn load(&self, _checkpoint: &CheckpointHandle) -> heartsync_bf::Result<Box<dyn DecisionAgent>> {
        Ok(Box::new(AcceptEverything))
    }
}

/// Root folder with `songs/<category>/<file>` placeholders
fn root_with_songs(songs: &[&str]) -> TempDir {
    let root = tempfile::tempdir().unwrap();
    let song_dir = root.path().join("songs");
    std::fs::create_dir_all(&song_dir).unwrap();
    for song in songs {
        let path = song_dir.join(song);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not decoded in tests").unwrap();
    }
    root
}

/// Sessions that never warm up and train until stopped
fn idle_config() -> ServiceConfig {
    ServiceConfig {
        episode: EpisodeConfig {
            song_duration_seconds: 0.0,
            ..EpisodeConfig::default()
        },
        ..ServiceConfig::default()
    }
}

/// Sessions that skip the warm-up wait and stop after `steps` steps
fn bounded_config(steps: u64) -> ServiceConfig {
    ServiceConfig {
        episode: EpisodeConfig {
            song_duration_seconds: 0.0,
            warmup_timeout_seconds: Some(0.0),
            ..EpisodeConfig::default()
        },
        training: TrainingConfig {
            total_timesteps: Some(steps),
            ..TrainingConfig::default()
        },
        ..ServiceConfig::default()
    }
}

/// Warm-up skipped, each accepted song plays for `song_secs`, no step limit
fn playing_config(song_secs: f64) -> ServiceConfig {
    ServiceConfig {
        episode: EpisodeConfig {
            song_duration_seconds: song_secs,
            warmup_timeout_seconds: Some(0.0),
            ..EpisodeConfig::default()
        },
        ..ServiceConfig::default()
    }
}

/// Never warms up; cancelled after `idle_secs` without consumer traffic
fn reclaiming_config(idle_secs: f64) -> ServiceConfig {
    ServiceConfig {
        session: SessionConfig {
            idle_timeout_seconds: Some(idle_secs),
        },
        ..idle_config()
    }
}

fn registry(config: ServiceConfig, root: &Path, events: EventBus) -> SessionRegistry {
    SessionRegistry::new(config, root, Arc::new(CheckpointPool::new()), events)
        .with_feature_extractor(Arc::new(FixedFeatures))
}

async fn drain_actions(registry: &SessionRegistry, session_id: SessionId) -> Vec<OutboundAction> {
    let mut actions = Vec::new();
    loop {
        let action = tokio::time::timeout(Duration::from_secs(10), registry.dequeue_action(session_id))
            .await
            .expect("worker did not produce an action in time")
            .unwrap();
        let done = action.is_end();
        actions.push(action);
        if done {
            return actions;
        }
    }
}

fn session_dir(registry: &SessionRegistry, session_id: SessionId) -> std::path::PathBuf {
    let suffix = format!("-{:06}", session_id);
    std::fs::read_dir(registry.logs_directory())
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.file_name().unwrap().to_string_lossy().ends_with(&suffix))
        .expect("session directory missing")
}

#[tokio::test]
async fn test_concurrent_creation_yields_unique_ids() {
    let root = root_with_songs(&["pop/a.mp3", "rock/b.mp3"]);
    let registry = Arc::new(registry(idle_config(), root.path(), EventBus::new(100)));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.create_session().await.unwrap() })
        })
        .collect();

    let mut ids = HashSet::new();
    for task in tasks {
        ids.insert(task.await.unwrap());
    }
    assert_eq!(ids, (0..8).collect::<HashSet<SessionId>>());
    assert_eq!(registry.active_count().await, 8);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_empty_catalog_fails_before_allocating_id() {
    let root = root_with_songs(&[]);
    let registry = registry(idle_config(), root.path(), EventBus::new(100));

    assert!(matches!(
        registry.create_session().await,
        Err(Error::EmptyCatalog)
    ));
    assert_eq!(registry.active_count().await, 0);

    let song = root.path().join("songs/pop/a.mp3");
    std::fs::create_dir_all(song.parent().unwrap()).unwrap();
    std::fs::write(&song, b"x").unwrap();
    assert_eq!(registry.create_session().await.unwrap(), 0);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_unknown_session_rejected() {
    let root = root_with_songs(&["pop/a.mp3"]);
    let registry = registry(idle_config(), root.path(), EventBus::new(100));

    assert!(matches!(
        registry.enqueue_frame(42, Frame::solid(4, 4, [0, 0, 0])).await,
        Err(Error::UnknownSession(42))
    ));
    assert!(matches!(
        registry.dequeue_action(42).await,
        Err(Error::UnknownSession(42))
    ));
    assert!(matches!(
        registry.cancel_session(42).await,
        Err(Error::UnknownSession(42))
    ));
}

#[tokio::test]
async fn test_bounded_session_persists_artifacts() {
    let root = root_with_songs(&["pop/a.mp3", "pop/b.mp3", "rock/c.mp3"]);
    let events = EventBus::new(1000);
    let mut rx = events.subscribe();
    let registry = registry(bounded_config(3), root.path(), events);

    let id = registry.create_session().await.unwrap();
    let actions = drain_actions(&registry, id).await;
    assert_eq!(actions.first(), Some(&OutboundAction::Start));
    assert_eq!(actions.last(), Some(&OutboundAction::End));
    for action in &actions[1..actions.len() - 1] {
        match action {
            OutboundAction::Play(path) => assert!(path.starts_with("songs/")),
            OutboundAction::Start => {}
            OutboundAction::End => panic!("end delivered twice"),
        }
    }

    // End unregisters the session
    assert!(matches!(
        registry.dequeue_action(id).await,
        Err(Error::UnknownSession(_))
    ));

    registry.shutdown().await;

    let dir = session_dir(&registry, id);
    assert_eq!(read_experience_log(&dir.join(EXPERIENCE_LOG_FILE)).unwrap().len(), 3);
    assert!(dir.join(LAST_MODEL_FILE).exists());
    assert_eq!(registry.checkpoints().len(), 1);
    assert_eq!(
        registry.checkpoints().pop().unwrap().path(),
        dir.join(LAST_MODEL_FILE).as_path()
    );

    let mut steps = 0;
    let mut ended = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            SessionEvent::StepCompleted { .. } => steps += 1,
            SessionEvent::SessionEnded { cancelled, total_steps, .. } => {
                assert!(!cancelled);
                assert_eq!(total_steps, 3);
                ended = true;
            }
            _ => {}
        }
    }
    assert_eq!(steps, 3);
    assert!(ended);
}

#[tokio::test]
async fn test_next_session_resumes_pooled_checkpoint() {
    let root = root_with_songs(&["pop/a.mp3"]);
    let events = EventBus::new(1000);
    let mut rx = events.subscribe();
    let registry = registry(bounded_config(2), root.path(), events);

    let first = registry.create_session().await.unwrap();
    drain_actions(&registry, first).await;
    registry.shutdown().await;
    assert_eq!(registry.checkpoints().len(), 1);

    let second = registry.create_session().await.unwrap();
    drain_actions(&registry, second).await;
    registry.shutdown().await;

    let mut resumed = None;
    while let Ok(event) = rx.try_recv() {
        if let SessionEvent::SessionStarted { session_id, resumed_from, .. } = event {
            if session_id == second {
                resumed = resumed_from;
            }
        }
    }
    let expected = session_dir(&registry, first).join(LAST_MODEL_FILE);
    assert_eq!(resumed, Some(expected.display().to_string()));

    // The resumed artifact was popped; only the second session's is pooled
    assert_eq!(registry.checkpoints().len(), 1);
}

#[tokio::test]
async fn test_stop_during_warmup_ends_session() {
    let root = root_with_songs(&["pop/a.mp3"]);
    let registry = registry(idle_config(), root.path(), EventBus::new(100));

    let id = registry.create_session().await.unwrap();
    assert_eq!(registry.dequeue_action(id).await.unwrap(), OutboundAction::Start);

    registry.cancel_session(id).await.unwrap();
    registry.shutdown().await;

    // Worker is gone: frames are dropped, the pending end is still delivered
    registry
        .enqueue_frame(id, Frame::solid(4, 4, [10, 10, 10]))
        .await
        .unwrap();
    assert_eq!(registry.dequeue_action(id).await.unwrap(), OutboundAction::End);

    // Stopping a finished session is a no-op; frames are now rejected
    registry.cancel_session(id).await.unwrap();
    assert!(matches!(
        registry.enqueue_frame(id, Frame::solid(4, 4, [10, 10, 10])).await,
        Err(Error::UnknownSession(_))
    ));

    let dir = session_dir(&registry, id);
    assert!(read_experience_log(&dir.join(EXPERIENCE_LOG_FILE)).unwrap().is_empty());
    assert!(dir.join(LAST_MODEL_FILE).exists());
    assert_eq!(registry.checkpoints().len(), 1);
}

#[tokio::test]
async fn test_stop_mid_song_keeps_every_completed_step() {
    let root = root_with_songs(&["pop/a.mp3", "pop/b.mp3", "rock/c.mp3", "rock/d.mp3"]);
    let registry = registry(playing_config(0.3), root.path(), EventBus::new(1000))
        .with_agent_factory(Arc::new(AcceptingAgents));

    let id = registry.create_session().await.unwrap();
    assert_eq!(registry.dequeue_action(id).await.unwrap(), OutboundAction::Start);

    let mut played = Vec::new();
    for _ in 0..3 {
        match registry.dequeue_action(id).await.unwrap() {
            OutboundAction::Play(path) => played.push(path),
            other => panic!("expected a song, got {}", other),
        }
    }

    // The third song is still playing when the stop arrives
    registry.cancel_session(id).await.unwrap();
    let rest = drain_actions(&registry, id).await;
    assert_eq!(rest.last(), Some(&OutboundAction::End));
    for action in &rest {
        if let OutboundAction::Play(path) = action {
            played.push(path.clone());
        }
    }
    registry.shutdown().await;

    let entries = read_experience_log(&session_dir(&registry, id).join(EXPERIENCE_LOG_FILE)).unwrap();
    assert!(entries.len() >= 3);
    assert_eq!(entries.len(), played.len());
    for (entry, path) in entries.iter().zip(&played) {
        assert_eq!(entry.action, Action::Accept);
        assert_eq!(&format!("songs/{}", entry.song_file), path);
    }
    for pair in entries.windows(2) {
        assert_eq!(pair[0].next_song_file, pair[1].song_file);
        assert_eq!(pair[0].next_heart_bpm, pair[1].heart_bpm);
    }
}

#[tokio::test]
async fn test_abandoned_session_is_reclaimed() {
    let root = root_with_songs(&["pop/a.mp3"]);
    let events = EventBus::new(100);
    let mut rx = events.subscribe();
    let registry = registry(reclaiming_config(0.3), root.path(), events);

    let id = registry.create_session().await.unwrap();
    assert_eq!(registry.active_count().await, 1);

    let mut remaining = 100;
    while registry.active_count().await > 0 && remaining > 0 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        remaining -= 1;
    }
    assert_eq!(registry.active_count().await, 0, "idle session was never reclaimed");

    assert!(matches!(
        registry.dequeue_action(id).await,
        Err(Error::UnknownSession(_))
    ));
    registry.cancel_session(id).await.unwrap();
    registry.shutdown().await;

    // Reclaimed sessions still persist their agent
    assert!(session_dir(&registry, id).join(LAST_MODEL_FILE).exists());
    assert_eq!(registry.checkpoints().len(), 1);

    let mut cancelled = false;
    while let Ok(event) = rx.try_recv() {
        if let SessionEvent::SessionEnded { session_id, cancelled: c, .. } = event {
            cancelled = session_id == id && c;
        }
    }
    assert!(cancelled);
}

#[tokio::test]
async fn test_waiting_consumer_keeps_session_alive() {
    let root = root_with_songs(&["pop/a.mp3"]);
    let registry = Arc::new(registry(reclaiming_config(0.3), root.path(), EventBus::new(100)));

    let id = registry.create_session().await.unwrap();
    assert_eq!(registry.dequeue_action(id).await.unwrap(), OutboundAction::Start);

    // Blocks: the estimator never warms up, so no song is offered
    let waiting = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.dequeue_action(id).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(registry.active_count().await, 1);

    registry.shutdown().await;
    assert_eq!(waiting.await.unwrap().unwrap(), OutboundAction::End);
    assert_eq!(registry.active_count().await, 0);
}

#[tokio::test]
async fn test_streaming_frames_keeps_session_alive() {
    let root = root_with_songs(&["pop/a.mp3"]);
    let registry = registry(reclaiming_config(0.3), root.path(), EventBus::new(100));

    let id = registry.create_session().await.unwrap();
    for _ in 0..20 {
        registry
            .enqueue_frame(id, Frame::solid(8, 8, [120, 120, 120]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(registry.active_count().await, 1);

    registry.shutdown().await;
}

#[test]
fn test_sessions_do_not_exhaust_blocking_pool() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .max_blocking_threads(2)
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async {
        let root = root_with_songs(&["pop/a.mp3"]);
        let registry = registry(idle_config(), root.path(), EventBus::new(100));

        // More sessions than blocking threads, each parked in warm-up
        for expected in 0..4 {
            let id = tokio::time::timeout(Duration::from_secs(5), registry.create_session())
                .await
                .expect("create_session stalled")
                .unwrap();
            assert_eq!(id, expected);
        }
        assert_eq!(registry.active_count().await, 4);

        registry.shutdown().await;
    });
}
