//! Checkpoint artifacts and the process-wide reuse pool
//!
//! A finishing session pushes its final artifact; the next session pops the
//! most recent one and resumes from it. Artifacts are `*.ckpt` files inside
//! session directories, so lexical order of `logs/<session dir>/<file>` is
//! chronological order.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::agent::DecisionAgent;
use crate::error::{Error, Result};

/// Artifact file extension
pub const CHECKPOINT_EXTENSION: &str = "ckpt";

/// Final artifact written when a worker exits
pub const LAST_MODEL_FILE: &str = "last_model.ckpt";

/// Best-mean-reward artifact
pub const BEST_MODEL_FILE: &str = "best_model.ckpt";

/// Marker of intermediate backups, never offered for reuse
const BACKUP_MARKER: &str = "backup";

/// Opaque reference to a persisted artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CheckpointHandle(PathBuf);

impl CheckpointHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for CheckpointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// LIFO stack of reusable artifacts
///
/// Every push and pop holds the lock, so no two sessions can pop the same
/// handle.
#[derive(Debug, Default)]
pub struct CheckpointPool {
    stack: Mutex<Vec<CheckpointHandle>>,
}

impl CheckpointPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<CheckpointHandle>> {
        self.stack.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, handle: CheckpointHandle) {
        debug!(checkpoint = %handle, "Checkpoint pooled");
        self.lock().push(handle);
    }

    /// Most recently pushed handle, if any
    pub fn pop(&self) -> Option<CheckpointHandle> {
        self.lock().pop()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn is_reusable_artifact(path: &Path) -> bool {
    let is_ckpt = path.extension().and_then(|e| e.to_str()) == Some(CHECKPOINT_EXTENSION);
    let is_backup = path
        .file_name()
        .map(|n| n.to_string_lossy().contains(BACKUP_MARKER))
        .unwrap_or(true);
    is_ckpt && !is_backup
}

/// Seed the pool from artifacts left by earlier runs
///
/// Session directories are visited in lexical order and artifacts inside
/// each in lexical order, so the newest artifact ends up on top. A missing
/// logs directory yields an empty pool.
pub fn create_initial_checkpoint_pool(logs_root: &Path) -> Result<CheckpointPool> {
    let pool = CheckpointPool::new();
    if !logs_root.is_dir() {
        info!(logs = %logs_root.display(), "No logs directory yet, checkpoint pool is empty");
        return Ok(pool);
    }

    let walker = WalkDir::new(logs_root)
        .min_depth(2)
        .max_depth(2)
        .sort_by_file_name();
    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_file() && is_reusable_artifact(entry.path()) {
            pool.push(CheckpointHandle::new(entry.into_path()));
        }
    }

    info!(
        logs = %logs_root.display(),
        checkpoints = pool.len(),
        "Checkpoint pool initialised"
    );
    Ok(pool)
}

/// `<stem>_backup.ckpt` next to `path`
pub fn backup_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!("{}_{}.{}", stem, BACKUP_MARKER, CHECKPOINT_EXTENSION))
}

/// Save `agent` to `path`, moving any existing artifact to its backup name first
pub fn save_checkpoint(agent: &dyn DecisionAgent, path: &Path) -> Result<CheckpointHandle> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if path.exists() {
        let backup = backup_path(path);
        std::fs::rename(path, &backup).map_err(|e| {
            Error::Checkpoint(format!("Cannot back up {}: {}", path.display(), e))
        })?;
        debug!(backup = %backup.display(), "Previous checkpoint kept as backup");
    }

    agent.save(path).map_err(|e| {
        warn!(path = %path.display(), error = %e, "Checkpoint save failed");
        match e {
            Error::Checkpoint(_) => e,
            other => Error::Checkpoint(format!("Cannot write {}: {}", path.display(), other)),
        }
    })?;

    info!(checkpoint = %path.display(), "Checkpoint saved");
    Ok(CheckpointHandle::new(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episode::{Action, EpisodeState};
    use crate::session::session_dir_name;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct ConstantAgent(&'static str);

    impl DecisionAgent for ConstantAgent {
        fn act(&mut self, _state: &EpisodeState) -> Action {
            Action::Accept
        }

        fn observe(&mut self, _: &EpisodeState, _: Action, _: f64, _: &EpisodeState, _: bool) {}

        fn save(&self, path: &Path) -> Result<()> {
            std::fs::write(path, self.0)?;
            Ok(())
        }
    }

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"{}").unwrap();
    }

    #[test]
    fn test_pool_is_lifo() {
        let pool = CheckpointPool::new();
        pool.push(CheckpointHandle::new("a.ckpt"));
        pool.push(CheckpointHandle::new("b.ckpt"));

        assert_eq!(pool.pop(), Some(CheckpointHandle::new("b.ckpt")));
        assert_eq!(pool.pop(), Some(CheckpointHandle::new("a.ckpt")));
        assert_eq!(pool.pop(), None);
    }

    #[test]
    fn test_concurrent_pops_never_share_a_handle() {
        let pool = Arc::new(CheckpointPool::new());
        for i in 0..200 {
            pool.push(CheckpointHandle::new(format!("{}.ckpt", i)));
        }

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Some(handle) = pool.pop() {
                        got.push(handle);
                    }
                    got
                })
            })
            .collect();

        let mut all: Vec<CheckpointHandle> =
            threads.into_iter().flat_map(|t| t.join().unwrap()).collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 200);
    }

    #[test]
    fn test_initial_pool_orders_and_filters() {
        let dir = TempDir::new().unwrap();
        let logs = dir.path();
        touch(&logs.join("log2024-01-01-10-00-00-1/best_model.ckpt"));
        touch(&logs.join("log2024-01-01-10-00-00-1/last_model.ckpt"));
        touch(&logs.join("log2024-01-01-10-00-00-1/best_model_backup.ckpt"));
        touch(&logs.join("log2024-01-01-10-00-00-1/experience_log.csv"));
        touch(&logs.join("log2024-02-01-08-00-00-2/last_model.ckpt"));

        let pool = create_initial_checkpoint_pool(logs).unwrap();
        assert_eq!(pool.len(), 3);
        assert!(pool
            .pop()
            .unwrap()
            .path()
            .ends_with("log2024-02-01-08-00-00-2/last_model.ckpt"));
        assert!(pool
            .pop()
            .unwrap()
            .path()
            .ends_with("log2024-01-01-10-00-00-1/last_model.ckpt"));
        assert!(pool
            .pop()
            .unwrap()
            .path()
            .ends_with("log2024-01-01-10-00-00-1/best_model.ckpt"));
    }

    #[test]
    fn test_initial_pool_orders_same_second_sessions_by_id() {
        let dir = TempDir::new().unwrap();
        let logs = dir.path();
        let stamp = "2024-01-01-10-00-00";
        for id in [9, 10] {
            touch(&logs.join(session_dir_name(stamp, id)).join("last_model.ckpt"));
        }

        let pool = create_initial_checkpoint_pool(logs).unwrap();
        let newest = pool.pop().unwrap();
        assert!(newest
            .path()
            .starts_with(logs.join(session_dir_name(stamp, 10))));
        assert!(pool
            .pop()
            .unwrap()
            .path()
            .starts_with(logs.join(session_dir_name(stamp, 9))));
    }

    #[test]
    fn test_initial_pool_without_logs_directory() {
        let dir = TempDir::new().unwrap();
        let pool = create_initial_checkpoint_pool(&dir.path().join("missing")).unwrap();
        assert!(pool.is_empty());
    }

    #[test]
    fn test_save_moves_previous_artifact_to_backup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(BEST_MODEL_FILE);

        save_checkpoint(&ConstantAgent("first"), &path).unwrap();
        let handle = save_checkpoint(&ConstantAgent("second"), &path).unwrap();

        assert_eq!(handle.path(), path.as_path());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("best_model_backup.ckpt")).unwrap(),
            "first"
        );
    }
}
