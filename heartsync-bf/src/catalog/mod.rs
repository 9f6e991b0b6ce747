//! Song catalog: the tracks a session can offer
//!
//! Tracks live in a `<song_directory>/<category>/<file>` tree. A track's
//! identity is its path relative to the song directory.

pub mod features;

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::error::{Error, Result};

pub use features::{
    AudioFeatureExtractor, ChromaMatrix, FeatureExtractor, SongFeatureCache, SongFeatures,
};

/// Track identifier: `<category>/<file>` relative to the song directory
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SongId(String);

impl SongId {
    pub fn new(category: &str, file_name: &str) -> Self {
        Self(format!("{}/{}", category, file_name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Category directory the track was found in
    pub fn category(&self) -> &str {
        self.0.split_once('/').map(|(c, _)| c).unwrap_or("")
    }
}

impl fmt::Display for SongId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SongId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// The set of tracks a session draws from
///
/// In the default mode every track is returned once per cycle, in random
/// order; once all have been returned the cycle restarts. With
/// `repeat_shuffle` every draw is uniform with replacement.
pub struct SongCatalog {
    songs: Vec<SongId>,
    repeat_shuffle: bool,
    picked: HashSet<SongId>,
    rng: StdRng,
}

impl SongCatalog {
    /// Build a catalog from explicit tracks; fails with `EmptyCatalog` when none are given
    pub fn new(songs: Vec<SongId>, repeat_shuffle: bool) -> Result<Self> {
        if songs.is_empty() {
            return Err(Error::EmptyCatalog);
        }
        Ok(Self {
            songs,
            repeat_shuffle,
            picked: HashSet::new(),
            rng: StdRng::from_entropy(),
        })
    }

    /// Use a fixed random seed (reproducible draw order)
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Scan `<dir>/<category>/<file>`; hidden and non-audio entries are ignored
    pub fn load(dir: &Path, repeat_shuffle: bool) -> Result<Self> {
        let songs = scan_song_directory(dir)?;
        info!(
            song_directory = %dir.display(),
            songs = songs.len(),
            "Song catalog loaded"
        );
        Self::new(songs, repeat_shuffle)
    }

    /// Draw the next track
    pub fn next_song(&mut self) -> Result<SongId> {
        if self.songs.is_empty() {
            return Err(Error::EmptyCatalog);
        }

        let song = if self.repeat_shuffle {
            self.songs.choose(&mut self.rng).cloned()
        } else {
            let candidates: Vec<&SongId> = self
                .songs
                .iter()
                .filter(|song| !self.picked.contains(*song))
                .collect();
            candidates.choose(&mut self.rng).map(|song| (*song).clone())
        }
        .ok_or(Error::EmptyCatalog)?;

        if !self.repeat_shuffle {
            self.picked.insert(song.clone());
            if self.picked.len() == self.songs.len() {
                debug!("Every song offered once, starting a new cycle");
                self.picked.clear();
            }
        }

        Ok(song)
    }

    pub fn len(&self) -> usize {
        self.songs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.songs.is_empty()
    }

    pub fn songs(&self) -> &[SongId] {
        &self.songs
    }
}

/// Extensions the feature extractor can decode
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "flac", "ogg", "oga", "m4a", "aac", "mp4", "wav"];

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.')
}

fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| AUDIO_EXTENSIONS.contains(&ext.as_str()))
}

/// Sorted list of `<category>/<file>` audio tracks below `dir`
///
/// Hidden entries and files without an audio extension are skipped.
pub fn scan_song_directory(dir: &Path) -> Result<Vec<SongId>> {
    let walker = WalkDir::new(dir)
        .follow_links(true)
        .min_depth(2)
        .max_depth(2)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_hidden(e));

    let mut songs = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => {
                return Err(Error::Catalog(format!("Cannot read {}: {}", dir.display(), e)));
            }
            Err(e) => {
                warn!("Error accessing song entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if !is_audio_file(entry.path()) {
            debug!(path = %entry.path().display(), "Skipping non-audio file");
            continue;
        }

        let category = entry
            .path()
            .parent()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        songs.push(SongId::new(&category, &entry.file_name().to_string_lossy()));
    }

    Ok(songs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn songs(n: usize) -> Vec<SongId> {
        (0..n).map(|i| SongId::new("rock", &format!("song{}.mp3", i))).collect()
    }

    #[test]
    fn test_empty_catalog_rejected() {
        assert!(matches!(
            SongCatalog::new(Vec::new(), false),
            Err(Error::EmptyCatalog)
        ));
    }

    #[test]
    fn test_cycle_returns_every_song_exactly_once() {
        let mut catalog = SongCatalog::new(songs(7), false).unwrap().with_seed(42);

        for _cycle in 0..3 {
            let mut seen = HashSet::new();
            for _ in 0..7 {
                let song = catalog.next_song().unwrap();
                assert!(seen.insert(song), "song repeated within a cycle");
            }
            assert_eq!(seen.len(), 7);
        }
    }

    #[test]
    fn test_single_song_catalog_repeats() {
        let mut catalog = SongCatalog::new(songs(1), false).unwrap();
        let first = catalog.next_song().unwrap();
        assert_eq!(catalog.next_song().unwrap(), first);
    }

    #[test]
    fn test_repeat_shuffle_draws_with_replacement() {
        let mut catalog = SongCatalog::new(songs(2), true).unwrap().with_seed(7);
        let mut counts: HashMap<SongId, usize> = HashMap::new();
        for _ in 0..200 {
            *counts.entry(catalog.next_song().unwrap()).or_default() += 1;
        }
        // With replacement, 200 draws from 2 songs must repeat both
        assert_eq!(counts.len(), 2);
        assert!(counts.values().all(|&c| c > 1));
    }

    #[test]
    fn test_load_scans_categories_and_skips_hidden() {
        let dir = TempDir::new().unwrap();
        for (category, file) in [("salsa", "b.mp3"), ("rock", "a.mp3"), ("rock", "c.mp3")] {
            std::fs::create_dir_all(dir.path().join(category)).unwrap();
            std::fs::write(dir.path().join(category).join(file), b"x").unwrap();
        }
        std::fs::write(dir.path().join("rock").join(".DS_Store"), b"x").unwrap();
        std::fs::create_dir_all(dir.path().join(".cache")).unwrap();
        std::fs::write(dir.path().join("README.txt"), b"x").unwrap();

        let catalog = SongCatalog::load(dir.path(), false).unwrap();
        let ids: Vec<&str> = catalog.songs().iter().map(SongId::as_str).collect();
        assert_eq!(ids, vec!["rock/a.mp3", "rock/c.mp3", "salsa/b.mp3"]);
        assert_eq!(catalog.songs()[2].category(), "salsa");
    }

    #[test]
    fn test_load_skips_non_audio_files() {
        let dir = TempDir::new().unwrap();
        let rock = dir.path().join("rock");
        std::fs::create_dir_all(&rock).unwrap();
        for file in ["cover.jpg", "README", "b.FLAC", "a.mp3", "notes.txt"] {
            std::fs::write(rock.join(file), b"x").unwrap();
        }
        std::fs::create_dir_all(rock.join("nested.mp3")).unwrap();

        let catalog = SongCatalog::load(dir.path(), false).unwrap();
        let ids: Vec<&str> = catalog.songs().iter().map(SongId::as_str).collect();
        assert_eq!(ids, vec!["rock/a.mp3", "rock/b.FLAC"]);
    }

    #[test]
    fn test_directory_without_audio_is_empty_catalog() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("art")).unwrap();
        std::fs::write(dir.path().join("art").join("cover.jpg"), b"x").unwrap();

        assert!(matches!(
            SongCatalog::load(dir.path(), false),
            Err(Error::EmptyCatalog)
        ));
    }

    #[test]
    fn test_load_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            SongCatalog::load(&dir.path().join("absent"), false),
            Err(Error::Catalog(_))
        ));
    }

    #[test]
    fn test_load_empty_directory_is_empty_catalog() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            SongCatalog::load(dir.path(), false),
            Err(Error::EmptyCatalog)
        ));
    }
}
