//! Experience log: one row per decision step
//!
//! File layout (`experience_log.csv`):
//!
//! ```text
//! #{"max_song_bpm":300,"max_heart_bpm":300,"goal_heart_bpm":60,...}
//! heart_bpm,song_file,a,r,next_heart_bpm,next_song_file,terminated,truncated
//! 72,"rock/a.mp3",0,-3,75,"salsa/b.mp3",false,false
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::Action;
use crate::config::{CatalogConfig, EpisodeConfig};
use crate::error::{Error, Result};

/// File name inside the session directory
pub const EXPERIENCE_LOG_FILE: &str = "experience_log.csv";

/// Column header line
pub const EXPERIENCE_LOG_COLUMNS: &str =
    "heart_bpm,song_file,a,r,next_heart_bpm,next_song_file,terminated,truncated";

/// Episode configuration recorded on the first line of the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperienceHeader {
    pub max_song_bpm: u32,
    pub max_heart_bpm: u32,
    pub goal_heart_bpm: u32,
    pub max_steps: u32,
    pub songs_per_episode: u32,
    pub song_duration_seconds: f64,
    pub sampling_rate: u32,
    pub hop_length: usize,
}

impl ExperienceHeader {
    pub fn from_config(episode: &EpisodeConfig, catalog: &CatalogConfig) -> Self {
        Self {
            max_song_bpm: episode.max_song_bpm,
            max_heart_bpm: episode.max_heart_bpm,
            goal_heart_bpm: episode.goal_heart_bpm,
            max_steps: episode.max_steps,
            songs_per_episode: episode.songs_per_episode,
            song_duration_seconds: episode.song_duration_seconds,
            sampling_rate: catalog.sampling_rate,
            hop_length: catalog.hop_length,
        }
    }
}

/// One (state, action, reward, next state) transition
#[derive(Debug, Clone, PartialEq)]
pub struct ExperienceEntry {
    pub heart_bpm: u32,
    pub song_file: String,
    pub action: Action,
    pub reward: f64,
    pub next_heart_bpm: u32,
    pub next_song_file: String,
    pub terminated: bool,
    pub truncated: bool,
}

impl ExperienceEntry {
    fn to_row(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{}",
            self.heart_bpm,
            quote(&self.song_file),
            self.action.index(),
            self.reward,
            self.next_heart_bpm,
            quote(&self.next_song_file),
            self.terminated,
            self.truncated
        )
    }

    fn parse_row(line: &str, line_no: usize) -> Result<Self> {
        let bad = |what: &str| Error::Decode(format!("experience log line {}: {}", line_no, what));

        let fields = split_row(line);
        if fields.len() != 8 {
            return Err(bad(&format!("expected 8 fields, found {}", fields.len())));
        }

        let int = |i: usize| fields[i].trim().parse::<u32>().map_err(|_| bad(&fields[i]));
        let flag = |i: usize| match fields[i].trim().to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(bad(&fields[i])),
        };

        let action = fields[2]
            .trim()
            .parse::<u8>()
            .ok()
            .and_then(Action::from_index)
            .ok_or_else(|| bad(&fields[2]))?;
        let reward = fields[3].trim().parse::<f64>().map_err(|_| bad(&fields[3]))?;

        Ok(Self {
            heart_bpm: int(0)?,
            song_file: fields[1].clone(),
            action,
            reward,
            next_heart_bpm: int(4)?,
            next_song_file: fields[5].clone(),
            terminated: flag(6)?,
            truncated: flag(7)?,
        })
    }
}

/// Ordered, append-only log of one session's transitions
#[derive(Debug, Clone)]
pub struct ExperienceLog {
    header: ExperienceHeader,
    entries: Vec<ExperienceEntry>,
}

impl ExperienceLog {
    pub fn new(header: ExperienceHeader) -> Self {
        Self {
            header,
            entries: Vec::new(),
        }
    }

    pub fn record(&mut self, entry: ExperienceEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[ExperienceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn header(&self) -> &ExperienceHeader {
        &self.header
    }

    /// Full file contents
    pub fn render(&self) -> Result<String> {
        let mut out = format!("#{}\n{}\n", serde_json::to_string(&self.header)?, EXPERIENCE_LOG_COLUMNS);
        for entry in &self.entries {
            out.push_str(&entry.to_row());
            out.push('\n');
        }
        Ok(out)
    }

    /// Write the log to `path`, replacing any previous file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.render()?)?;
        info!(path = %path.display(), rows = self.entries.len(), "Experience log saved");
        Ok(())
    }
}

/// Parse an experience log file back into entries
///
/// `#` lines and the column header are skipped.
pub fn read_experience_log(path: &Path) -> Result<Vec<ExperienceEntry>> {
    let contents = std::fs::read_to_string(path)?;
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            !line.trim().is_empty() && !line.starts_with('#') && *line != EXPERIENCE_LOG_COLUMNS
        })
        .map(|(i, line)| ExperienceEntry::parse_row(line, i + 1))
        .collect()
}

/// Configuration header of an experience log file, if present
pub fn read_experience_header(path: &Path) -> Result<Option<ExperienceHeader>> {
    let contents = std::fs::read_to_string(path)?;
    match contents.lines().next().and_then(|line| line.strip_prefix('#')) {
        Some(json) => Ok(Some(serde_json::from_str(json)?)),
        None => Ok(None),
    }
}

fn quote(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}

fn split_row(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn header() -> ExperienceHeader {
        ExperienceHeader::from_config(&EpisodeConfig::default(), &CatalogConfig::default())
    }

    fn entry(heart: u32, action: Action, reward: f64) -> ExperienceEntry {
        ExperienceEntry {
            heart_bpm: heart,
            song_file: "rock/a, live.mp3".to_string(),
            action,
            reward,
            next_heart_bpm: heart + 2,
            next_song_file: "jazz/\"b\".mp3".to_string(),
            terminated: false,
            truncated: reward == -1000.0,
        }
    }

    #[test]
    fn test_render_layout() {
        let mut log = ExperienceLog::new(header());
        log.record(entry(72, Action::Accept, -2.0));

        let text = log.render().unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("#{\"max_song_bpm\":300"));
        assert_eq!(lines[1], EXPERIENCE_LOG_COLUMNS);
        assert_eq!(
            lines[2],
            "72,\"rock/a, live.mp3\",0,-2,74,\"jazz/\"\"b\"\".mp3\",false,false"
        );
    }

    #[test]
    fn test_saved_log_reads_back_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session").join(EXPERIENCE_LOG_FILE);

        let mut log = ExperienceLog::new(header());
        log.record(entry(72, Action::Accept, -2.0));
        log.record(entry(80, Action::Reject, 0.0));
        log.record(entry(65, Action::Accept, -1000.0));
        log.save(&path).unwrap();

        let entries = read_experience_log(&path).unwrap();
        assert_eq!(entries, log.entries());
        assert_eq!(read_experience_header(&path).unwrap(), Some(header()));
    }

    #[test]
    fn test_accepts_capitalized_flags() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(EXPERIENCE_LOG_FILE);
        std::fs::write(
            &path,
            format!("{}\n60,\"start\",0,-4,64,\"pop/x.mp3\",False,True\n", EXPERIENCE_LOG_COLUMNS),
        )
        .unwrap();

        let entries = read_experience_log(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].truncated);
        assert_eq!(entries[0].reward, -4.0);
    }

    #[test]
    fn test_rejects_short_row() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(EXPERIENCE_LOG_FILE);
        std::fs::write(&path, "60,\"a\",0\n").unwrap();
        assert!(matches!(read_experience_log(&path), Err(Error::Decode(_))));
    }
}
