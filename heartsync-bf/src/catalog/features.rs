//! Song features: tempo and chroma fingerprint
//!
//! Tempo comes from the file's BPM tag when one is present. Otherwise it is
//! estimated from the decoded audio: a spectral-flux onset envelope is
//! autocorrelated and the strongest lag between 30 and 300 BPM wins.
//!
//! The chroma matrix folds the short-time spectrum of the first
//! `duration_seconds` of audio onto 12 pitch classes (C..B), normalizes each
//! frame to its loudest class and scales to `u8`. Zero rows are added above
//! and below so the matrix has `12 + chroma_padding` rows.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use lofty::prelude::*;
use lofty::probe::Probe;
use lofty::tag::ItemKey;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

use super::SongId;
use crate::config::{CatalogConfig, EpisodeConfig};
use crate::error::{Error, Result};

/// Pitch classes per chroma frame
pub const PITCH_CLASSES: usize = 12;

const MIN_TEMPO_BPM: f64 = 30.0;
const MAX_TEMPO_BPM: f64 = 300.0;
const MIN_PITCH_HZ: f64 = 32.7;
const MAX_PITCH_HZ: f64 = 5000.0;

/// Row-major `u8` matrix (pitch rows x time frames)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChromaMatrix {
    rows: usize,
    cols: usize,
    data: Vec<u8>,
}

impl ChromaMatrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0; rows * cols],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, row: usize, col: usize) -> u8 {
        self.data[row * self.cols + col]
    }

    fn set(&mut self, row: usize, col: usize, value: u8) {
        self.data[row * self.cols + col] = value;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Copy with `padding` zero rows, `padding / 2` on top and the rest below
    pub fn padded(&self, padding: usize) -> Self {
        let top = padding / 2;
        let mut out = Self::zeros(self.rows + padding, self.cols);
        let start = top * self.cols;
        out.data[start..start + self.data.len()].copy_from_slice(&self.data);
        out
    }
}

/// Features attached to a song choice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SongFeatures {
    /// Tempo in BPM
    pub bpm: u32,
    /// Padded chroma fingerprint
    pub chroma: ChromaMatrix,
}

/// Computes the features of one song
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, song: &SongId) -> Result<SongFeatures>;
}

/// Analysis window parameters
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureParams {
    /// Seconds of audio analysed from the start of the song
    pub duration_seconds: f64,
    /// Reference sample rate `hop_length` is expressed in
    pub sampling_rate: u32,
    pub hop_length: usize,
    pub chroma_padding: usize,
}

impl FeatureParams {
    pub fn from_config(episode: &EpisodeConfig, catalog: &CatalogConfig) -> Self {
        Self {
            duration_seconds: episode.song_duration_seconds,
            sampling_rate: catalog.sampling_rate,
            hop_length: catalog.hop_length,
            chroma_padding: catalog.chroma_padding,
        }
    }

    /// Chroma frames per song, independent of the file's own sample rate
    pub fn chroma_frames(&self) -> usize {
        (self.duration_seconds * self.sampling_rate as f64 / self.hop_length as f64).ceil() as usize
    }

    /// Hop length in samples at `native_rate`
    fn native_hop(&self, native_rate: u32) -> usize {
        let hop = self.hop_length as f64 * native_rate as f64 / self.sampling_rate as f64;
        (hop.round() as usize).max(1)
    }
}

/// Extractor reading audio files below the song directory
pub struct AudioFeatureExtractor {
    song_directory: PathBuf,
    params: FeatureParams,
}

impl AudioFeatureExtractor {
    pub fn new(song_directory: impl Into<PathBuf>, params: FeatureParams) -> Self {
        Self {
            song_directory: song_directory.into(),
            params,
        }
    }

    pub fn song_path(&self, song: &SongId) -> PathBuf {
        self.song_directory.join(song.as_str())
    }
}

impl FeatureExtractor for AudioFeatureExtractor {
    fn extract(&self, song: &SongId) -> Result<SongFeatures> {
        let path = self.song_path(song);
        let (samples, rate) = decode_mono(&path, self.params.duration_seconds)?;

        let hop = self.params.native_hop(rate);
        let spectrogram = Spectrogram::compute(&samples, rate, hop, self.params.chroma_frames());

        let bpm = match read_tag_bpm(&path) {
            Some(bpm) => bpm,
            None => {
                let onset_rate = rate as f64 / hop as f64;
                match estimate_tempo(&spectrogram.onset_envelope(), onset_rate) {
                    Some(bpm) => bpm.round() as u32,
                    None => {
                        warn!(song = %song, "No tempo found in audio, using 0 BPM");
                        0
                    }
                }
            }
        };

        let chroma = spectrogram.chroma().padded(self.params.chroma_padding);
        debug!(
            song = %song,
            bpm,
            sample_rate = rate,
            frames = chroma.cols(),
            "Song features computed"
        );

        Ok(SongFeatures { bpm, chroma })
    }
}

/// Tempo from the file's BPM tag, if any
pub fn read_tag_bpm(path: &Path) -> Option<u32> {
    let tagged_file = match Probe::open(path).and_then(|probe| probe.read()) {
        Ok(file) => file,
        Err(e) => {
            debug!(file = %path.display(), error = %e, "No readable tags");
            return None;
        }
    };

    let tag = tagged_file.primary_tag().or_else(|| tagged_file.first_tag())?;
    let value = tag
        .get_string(&ItemKey::Bpm)
        .or_else(|| tag.get_string(&ItemKey::IntegerBpm))?;

    match value.trim().parse::<f64>() {
        Ok(bpm) if bpm > 0.0 => Some(bpm.round() as u32),
        _ => {
            warn!(file = %path.display(), value, "Ignoring malformed BPM tag");
            None
        }
    }
}

/// Decode the first `seconds` of a file, averaged to mono
///
/// Returns the samples and the file's native sample rate.
pub fn decode_mono(path: &Path, seconds: f64) -> Result<(Vec<f32>, u32)> {
    let features_err = |what: &str, e: &dyn std::fmt::Display| {
        Error::Features(format!("{}: {} ({})", what, path.display(), e))
    };

    let file = std::fs::File::open(path).map_err(|e| features_err("Cannot open song", &e))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| features_err("Unsupported audio format", &e))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| Error::Features(format!("No audio track in {}", path.display())))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let rate = codec_params
        .sample_rate
        .ok_or_else(|| Error::Features(format!("Unknown sample rate in {}", path.display())))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| features_err("No decoder", &e))?;

    let wanted = (seconds.max(0.0) * rate as f64).ceil() as usize;
    let mut mono = Vec::with_capacity(wanted);

    while mono.len() < wanted {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(features_err("Cannot read packet", &e)),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                debug!(file = %path.display(), error = e, "Skipping undecodable packet");
                continue;
            }
            Err(e) => return Err(features_err("Decode failed", &e)),
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count().max(1);
        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);

        for frame in buffer.samples().chunks(channels) {
            mono.push(frame.iter().sum::<f32>() / channels as f32);
        }
    }

    mono.truncate(wanted);
    Ok((mono, rate))
}

/// Power spectra of centered, Hann-windowed frames
struct Spectrogram {
    rate: u32,
    n_fft: usize,
    /// One power spectrum (bins `0..=n_fft/2`) per frame
    frames: Vec<Vec<f64>>,
}

impl Spectrogram {
    fn compute(samples: &[f32], rate: u32, hop: usize, frame_count: usize) -> Self {
        let n_fft = (hop * 4).next_power_of_two();
        let half = n_fft / 2;
        let fft = FftPlanner::<f64>::new().plan_fft_forward(n_fft);
        let window: Vec<f64> = (0..n_fft)
            .map(|i| 0.5 - 0.5 * (2.0 * std::f64::consts::PI * i as f64 / n_fft as f64).cos())
            .collect();

        let mut buffer = vec![Complex::new(0.0, 0.0); n_fft];
        let mut frames = Vec::with_capacity(frame_count);

        for f in 0..frame_count {
            let center = f * hop;
            for (i, slot) in buffer.iter_mut().enumerate() {
                let sample = (center + i)
                    .checked_sub(half)
                    .and_then(|idx| samples.get(idx))
                    .copied()
                    .unwrap_or(0.0);
                *slot = Complex::new(sample as f64 * window[i], 0.0);
            }
            fft.process(&mut buffer);
            frames.push(buffer[..=half].iter().map(|c| c.norm_sqr()).collect());
        }

        Self {
            rate,
            n_fft,
            frames,
        }
    }

    /// Spectral flux of the log-magnitude spectrum, one value per frame
    fn onset_envelope(&self) -> Vec<f64> {
        let log_frames: Vec<Vec<f64>> = self
            .frames
            .iter()
            .map(|power| power.iter().map(|p| (1.0 + p.sqrt()).ln()).collect())
            .collect();

        let mut envelope = Vec::with_capacity(log_frames.len());
        envelope.push(0.0);
        for pair in log_frames.windows(2) {
            let flux = pair[1]
                .iter()
                .zip(&pair[0])
                .map(|(now, prev)| (now - prev).max(0.0))
                .sum::<f64>();
            envelope.push(flux);
        }
        envelope
    }

    fn chroma(&self) -> ChromaMatrix {
        let bin_class: Vec<Option<usize>> = (0..=self.n_fft / 2)
            .map(|k| pitch_class(k as f64 * self.rate as f64 / self.n_fft as f64))
            .collect();

        let mut chroma = ChromaMatrix::zeros(PITCH_CLASSES, self.frames.len());
        for (col, power) in self.frames.iter().enumerate() {
            let mut energy = [0.0f64; PITCH_CLASSES];
            for (p, class) in power.iter().zip(&bin_class) {
                if let Some(class) = class {
                    energy[*class] += p;
                }
            }

            let peak = energy.iter().cloned().fold(0.0, f64::max);
            if peak <= f64::EPSILON {
                continue;
            }
            for (row, e) in energy.iter().enumerate() {
                chroma.set(row, col, (e / peak * 255.0).round() as u8);
            }
        }
        chroma
    }
}

/// Pitch class (0 = C) of a frequency inside the analysed range
fn pitch_class(hz: f64) -> Option<usize> {
    if !(MIN_PITCH_HZ..=MAX_PITCH_HZ).contains(&hz) {
        return None;
    }
    let midi = (12.0 * (hz / 440.0).log2() + 69.0).round() as i64;
    Some(midi.rem_euclid(PITCH_CLASSES as i64) as usize)
}

/// Dominant tempo of an onset envelope sampled at `onset_rate` Hz
///
/// Returns `None` for silent or too-short input.
pub fn estimate_tempo(envelope: &[f64], onset_rate: f64) -> Option<f64> {
    let min_lag = ((60.0 / MAX_TEMPO_BPM) * onset_rate).round().max(1.0) as usize;
    let max_lag = ((60.0 / MIN_TEMPO_BPM) * onset_rate).round() as usize;
    let max_lag = max_lag.min(envelope.len().saturating_sub(1));
    if min_lag >= max_lag {
        return None;
    }

    let mean = envelope.iter().sum::<f64>() / envelope.len() as f64;
    let centered: Vec<f64> = envelope.iter().map(|v| v - mean).collect();
    let acf = |lag: usize| -> f64 {
        centered[lag..]
            .iter()
            .zip(&centered)
            .map(|(a, b)| a * b)
            .sum()
    };

    let energy = acf(0);
    if energy <= f64::EPSILON {
        return None;
    }

    let (peak_lag, peak) = (min_lag..=max_lag)
        .map(|lag| (lag, acf(lag) / energy))
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))?;
    if peak <= 0.0 {
        return None;
    }

    Some(60.0 * onset_rate / peak_lag as f64)
}

/// Process-wide memo of song features
///
/// Extraction runs outside the lock; two sessions racing on the same
/// uncached song both compute it and the first insert wins.
pub struct SongFeatureCache {
    extractor: Arc<dyn FeatureExtractor>,
    cache: Mutex<HashMap<SongId, Arc<SongFeatures>>>,
}

impl SongFeatureCache {
    pub fn new(extractor: Arc<dyn FeatureExtractor>) -> Self {
        Self {
            extractor,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Features of `song`, computed on first access
    pub fn get(&self, song: &SongId) -> Result<Arc<SongFeatures>> {
        if let Some(features) = self.lock().get(song) {
            return Ok(Arc::clone(features));
        }

        let features = Arc::new(self.extractor.extract(song)?);
        Ok(Arc::clone(
            self.lock().entry(song.clone()).or_insert(features),
        ))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SongId, Arc<SongFeatures>>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
