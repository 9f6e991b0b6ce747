//! Real-time heart-rate estimation from webcam frames
//!
//! Video magnification pipeline:
//! 1. Reduce each frame to its coarsest Gaussian pyramid level
//! 2. Keep the last `buffer_size` reductions in a [`FrameBuffer`]
//! 3. Once full, FFT every spatial sample along the time axis and keep only
//!    the physiological band (`min_hz..=max_hz`)
//! 4. The band bin with the largest spatially averaged magnitude is the
//!    instantaneous pulse; it is folded into an exponential moving average
//!
//! The published value starts at [`SENTINEL_BPM`] and does not move until the
//! buffer is full. [`HeartRateReading::is_warmed_up`] tracks the first update
//! separately, so a steady 60 BPM pulse still counts as a reading.

use std::sync::{Arc, Mutex, MutexGuard};

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::frame::{frame_signal, Frame};
use super::frame_buffer::FrameBuffer;
use crate::config::EstimatorConfig;
use crate::error::{Error, Result};

/// Initial published value, meaning "not warmed up yet"
pub const SENTINEL_BPM: f64 = 60.0;

/// Weight of the previous estimate in the moving average
pub const SMOOTHING_RETAIN: f64 = 0.95;

/// Weight of the instantaneous estimate in the moving average
pub const SMOOTHING_GAIN: f64 = 0.05;

#[derive(Debug, Clone, Copy)]
struct ReadingState {
    bpm: f64,
    /// Set by the first published estimate; the value alone cannot tell, since
    /// a real 60 BPM pulse equals the sentinel
    warmed_up: bool,
}

/// Latest smoothed heart rate, shared between the estimator and the decision worker
///
/// Every read and write takes the lock, so readers only ever observe
/// completed updates.
#[derive(Debug, Clone)]
pub struct HeartRateReading {
    state: Arc<Mutex<ReadingState>>,
}

impl Default for HeartRateReading {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartRateReading {
    /// New reading holding the sentinel
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ReadingState {
                bpm: SENTINEL_BPM,
                warmed_up: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReadingState> {
        // A panic while holding the lock cannot leave a torn state behind
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current smoothed BPM
    pub fn get(&self) -> f64 {
        self.lock().bpm
    }

    /// Overwrite the published value
    pub fn publish(&self, bpm: f64) {
        *self.lock() = ReadingState {
            bpm,
            warmed_up: true,
        };
    }

    /// Read-modify-write under a single lock acquisition; returns the new value
    pub fn update(&self, f: impl FnOnce(f64) -> f64) -> f64 {
        let mut guard = self.lock();
        guard.bpm = f(guard.bpm);
        guard.warmed_up = true;
        guard.bpm
    }

    /// True once at least one estimate has been published
    pub fn is_warmed_up(&self) -> bool {
        self.lock().warmed_up
    }
}

/// Per-session heart-rate estimator
pub struct HeartRateEstimator {
    config: EstimatorConfig,
    buffer: FrameBuffer,
    reading: HeartRateReading,
    fft: Arc<dyn Fft<f32>>,
    /// Frequency (Hz) of every FFT bin
    frequencies: Vec<f64>,
    /// Indices of the bins inside the physiological band
    band: Vec<usize>,
    frames_seen: u64,
}

impl HeartRateEstimator {
    /// Create an estimator publishing into `reading`
    ///
    /// Fails when the configuration leaves no FFT bin inside the band.
    pub fn new(config: EstimatorConfig, reading: HeartRateReading) -> Result<Self> {
        if config.buffer_size < 2 {
            return Err(Error::Config(format!(
                "estimator.buffer_size must be at least 2 (got {})",
                config.buffer_size
            )));
        }
        if config.fps <= 0.0 {
            return Err(Error::Config(format!(
                "estimator.fps must be positive (got {})",
                config.fps
            )));
        }

        let n = config.buffer_size;
        let frequencies: Vec<f64> = (0..n).map(|k| config.fps * k as f64 / n as f64).collect();
        let band: Vec<usize> = frequencies
            .iter()
            .enumerate()
            .filter(|(_, &f)| f >= config.min_hz && f <= config.max_hz)
            .map(|(k, _)| k)
            .collect();
        if band.is_empty() {
            return Err(Error::Config(format!(
                "No FFT bin between {} Hz and {} Hz with {} samples at {} fps",
                config.min_hz, config.max_hz, n, config.fps
            )));
        }

        let fft = FftPlanner::<f32>::new().plan_fft_forward(n);

        Ok(Self {
            buffer: FrameBuffer::new(n),
            reading,
            fft,
            frequencies,
            band,
            frames_seen: 0,
            config,
        })
    }

    /// Shared reading this estimator publishes into
    pub fn reading(&self) -> HeartRateReading {
        self.reading.clone()
    }

    /// Lowest and highest BPM the estimator can ever publish after warm-up
    pub fn bpm_range(&self) -> (f64, f64) {
        let lo = self.frequencies[self.band[0]] * 60.0;
        let hi = self.frequencies[self.band[self.band.len() - 1]] * 60.0;
        (lo.min(SENTINEL_BPM), hi.max(SENTINEL_BPM))
    }

    /// Feed one frame; returns the new smoothed estimate once the buffer is full
    pub fn process_frame(&mut self, frame: &Frame) -> Option<f64> {
        self.frames_seen += 1;
        let signal = frame_signal(frame, self.config.pyramid_levels + 1);

        if !self.buffer.is_empty() && signal.len() != self.buffer.signal_len() {
            warn!(
                expected = self.buffer.signal_len(),
                got = signal.len(),
                "Frame size changed, restarting heart-rate window"
            );
            self.buffer.clear();
        }

        self.buffer.push(signal);
        if !self.buffer.is_full() {
            trace!(
                buffered = self.buffer.len(),
                capacity = self.buffer.capacity(),
                "Heart-rate window filling"
            );
            return None;
        }

        let instant_bpm = self.instantaneous_bpm();
        let smoothed = self
            .reading
            .update(|prev| SMOOTHING_RETAIN * prev + SMOOTHING_GAIN * instant_bpm);
        debug!(instant_bpm, smoothed_bpm = smoothed, "Heart rate updated");
        Some(smoothed)
    }

    /// Dominant in-band frequency of the current window, in BPM
    fn instantaneous_bpm(&self) -> f64 {
        let n = self.buffer.len();
        let spatial = self.buffer.signal_len();
        let mut band_magnitude = vec![0.0f64; self.band.len()];
        let mut series = vec![Complex::new(0.0f32, 0.0); n];

        for s in 0..spatial {
            for (slot, signal) in series.iter_mut().zip(self.buffer.iter()) {
                *slot = Complex::new(signal[s], 0.0);
            }
            self.fft.process(&mut series);
            for (acc, &bin) in band_magnitude.iter_mut().zip(&self.band) {
                *acc += series[bin].norm() as f64;
            }
        }

        let best = band_magnitude
            .iter()
            .enumerate()
            .fold((0usize, f64::MIN), |best, (i, &m)| {
                if m > best.1 {
                    (i, m)
                } else {
                    best
                }
            })
            .0;

        60.0 * self.frequencies[self.band[best]]
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }
}

/// Run an estimator over a session's inbound frame channel
///
/// Frames are processed strictly in arrival order. The task itself only awaits
/// the channel; each frame's FFT runs on the blocking pool and the thread is
/// handed back as soon as that frame is done. The task ends when the channel
/// closes (all senders dropped) or `cancel` fires; cancellation is observed
/// between frames, never mid-computation.
pub fn spawn_estimator(
    session_id: u64,
    estimator: HeartRateEstimator,
    mut frames: UnboundedReceiver<Frame>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(session_id, "Heart-rate estimator started");
        let mut estimator = estimator;
        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                frame = frames.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            let processed = tokio::task::spawn_blocking(move || {
                estimator.process_frame(&frame);
                estimator
            })
            .await;
            match processed {
                Ok(returned) => estimator = returned,
                Err(e) => {
                    error!(session_id, error = %e, "Heart-rate frame processing aborted");
                    return;
                }
            }
        }
        info!(
            session_id,
            frames = estimator.frames_seen(),
            final_bpm = estimator.reading().get(),
            "Heart-rate estimator stopped"
        );
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn small_config() -> EstimatorConfig {
        EstimatorConfig {
            frame_width: 16,
            frame_height: 16,
            pyramid_levels: 1,
            buffer_size: 150,
            fps: 10.0,
            min_hz: 0.8,
            max_hz: 2.5,
        }
    }

    /// Frame whose brightness oscillates at `hz` when sampled at 10 fps
    fn pulsing_frame(index: usize, hz: f64) -> Frame {
        let t = index as f64 / 10.0;
        let level = (128.0 + 40.0 * (2.0 * PI * hz * t).sin()).round() as u8;
        Frame::solid(16, 16, [level, level, level])
    }

    #[test]
    fn test_sentinel_until_buffer_full() {
        let reading = HeartRateReading::new();
        let mut estimator = HeartRateEstimator::new(small_config(), reading.clone()).unwrap();

        for i in 0..149 {
            assert!(estimator.process_frame(&pulsing_frame(i, 1.2)).is_none());
            assert_eq!(reading.get(), SENTINEL_BPM);
            assert!(!reading.is_warmed_up());
        }

        assert!(estimator.process_frame(&pulsing_frame(149, 1.2)).is_some());
        assert!(reading.is_warmed_up());
    }

    #[test]
    fn test_detects_dominant_frequency() {
        let reading = HeartRateReading::new();
        let mut estimator = HeartRateEstimator::new(small_config(), reading.clone()).unwrap();

        for i in 0..150 {
            estimator.process_frame(&pulsing_frame(i, 1.2));
        }
        // 1.2 Hz = 72 BPM, smoothed one step away from the 60 BPM start
        let expected = SMOOTHING_RETAIN * SENTINEL_BPM + SMOOTHING_GAIN * 72.0;
        assert!((reading.get() - expected).abs() < 1e-6, "got {}", reading.get());

        for i in 150..600 {
            estimator.process_frame(&pulsing_frame(i, 1.2));
        }
        assert!((reading.get() - 72.0).abs() < 1.0, "got {}", reading.get());
    }

    #[test]
    fn test_pulse_at_sentinel_rate_counts_as_warmed_up() {
        let reading = HeartRateReading::new();
        let mut estimator = HeartRateEstimator::new(small_config(), reading.clone()).unwrap();

        // 1.0 Hz lands exactly on bin 15 of 150, so every update folds in 60 BPM
        for i in 0..600 {
            estimator.process_frame(&pulsing_frame(i, 1.0));
        }
        assert!((reading.get() - SENTINEL_BPM).abs() < 1e-9, "got {}", reading.get());
        assert!(reading.is_warmed_up());
    }

    #[test]
    fn test_publish_marks_reading_warmed_up() {
        let reading = HeartRateReading::new();
        assert!(!reading.is_warmed_up());
        reading.publish(SENTINEL_BPM);
        assert!(reading.is_warmed_up());
        assert_eq!(reading.get(), SENTINEL_BPM);
    }

    #[test]
    fn test_published_value_stays_in_band() {
        let reading = HeartRateReading::new();
        let mut estimator = HeartRateEstimator::new(small_config(), reading.clone()).unwrap();
        let (lo, hi) = estimator.bpm_range();

        // Flat frames carry no pulse at all; the estimate must still stay in band
        for i in 0..400 {
            let frame = if i % 2 == 0 {
                Frame::solid(16, 16, [90, 90, 90])
            } else {
                pulsing_frame(i, 4.0)
            };
            if let Some(bpm) = estimator.process_frame(&frame) {
                assert!(bpm >= lo && bpm <= hi, "{} outside [{}, {}]", bpm, lo, hi);
            }
        }
        assert!(lo >= 48.0 && hi <= 150.0);
    }

    #[test]
    fn test_rejects_empty_band() {
        let mut config = small_config();
        config.min_hz = 6.0;
        config.max_hz = 7.0;
        config.fps = 10.0;
        config.buffer_size = 4;
        assert!(HeartRateEstimator::new(config, HeartRateReading::new()).is_err());
    }

    #[tokio::test]
    async fn test_spawned_estimator_stops_when_channel_closes() {
        let reading = HeartRateReading::new();
        let estimator = HeartRateEstimator::new(small_config(), reading.clone()).unwrap();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        let handle = spawn_estimator(1, estimator, rx, CancellationToken::new());
        for i in 0..150 {
            tx.send(pulsing_frame(i, 1.5)).unwrap();
        }
        drop(tx);

        handle.await.unwrap();
        assert!(reading.is_warmed_up());
    }

    #[tokio::test]
    async fn test_spawned_estimator_stops_on_cancel() {
        let reading = HeartRateReading::new();
        let estimator = HeartRateEstimator::new(small_config(), reading.clone()).unwrap();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Frame>();
        let cancel = CancellationToken::new();

        let handle = spawn_estimator(2, estimator, rx, cancel.clone());
        tx.send(pulsing_frame(0, 1.5)).unwrap();
        cancel.cancel();

        // The sender is still alive, so only the token can end the task
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("estimator ignored cancellation")
            .unwrap();
        assert!(!reading.is_warmed_up());
    }

    #[test]
    fn test_idle_estimators_do_not_hold_blocking_threads() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .max_blocking_threads(1)
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let mut senders = Vec::new();
            for id in 0..4 {
                let estimator =
                    HeartRateEstimator::new(small_config(), HeartRateReading::new()).unwrap();
                let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Frame>();
                spawn_estimator(id, estimator, rx, CancellationToken::new());
                senders.push(tx);
            }

            // Four parked estimators and a single blocking thread still leave room
            let blocking = tokio::task::spawn_blocking(|| 7);
            let result = tokio::time::timeout(std::time::Duration::from_secs(3), blocking)
                .await
                .expect("blocking pool exhausted by idle estimators")
                .unwrap();
            assert_eq!(result, 7);
            drop(senders);
        });
    }
}
