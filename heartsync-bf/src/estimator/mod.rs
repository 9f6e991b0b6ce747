//! Heart-rate estimation from a session's webcam frames

pub mod frame;
pub mod frame_buffer;
pub mod heart_rate;

pub use frame::Frame;
pub use frame_buffer::FrameBuffer;
pub use heart_rate::{spawn_estimator, HeartRateEstimator, HeartRateReading, SENTINEL_BPM};
