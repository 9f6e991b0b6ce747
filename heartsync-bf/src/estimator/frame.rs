//! Video frames and the spatial Gaussian pyramid
//!
//! Frames arrive as 8-bit interleaved RGB. The estimator only keeps the
//! coarsest pyramid level of each frame, which averages skin color over
//! large patches and suppresses sensor noise.

use crate::error::{Error, Result};

/// Number of color channels in a frame
pub const CHANNELS: usize = 3;

/// 5-tap binomial kernel used by the pyramid reduction (sums to 16)
const KERNEL: [f32; 5] = [1.0, 4.0, 6.0, 4.0, 1.0];
const KERNEL_SUM: f32 = 16.0;

/// One raw webcam frame (interleaved RGB, row-major)
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl Frame {
    /// Wrap raw RGB bytes; fails if the buffer size does not match the dimensions
    pub fn new(width: usize, height: usize, data: Vec<u8>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::Decode(format!(
                "Frame dimensions must be non-zero ({}x{})",
                width, height
            )));
        }
        let expected = width * height * CHANNELS;
        if data.len() != expected {
            return Err(Error::Decode(format!(
                "Frame buffer has {} bytes, expected {} for {}x{} RGB",
                data.len(),
                expected,
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Frame filled with a single color
    pub fn solid(width: usize, height: usize, rgb: [u8; 3]) -> Self {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take(width * height * CHANNELS)
            .collect();
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Raw interleaved RGB bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Floating-point image plane used inside the pyramid
#[derive(Debug, Clone, PartialEq)]
pub struct PyramidLevel {
    pub width: usize,
    pub height: usize,
    /// Interleaved RGB samples
    pub data: Vec<f32>,
}

impl PyramidLevel {
    fn from_frame(frame: &Frame) -> Self {
        Self {
            width: frame.width,
            height: frame.height,
            data: frame.data.iter().map(|&v| v as f32).collect(),
        }
    }

    fn at(&self, x: usize, y: usize, c: usize) -> f32 {
        self.data[(y * self.width + x) * CHANNELS + c]
    }
}

/// Mirror an out-of-range index back into `0..len`, not repeating the edge sample
fn reflect_101(index: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let last = len as isize - 1;
    let mut i = index;
    loop {
        if i < 0 {
            i = -i;
        } else if i > last {
            i = 2 * last - i;
        } else {
            return i as usize;
        }
    }
}

/// Blur with the 5x5 binomial kernel and drop every other row and column
///
/// Output size is `((w + 1) / 2, (h + 1) / 2)`.
pub fn pyr_down(level: &PyramidLevel) -> PyramidLevel {
    let out_w = (level.width + 1) / 2;
    let out_h = (level.height + 1) / 2;

    // Horizontal pass: out_w x height
    let mut horizontal = vec![0.0f32; out_w * level.height * CHANNELS];
    for y in 0..level.height {
        for ox in 0..out_w {
            for c in 0..CHANNELS {
                let mut acc = 0.0;
                for (k, weight) in KERNEL.iter().enumerate() {
                    let sx = reflect_101(2 * ox as isize + k as isize - 2, level.width);
                    acc += weight * level.at(sx, y, c);
                }
                horizontal[(y * out_w + ox) * CHANNELS + c] = acc / KERNEL_SUM;
            }
        }
    }

    // Vertical pass: out_w x out_h
    let mut data = vec![0.0f32; out_w * out_h * CHANNELS];
    for oy in 0..out_h {
        for x in 0..out_w {
            for c in 0..CHANNELS {
                let mut acc = 0.0;
                for (k, weight) in KERNEL.iter().enumerate() {
                    let sy = reflect_101(2 * oy as isize + k as isize - 2, level.height);
                    acc += weight * horizontal[(sy * out_w + x) * CHANNELS + c];
                }
                data[(oy * out_w + x) * CHANNELS + c] = acc / KERNEL_SUM;
            }
        }
    }

    PyramidLevel {
        width: out_w,
        height: out_h,
        data,
    }
}

/// Build a Gaussian pyramid with `levels` reductions (level 0 is the frame itself)
pub fn build_gaussian_pyramid(frame: &Frame, levels: usize) -> Vec<PyramidLevel> {
    let mut pyramid = Vec::with_capacity(levels + 1);
    let mut current = PyramidLevel::from_frame(frame);
    for _ in 0..levels {
        let next = pyr_down(&current);
        pyramid.push(std::mem::replace(&mut current, next));
    }
    pyramid.push(current);
    pyramid
}

/// Coarsest pyramid level of a frame, flattened: the per-frame signal vector
pub fn frame_signal(frame: &Frame, levels: usize) -> Vec<f32> {
    build_gaussian_pyramid(frame, levels)
        .pop()
        .map(|level| level.data)
        .unwrap_or_default()
}
