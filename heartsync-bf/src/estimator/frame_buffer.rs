//! Fixed-capacity rolling buffer of per-frame signals

use std::collections::VecDeque;

/// Rolling window of the most recent frame signals, oldest first
///
/// Once full, every push evicts the oldest entry. All entries share the
/// length of the first one pushed after construction or [`clear`](Self::clear).
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    capacity: usize,
    samples: VecDeque<Vec<f32>>,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a signal, evicting the oldest once at capacity
    ///
    /// Returns the evicted signal, if any.
    pub fn push(&mut self, signal: Vec<f32>) -> Option<Vec<f32>> {
        let evicted = if self.samples.len() >= self.capacity {
            self.samples.pop_front()
        } else {
            None
        };
        self.samples.push_back(signal);
        evicted
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.capacity
    }

    /// Length of each stored signal (0 when empty)
    pub fn signal_len(&self) -> usize {
        self.samples.front().map(Vec::len).unwrap_or(0)
    }

    /// Signals in time order, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &Vec<f32>> {
        self.samples.iter()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_starts_empty() {
        let buffer = FrameBuffer::new(3);
        assert!(buffer.is_empty());
        assert!(!buffer.is_full());
        assert_eq!(buffer.signal_len(), 0);
    }

    #[test]
    fn test_evicts_oldest_at_capacity() {
        let mut buffer = FrameBuffer::new(3);
        for i in 0..3 {
            assert!(buffer.push(vec![i as f32]).is_none());
        }
        assert!(buffer.is_full());

        let evicted = buffer.push(vec![3.0]);
        assert_eq!(evicted, Some(vec![0.0]));
        assert_eq!(buffer.len(), 3);

        let order: Vec<f32> = buffer.iter().map(|s| s[0]).collect();
        assert_eq!(order, vec![1.0, 2.0, 3.0]);
    }
}
