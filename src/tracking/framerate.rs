//! Rolling frame-rate estimate from frame timestamps.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Frame rate over the last `window` timestamps.
#[derive(Debug, Clone)]
pub struct FramerateTracker {
    window: usize,
    times: VecDeque<f64>,
}

impl FramerateTracker {
    pub fn new(window: usize) -> Self {
        let window = window.max(2);
        Self {
            window,
            times: VecDeque::with_capacity(window),
        }
    }

    /// Records a frame timestamp. Timestamps running backwards restart the
    /// estimate.
    pub fn tick(&mut self, t: f64) {
        if self.times.back().is_some_and(|&last| t < last) {
            self.times.clear();
        }
        if self.times.len() == self.window {
            self.times.pop_front();
        }
        self.times.push_back(t);
    }

    /// Frames per second, `None` until two distinct timestamps are seen.
    pub fn fps(&self) -> Option<f64> {
        let (first, last) = (self.times.front()?, self.times.back()?);
        let dt = last - first;
        (dt > 0.0).then(|| (self.times.len() - 1) as f64 / dt)
    }

    pub fn reset(&mut self) {
        self.times.clear();
    }
}

/// Latest frame rate, readable from any thread. Zero until known.
#[derive(Debug, Clone, Default)]
pub struct SharedFramerate(Arc<AtomicU64>);

impl SharedFramerate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, fps: f64) {
        self.0.store(fps.to_bits(), Ordering::Relaxed);
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}
