use std::collections::VecDeque;

/// Moving-average smoothing for vibration magnitudes.
/// Holds the last `window_size` values; the oldest is evicted on overflow.
#[derive(Clone, Debug)]
pub struct VibrationSmoother {
    window: VecDeque<f64>,
    window_size: usize,
}

impl VibrationSmoother {
    /// Create a new smoother with given window size (typically 10)
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        VibrationSmoother {
            window: VecDeque::with_capacity(window_size),
            window_size,
        }
    }

    /// Push a magnitude and return the average over the current window
    pub fn apply(&mut self, magnitude: f64) -> f64 {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(magnitude);

        self.average()
    }

    /// Average of the buffered values, 0.0 when empty
    pub fn average(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    /// Get current window size (actual, not max)
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// Check if window is empty
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }
}
