use std::collections::VecDeque;

/// Streaming simple moving average over the trailing `window` values.
///
/// Only the last `window` values are kept. The mean is re-summed on every
/// update, so each bar costs O(window) and the result does not depend on
/// how many values came before.
#[derive(Debug, Clone)]
pub struct SimpleMovingAverage {
    window: usize,
    values: VecDeque<f64>,
}

impl SimpleMovingAverage {
    pub fn new(window: usize) -> Self {
        assert!(window >= 1, "SMA window must be >= 1");
        Self {
            window,
            values: VecDeque::with_capacity(window),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Add a value. Returns the mean once `window` values have been seen.
    pub fn push(&mut self, value: f64) -> Option<f64> {
        if self.values.len() == self.window {
            self.values.pop_front();
        }
        self.values.push_back(value);
        self.value()
    }

    pub fn value(&self) -> Option<f64> {
        if self.values.len() < self.window {
            return None;
        }
        Some(self.values.iter().sum::<f64>() / self.window as f64)
    }
}

/// Batch SMA: `None` for indices before the window fills.
pub fn sma(values: &[f64], window: usize) -> Vec<Option<f64>> {
    let mut indicator = SimpleMovingAverage::new(window);
    values.iter().map(|&v| indicator.push(v)).collect()
}
