use common::Bar;

use super::sma::SimpleMovingAverage;

/// True range of a bar given the previous close.
/// Without a previous close it is just `high - low`.
pub fn true_range(bar: &Bar, prev_close: Option<f64>) -> f64 {
    let high_low = bar.high - bar.low;
    match prev_close {
        Some(pc) => high_low.max((bar.high - pc).abs()).max((bar.low - pc).abs()),
        None => high_low,
    }
}

/// Average True Range: simple mean of the trailing `window` true ranges.
///
/// Plain SMA smoothing, not Wilder's. Backtest and live both go through
/// this type, so they always agree on the value.
#[derive(Debug, Clone)]
pub struct AverageTrueRange {
    prev_close: Option<f64>,
    ranges: SimpleMovingAverage,
}

impl AverageTrueRange {
    pub fn new(window: usize) -> Self {
        assert!(window >= 1, "ATR window must be >= 1");
        Self {
            prev_close: None,
            ranges: SimpleMovingAverage::new(window),
        }
    }

    pub fn window(&self) -> usize {
        self.ranges.window()
    }

    /// Add a bar. Returns the ATR once `window` true ranges exist.
    pub fn push(&mut self, bar: &Bar) -> Option<f64> {
        let tr = true_range(bar, self.prev_close);
        self.prev_close = Some(bar.close);
        self.ranges.push(tr)
    }
}
