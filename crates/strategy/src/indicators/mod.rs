//! Indicator engine: fast/slow SMA of closes plus ATR.
//!
//! The streaming [`IndicatorEngine`] is the single implementation. The batch
//! [`compute`] used by backtests simply drives it, so historical and live
//! paths can never disagree on a value.

pub mod atr;
pub mod sma;

pub use atr::{true_range, AverageTrueRange};
pub use sma::{sma, SimpleMovingAverage};

use common::{Bar, Error, IndicatorSnapshot, Result, StrategyParams};

#[derive(Debug, Clone)]
pub struct IndicatorEngine {
    fast: SimpleMovingAverage,
    slow: SimpleMovingAverage,
    atr: AverageTrueRange,
    seen: usize,
}

impl IndicatorEngine {
    pub fn new(fast_window: usize, slow_window: usize, atr_window: usize) -> Self {
        Self {
            fast: SimpleMovingAverage::new(fast_window),
            slow: SimpleMovingAverage::new(slow_window),
            atr: AverageTrueRange::new(atr_window),
            seen: 0,
        }
    }

    pub fn from_params(params: &StrategyParams) -> Self {
        Self::new(params.fast_window, params.slow_window, params.atr_window)
    }

    /// Bars required before the first snapshot.
    pub fn warmup(&self) -> usize {
        self.fast
            .window()
            .max(self.slow.window())
            .max(self.atr.window())
    }

    /// Feed the next bar. During warm-up this returns
    /// `Error::InsufficientHistory`; the bar still counts towards warm-up.
    pub fn update(&mut self, bar: &Bar) -> Result<IndicatorSnapshot> {
        self.seen += 1;
        let fast = self.fast.push(bar.close);
        let slow = self.slow.push(bar.close);
        let atr = self.atr.push(bar);

        match (fast, slow, atr) {
            (Some(fast_sma), Some(slow_sma), Some(atr)) => Ok(IndicatorSnapshot {
                timestamp: bar.timestamp,
                close: bar.close,
                fast_sma,
                slow_sma,
                atr,
            }),
            _ => Err(Error::InsufficientHistory {
                have: self.seen,
                need: self.warmup(),
            }),
        }
    }
}

/// Snapshots for every bar past warm-up, in bar order.
///
/// The first snapshot belongs to `bars[max(fast, slow, atr) - 1]`.
pub fn compute(
    bars: &[Bar],
    fast_window: usize,
    slow_window: usize,
    atr_window: usize,
) -> Vec<IndicatorSnapshot> {
    let mut engine = IndicatorEngine::new(fast_window, slow_window, atr_window);
    bars.iter().filter_map(|bar| engine.update(bar).ok()).collect()
}
