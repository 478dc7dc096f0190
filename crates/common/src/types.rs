use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One OHLCV bar. Bars are immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

/// Bars ordered by strictly increasing timestamp.
///
/// Built wholesale for a backtest window, append-only while polling live.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BarSeries {
    bars: Vec<Bar>,
}

impl BarSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a series from bars already in time order. Fails on the first
    /// duplicate or out-of-order bar.
    pub fn from_bars(bars: impl IntoIterator<Item = Bar>) -> Result<Self> {
        let mut series = Self::new();
        for bar in bars {
            series.push(bar)?;
        }
        Ok(series)
    }

    /// Append a bar. Its timestamp must be later than the last bar's.
    pub fn push(&mut self, bar: Bar) -> Result<()> {
        if let Some(last) = self.bars.last() {
            if bar.timestamp <= last.timestamp {
                return Err(Error::OutOfOrderBar {
                    previous: last.timestamp,
                    got: bar.timestamp,
                });
            }
        }
        self.bars.push(bar);
        Ok(())
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn as_slice(&self) -> &[Bar] {
        &self.bars
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Bar> {
        self.bars.iter()
    }

    /// Drop all but the most recent `keep` bars. Indicators only ever look
    /// back a bounded number of bars, so a live loop trims to stay small.
    pub fn retain_last(&mut self, keep: usize) {
        if self.bars.len() > keep {
            let excess = self.bars.len() - keep;
            self.bars.drain(..excess);
        }
    }
}

impl<'a> IntoIterator for &'a BarSeries {
    type Item = &'a Bar;
    type IntoIter = std::slice::Iter<'a, Bar>;

    fn into_iter(self) -> Self::IntoIter {
        self.bars.iter()
    }
}

/// Indicator values for one bar, present only once every window is warm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub timestamp: DateTime<Utc>,
    /// Close of the bar the snapshot was computed on.
    pub close: f64,
    pub fast_sma: f64,
    pub slow_sma: f64,
    pub atr: f64,
}

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// Order side that opens a position in this direction.
    pub fn entry_order(self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "long"),
            Side::Short => write!(f, "short"),
        }
    }
}

/// Side of an order sent to a broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Which moving-average cross, if any, happened on a bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Crossover {
    /// Fast SMA crossed above the slow SMA.
    Golden,
    /// Fast SMA crossed below the slow SMA.
    Death,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    RiskHalt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum SignalKind {
    LongEntry,
    ShortEntry,
    Exit { reason: ExitReason },
    Hold,
}

impl SignalKind {
    pub fn is_entry(&self) -> bool {
        matches!(self, SignalKind::LongEntry | SignalKind::ShortEntry)
    }

    /// Direction of the position an entry signal asks for.
    pub fn entry_side(&self) -> Option<Side> {
        match self {
            SignalKind::LongEntry => Some(Side::Long),
            SignalKind::ShortEntry => Some(Side::Short),
            _ => None,
        }
    }
}

/// Discrete trade decision for one bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub timestamp: DateTime<Utc>,
    pub kind: SignalKind,
    pub crossover: Crossover,
}

impl Signal {
    pub fn hold(timestamp: DateTime<Utc>, crossover: Crossover) -> Self {
        Self {
            timestamp,
            kind: SignalKind::Hold,
            crossover,
        }
    }
}

/// Output of the position sizer. Only ever stored alongside the order it produced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionSizing {
    pub size: f64,
    pub stop_price: f64,
    pub risk_amount: f64,
}

/// Open position, as reported by the broker and mirrored locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub instrument: String,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    /// Protective stop attached to the position, if the broker knows one.
    pub stop_price: Option<f64>,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// P&L of closing the whole position at `price`.
    pub fn pnl_at(&self, price: f64) -> f64 {
        match self.side {
            Side::Long => (price - self.entry_price) * self.size,
            Side::Short => (self.entry_price - price) * self.size,
        }
    }

    /// True when `price` is at or through the protective stop.
    pub fn stop_breached(&self, price: f64) -> bool {
        match (self.side, self.stop_price) {
            (Side::Long, Some(stop)) => price <= stop,
            (Side::Short, Some(stop)) => price >= stop,
            (_, None) => false,
        }
    }
}

/// Broker confirmation for a submitted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub filled: bool,
    pub fill_price: f64,
    pub order_id: String,
    /// Filled quantity in instrument units.
    pub size: f64,
}

/// Daily risk bookkeeping owned by the risk governor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub trading_day: NaiveDate,
    pub day_start_equity: f64,
    pub realized_pnl_today: f64,
    pub trading_halted: bool,
}

/// Whether the broker adapter talks to a real account or a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Live,
    #[default]
    Paper,
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Live => write!(f, "live"),
            TradingMode::Paper => write!(f, "paper"),
        }
    }
}
