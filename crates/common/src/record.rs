use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Bar, OrderResult, OrderSide, PositionSizing, RiskState, Signal};

/// What happened to the decision taken on a bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Bar ingested but no decision possible (warm-up, duplicate bar).
    Skipped,
    Hold,
    Executed,
    /// Orders decided on this bar fill at the next bar's open (backtest).
    Pending,
    /// Entry blocked by the risk governor.
    Suppressed,
    InvalidSizing,
    /// Broker refused the order.
    Rejected,
    /// Retries exhausted; the decision was abandoned.
    Missed,
    /// An order whose fate could not be confirmed.
    Unconfirmed,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderAction {
    Open,
    Close,
}

/// One order attempt and its result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub action: OrderAction,
    pub side: OrderSide,
    pub size: f64,
    pub result: Option<OrderResult>,
    /// Realized P&L booked by this fill, if it closed a position.
    pub realized_pnl: Option<f64>,
    pub error: Option<String>,
}

/// Append-only log sink row, one per processed bar (plus shutdown notes).
///
/// Replaying the `equity` and every `realized_pnl` through the risk
/// governor reproduces `risk_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub timestamp: DateTime<Utc>,
    pub instrument: String,
    pub bar: Option<Bar>,
    /// Equity observed at the start of the bar, used for day rollover.
    pub equity: f64,
    /// Set when the broker balance could not be read for this bar: `equity`
    /// is carried over and the bar did not roll the trading day.
    #[serde(default)]
    pub equity_stale: bool,
    pub signal: Option<Signal>,
    pub sizing: Option<PositionSizing>,
    #[serde(default)]
    pub orders: Vec<OrderRecord>,
    pub outcome: Outcome,
    pub note: Option<String>,
    #[serde(default)]
    pub unrealized_pnl: f64,
    pub risk_state: Option<RiskState>,
}

impl JournalRecord {
    pub fn new(timestamp: DateTime<Utc>, instrument: impl Into<String>, equity: f64) -> Self {
        Self {
            timestamp,
            instrument: instrument.into(),
            bar: None,
            equity,
            equity_stale: false,
            signal: None,
            sizing: None,
            orders: Vec::new(),
            outcome: Outcome::Skipped,
            note: None,
            unrealized_pnl: 0.0,
            risk_state: None,
        }
    }

    /// Whether replay should roll the trading day on this record.
    pub fn rolls_day(&self) -> bool {
        self.bar.is_some() && !self.equity_stale
    }

    /// Realized P&L booked on this record, in fill order.
    pub fn realized_fills(&self) -> impl Iterator<Item = f64> + '_ {
        self.orders.iter().filter_map(|o| o.realized_pnl)
    }

    /// Attach a reason, keeping any earlier one.
    pub fn note(&mut self, text: impl Into<String>) {
        let text = text.into();
        self.note = Some(match self.note.take() {
            Some(prev) => format!("{prev}; {text}"),
            None => text,
        });
    }
}
