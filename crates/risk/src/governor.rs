use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use common::{
    DayBoundary, Error, ExitReason, JournalRecord, Position, Result, RiskParams, RiskState,
    Signal, SignalKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GovernorStatus {
    Active,
    Halted,
}

/// Daily drawdown circuit breaker and the gate in front of every entry order.
///
/// Goes `Active -> Halted` when realized P&L for the day reaches
/// `-(day_start_equity * max_daily_drawdown)`. Only a day rollover goes back
/// to `Active`; winning fills later the same day do not.
#[derive(Debug, Clone)]
pub struct RiskGovernor {
    max_daily_drawdown: f64,
    day_boundary: DayBoundary,
    state: Option<RiskState>,
    unrealized_pnl: f64,
}

impl RiskGovernor {
    pub fn new(params: &RiskParams) -> Self {
        Self {
            max_daily_drawdown: params.max_daily_drawdown,
            day_boundary: params.day_boundary,
            state: None,
            unrealized_pnl: 0.0,
        }
    }

    /// Current state, `None` before the first bar.
    pub fn state(&self) -> Option<RiskState> {
        self.state
    }

    pub fn status(&self) -> GovernorStatus {
        if self.is_halted() {
            GovernorStatus::Halted
        } else {
            GovernorStatus::Active
        }
    }

    pub fn is_halted(&self) -> bool {
        self.state.is_some_and(|s| s.trading_halted)
    }

    /// Realized loss for the day that triggers the halt (a negative number).
    pub fn halt_threshold(&self) -> Option<f64> {
        self.state
            .map(|s| -(s.day_start_equity * self.max_daily_drawdown))
    }

    /// Start a new trading day if `timestamp` falls after the current one.
    /// Returns `true` on rollover.
    pub fn roll_day(&mut self, timestamp: DateTime<Utc>, equity: f64) -> bool {
        let day = self.day_boundary.trading_day(timestamp);
        if let Some(state) = &self.state {
            if day <= state.trading_day {
                return false;
            }
        }

        if self.is_halted() {
            info!(%day, "New trading day, clearing drawdown halt");
        }
        self.state = Some(RiskState {
            trading_day: day,
            day_start_equity: equity,
            realized_pnl_today: 0.0,
            trading_halted: false,
        });
        info!(%day, equity = equity, "Trading day started");
        true
    }

    /// Book realized P&L from a fill and halt if the daily limit is reached.
    pub fn record_fill(&mut self, realized_pnl: f64) -> GovernorStatus {
        let max_dd = self.max_daily_drawdown;
        let Some(state) = self.state.as_mut() else {
            warn!(realized_pnl, "Fill recorded before any trading day started, ignored");
            return GovernorStatus::Active;
        };

        state.realized_pnl_today += realized_pnl;
        let threshold = -(state.day_start_equity * max_dd);

        if !state.trading_halted && state.realized_pnl_today <= threshold {
            state.trading_halted = true;
            warn!(
                realized_pnl_today = state.realized_pnl_today,
                threshold = threshold,
                "Max daily drawdown reached, halting new entries until next trading day"
            );
        }
        self.status()
    }

    /// Apply the halt to a generator signal.
    ///
    /// While halted an open position is always flattened and nothing new
    /// opens. Stop-loss exits pass through unchanged.
    pub fn gate(&self, signal: Signal, position: Option<&Position>) -> Signal {
        if !self.is_halted() {
            return signal;
        }
        if let SignalKind::Exit {
            reason: ExitReason::StopLoss,
        } = signal.kind
        {
            return signal;
        }

        let kind = if position.is_some() {
            SignalKind::Exit {
                reason: ExitReason::RiskHalt,
            }
        } else {
            SignalKind::Hold
        };
        Signal { kind, ..signal }
    }

    /// Must be called right before every entry order goes out.
    pub fn admit_entry(&self) -> Result<()> {
        if self.is_halted() {
            return Err(Error::RiskHalted);
        }
        Ok(())
    }

    /// Track open-position P&L at `price` for reporting. Does not affect the halt.
    pub fn mark_to_market(&mut self, position: Option<&Position>, price: f64) {
        self.unrealized_pnl = position.map(|p| p.pnl_at(price)).unwrap_or(0.0);
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.unrealized_pnl
    }

    /// Resume from a previously persisted state (see [`RiskGovernor::replay`]).
    pub fn restore(&mut self, state: RiskState) {
        info!(
            day = %state.trading_day,
            realized_pnl_today = state.realized_pnl_today,
            halted = state.trading_halted,
            "Risk state restored"
        );
        self.state = Some(state);
    }

    /// Rebuild the risk state from a journal.
    ///
    /// Every record that carries a bar with a fresh equity reading rolls the
    /// day with that equity; every realized P&L is then booked in order. This is the same
    /// sequence the trading loop runs, so the result matches the live state.
    pub fn replay<'a>(
        params: &RiskParams,
        records: impl IntoIterator<Item = &'a JournalRecord>,
    ) -> Option<RiskState> {
        let mut governor = Self::new(params);
        for record in records {
            if record.rolls_day() {
                governor.roll_day(record.timestamp, record.equity);
            }
            for pnl in record.realized_fills() {
                governor.record_fill(pnl);
            }
        }
        governor.state()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
