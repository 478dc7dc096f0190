use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use common::{
    BacktestParams, BarSeries, Config, Error, JournalRecord, OrderResult, Outcome, Position,
    Result, RiskParams, RiskState, Side, StrategyParams,
};

use crate::journal::Journal;
use crate::trader::{BarPlan, Entry, EntryFill, Trader, Venue};

/// A completed round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub side: Side,
    pub size: f64,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_time: DateTime<Utc>,
    pub exit_price: f64,
    /// Price P&L before commission.
    pub pnl: f64,
    /// Commission on both legs.
    pub commission: f64,
}

impl Trade {
    pub fn net_pnl(&self) -> f64 {
        self.pnl - self.commission
    }

    pub fn is_winner(&self) -> bool {
        self.net_pnl() > 0.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestReport {
    pub instrument: String,
    pub bars: usize,
    pub initial_cash: f64,
    pub final_equity: f64,
    /// `final_equity / initial_cash - 1`.
    pub total_return: f64,
    pub trades: Vec<Trade>,
    pub win_rate: f64,
    /// Largest peak-to-trough fall of the equity curve, as a negative fraction.
    pub max_drawdown: f64,
    pub commission_paid: f64,
    /// Trading days on which the drawdown halt was hit.
    pub halted_days: usize,
    pub suppressed_entries: usize,
    pub invalid_sizings: usize,
    pub final_risk_state: Option<RiskState>,
}

/// Maximum drawdown of an equity curve as a negative fraction (-0.15 = 15%).
pub fn max_drawdown(equity_curve: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut max_dd = 0.0_f64;
    for &eq in equity_curve {
        peak = peak.max(eq);
        if peak > 0.0 {
            max_dd = max_dd.min((eq - peak) / peak);
        }
    }
    max_dd
}

/// Fills at a quoted price and charges a proportional commission.
struct SimulatedVenue {
    commission_rate: f64,
    cash: f64,
    timestamp: DateTime<Utc>,
    price: f64,
    /// Commission paid on the entry leg of the open position.
    entry_commission: f64,
    commission_paid: f64,
    trades: Vec<Trade>,
    fills: u64,
}

impl SimulatedVenue {
    fn new(initial_cash: f64, commission_rate: f64, start: DateTime<Utc>) -> Self {
        Self {
            commission_rate,
            cash: initial_cash,
            timestamp: start,
            price: 0.0,
            entry_commission: 0.0,
            commission_paid: 0.0,
            trades: Vec::new(),
            fills: 0,
        }
    }

    fn quote(&mut self, timestamp: DateTime<Utc>, price: f64) {
        self.timestamp = timestamp;
        self.price = price;
    }

    fn equity(&self, position: Option<&Position>, mark: f64) -> f64 {
        self.cash + position.map(|p| p.pnl_at(mark)).unwrap_or(0.0)
    }

    fn charge(&mut self, size: f64) -> f64 {
        let fee = (size * self.price).abs() * self.commission_rate;
        self.cash -= fee;
        self.commission_paid += fee;
        fee
    }

    fn fill(&mut self, size: f64) -> OrderResult {
        self.fills += 1;
        OrderResult {
            filled: true,
            fill_price: self.price,
            order_id: format!("sim-{}", self.fills),
            size,
        }
    }
}

#[async_trait]
impl Venue for SimulatedVenue {
    async fn open(&mut self, instrument: &str, entry: &Entry) -> Result<EntryFill> {
        let size = entry.sizing.size;
        self.entry_commission = self.charge(size);
        let result = self.fill(size);
        Ok(EntryFill {
            position: Position {
                instrument: instrument.to_string(),
                side: entry.side,
                size,
                entry_price: result.fill_price,
                stop_price: Some(entry.sizing.stop_price),
                opened_at: self.timestamp,
            },
            result,
            adopted: false,
        })
    }

    async fn close(&mut self, position: &Position) -> Result<OrderResult> {
        let fee = self.charge(position.size);
        let pnl = position.pnl_at(self.price);
        self.cash += pnl;
        self.trades.push(Trade {
            side: position.side,
            size: position.size,
            entry_time: position.opened_at,
            entry_price: position.entry_price,
            exit_time: self.timestamp,
            exit_price: self.price,
            pnl,
            commission: self.entry_commission + fee,
        });
        self.entry_commission = 0.0;
        Ok(self.fill(position.size))
    }
}

/// Replays a bar history through the same per-bar algorithm as the live loop.
///
/// A decision taken on bar `t` is filled at the open of bar `t + 1`; stop
/// prices come from bar `t`'s close. Every bar is journaled.
pub struct BacktestRunner {
    instrument: String,
    strategy: StrategyParams,
    risk: RiskParams,
    params: BacktestParams,
    history_limit: usize,
}

impl BacktestRunner {
    pub fn new(config: &Config) -> Self {
        Self::with_params(
            config.instrument.clone(),
            config.strategy.clone(),
            config.risk.clone(),
            config.backtest.clone(),
        )
        .history_limit(config.execution.history_limit)
    }

    pub fn with_params(
        instrument: impl Into<String>,
        strategy: StrategyParams,
        risk: RiskParams,
        params: BacktestParams,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            strategy,
            risk,
            params,
            history_limit: 0,
        }
    }

    pub fn history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub async fn run(&self, bars: &BarSeries, journal: &mut dyn Journal) -> Result<BacktestReport> {
        let (Some(first), Some(last)) = (bars.as_slice().first(), bars.last()) else {
            return Err(Error::Data("no bars to backtest".into()));
        };
        info!(
            instrument = %self.instrument,
            bars = bars.len(),
            from = %first.timestamp,
            to = %last.timestamp,
            "Backtest starting"
        );

        let mut trader = Trader::new(&self.instrument, &self.strategy, &self.risk, self.history_limit);
        let mut venue = SimulatedVenue::new(
            self.params.initial_cash,
            self.params.commission_rate,
            first.timestamp,
        );
        let mut pending: Option<BarPlan> = None;
        let mut curve = Vec::with_capacity(bars.len() + 1);
        curve.push(self.params.initial_cash);
        let mut halted_days: BTreeSet<NaiveDate> = BTreeSet::new();
        let mut suppressed = 0;
        let mut invalid = 0;

        for bar in bars {
            let equity = venue.equity(trader.position(), bar.open);
            let mut record = JournalRecord::new(bar.timestamp, &self.instrument, equity);
            record.bar = Some(*bar);
            trader.begin_bar(bar.timestamp, equity);

            if let Some(plan) = pending.take() {
                venue.quote(bar.timestamp, bar.open);
                record.note(format!("filling plan from {} at open", plan.decided_at));
                match trader.execute(&plan, &mut venue, &mut record).await {
                    Ok(Outcome::Suppressed) => suppressed += 1,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Simulated fill failed");
                        record.note(format!("fill failed: {e}"));
                    }
                }
            }

            pending = trader.evaluate(bar, equity, &mut record)?;
            match record.outcome {
                Outcome::Suppressed => suppressed += 1,
                Outcome::InvalidSizing => invalid += 1,
                Outcome::Executed if pending.is_some() => record.outcome = Outcome::Pending,
                _ => {}
            }

            trader.stamp(&mut record);
            if let Some(state) = record.risk_state.filter(|s| s.trading_halted) {
                halted_days.insert(state.trading_day);
            }
            journal.append(&record).await?;
            curve.push(venue.equity(trader.position(), bar.close));
        }

        if let Some(plan) = pending.take() {
            let mut record = JournalRecord::new(
                last.timestamp,
                &self.instrument,
                venue.equity(trader.position(), last.close),
            );
            record.outcome = Outcome::Shutdown;
            record.note(format!(
                "pending plan from {} dropped: no later bar to fill on",
                plan.decided_at
            ));
            trader.stamp(&mut record);
            journal.append(&record).await?;
        }

        if trader.position().is_some() {
            venue.quote(last.timestamp, last.close);
            let mut record = JournalRecord::new(
                last.timestamp,
                &self.instrument,
                venue.equity(trader.position(), last.close),
            );
            record.note("end of backtest: position closed at last close");
            let plan = BarPlan {
                decided_at: last.timestamp,
                close_first: true,
                open: None,
            };
            let outcome = trader.execute(&plan, &mut venue, &mut record).await?;
            record.outcome = outcome;
            trader.stamp(&mut record);
            journal.append(&record).await?;
            if let Some(point) = curve.last_mut() {
                *point = venue.cash;
            }
        }
        journal.flush().await?;

        let trades = venue.trades;
        let winners = trades.iter().filter(|t| t.is_winner()).count();
        let win_rate = if trades.is_empty() {
            0.0
        } else {
            winners as f64 / trades.len() as f64
        };
        let final_equity = venue.cash;

        let report = BacktestReport {
            instrument: self.instrument.clone(),
            bars: bars.len(),
            initial_cash: self.params.initial_cash,
            final_equity,
            total_return: final_equity / self.params.initial_cash - 1.0,
            win_rate,
            max_drawdown: max_drawdown(&curve),
            commission_paid: venue.commission_paid,
            halted_days: halted_days.len(),
            suppressed_entries: suppressed,
            invalid_sizings: invalid,
            final_risk_state: trader.risk_state(),
            trades,
        };

        info!(
            instrument = %report.instrument,
            final_equity = report.final_equity,
            total_return = report.total_return,
            trades = report.trades.len(),
            win_rate = report.win_rate,
            max_drawdown = report.max_drawdown,
            halted_days = report.halted_days,
            "Backtest complete"
        );
        Ok(report)
    }
}
