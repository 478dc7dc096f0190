use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use common::{
    Bar, BarSeries, Error, ExitReason, IndicatorSnapshot, JournalRecord, OrderAction,
    OrderRecord, OrderResult, Outcome, Position, PositionSizing, Result, RiskParams, RiskState,
    Side, SignalKind, StrategyParams,
};
use risk::{PositionSizer, RiskGovernor};
use strategy::{IndicatorEngine, SignalGenerator};

/// An entry the trader wants filled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Entry {
    pub side: Side,
    pub sizing: PositionSizing,
}

/// Orders decided on one bar. The close, if any, always goes first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BarPlan {
    pub decided_at: DateTime<Utc>,
    pub close_first: bool,
    pub open: Option<Entry>,
}

/// A filled entry. `adopted` is set when the venue found the position
/// already open instead of placing a new order.
#[derive(Debug, Clone)]
pub struct EntryFill {
    pub result: OrderResult,
    pub position: Position,
    pub adopted: bool,
}

/// Where a plan's orders are filled: the simulator in backtests, the broker live.
#[async_trait]
pub trait Venue: Send {
    async fn open(&mut self, instrument: &str, entry: &Entry) -> Result<EntryFill>;

    async fn close(&mut self, position: &Position) -> Result<OrderResult>;
}

/// Journal outcome for an order that failed with `err`.
pub fn failure_outcome(err: &Error) -> Outcome {
    match err {
        Error::OrderRejected { .. } => Outcome::Rejected,
        Error::RiskHalted => Outcome::Suppressed,
        e if e.is_retryable() => Outcome::Missed,
        _ => Outcome::Unconfirmed,
    }
}

/// The per-bar algorithm shared by the backtest runner and the live loop.
///
/// Owns the bar history, indicator state, the previous snapshot, the local
/// position mirror and the risk governor for one instrument.
pub struct Trader {
    instrument: String,
    indicators: IndicatorEngine,
    generator: SignalGenerator,
    sizer: PositionSizer,
    governor: RiskGovernor,
    bars: BarSeries,
    history_limit: usize,
    prev: Option<IndicatorSnapshot>,
    position: Option<Position>,
}

impl Trader {
    pub fn new(
        instrument: impl Into<String>,
        strategy: &StrategyParams,
        risk: &RiskParams,
        history_limit: usize,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            indicators: IndicatorEngine::from_params(strategy),
            generator: SignalGenerator::new(),
            sizer: PositionSizer::new(risk, strategy.atr_multiplier),
            governor: RiskGovernor::new(risk),
            bars: BarSeries::new(),
            history_limit: history_limit.max(strategy.warmup()),
            prev: None,
            position: None,
        }
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn governor(&self) -> &RiskGovernor {
        &self.governor
    }

    pub fn governor_mut(&mut self) -> &mut RiskGovernor {
        &mut self.governor
    }

    pub fn risk_state(&self) -> Option<RiskState> {
        self.governor.state()
    }

    pub fn last_bar_time(&self) -> Option<DateTime<Utc>> {
        self.bars.last().map(|b| b.timestamp)
    }

    /// Replace the position mirror with what the broker reports.
    pub fn adopt_position(&mut self, position: Option<Position>) {
        self.position = position;
    }

    /// Roll the trading day if `timestamp` starts a new one.
    pub fn begin_bar(&mut self, timestamp: DateTime<Utc>, equity: f64) -> bool {
        self.governor.roll_day(timestamp, equity)
    }

    /// Feed a bar to the indicators without taking a decision on it.
    pub fn observe(&mut self, bar: &Bar) -> Result<()> {
        self.ingest(bar)?;
        match self.indicators.update(bar) {
            Ok(snapshot) => {
                self.prev = Some(snapshot);
                Ok(())
            }
            Err(Error::InsufficientHistory { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn ingest(&mut self, bar: &Bar) -> Result<()> {
        self.bars.push(*bar)?;
        self.bars.retain_last(self.history_limit);
        Ok(())
    }

    /// Decide what to do on `bar`, writing the decision into `record`.
    ///
    /// Returns the orders to place, if any. `record.outcome` is left at
    /// `Executed` for a plan; execution overwrites it on failure.
    pub fn evaluate(
        &mut self,
        bar: &Bar,
        equity: f64,
        record: &mut JournalRecord,
    ) -> Result<Option<BarPlan>> {
        self.ingest(bar)?;

        let snapshot = match self.indicators.update(bar) {
            Ok(snapshot) => snapshot,
            Err(Error::InsufficientHistory { have, need }) => {
                debug!(instrument = %self.instrument, have, need, "Warming up");
                record.outcome = Outcome::Skipped;
                record.note(format!("warm-up: {have} of {need} bars"));
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let prev = self.prev.replace(snapshot);

        self.governor
            .mark_to_market(self.position.as_ref(), snapshot.close);
        record.unrealized_pnl = self.governor.unrealized_pnl();

        let raw = self
            .generator
            .next_signal(prev.as_ref(), &snapshot, self.position.as_ref());
        let signal = self.governor.gate(raw, self.position.as_ref());
        record.signal = Some(signal);

        debug!(
            instrument = %self.instrument,
            fast = snapshot.fast_sma,
            slow = snapshot.slow_sma,
            atr = snapshot.atr,
            signal = ?signal.kind,
            "Bar evaluated"
        );

        match signal.kind {
            SignalKind::Hold => {
                if raw.kind.is_entry() {
                    warn!(
                        instrument = %self.instrument,
                        signal = ?raw.kind,
                        "Entry suppressed by daily drawdown halt"
                    );
                    record.outcome = Outcome::Suppressed;
                    record.note("entry suppressed: daily drawdown halt");
                } else {
                    record.outcome = Outcome::Hold;
                }
                Ok(None)
            }

            SignalKind::Exit { reason } => {
                let Some(position) = &self.position else {
                    record.outcome = Outcome::Hold;
                    return Ok(None);
                };
                info!(
                    instrument = %self.instrument,
                    side = %position.side,
                    reason = ?reason,
                    close = snapshot.close,
                    "Exit signal"
                );
                if reason == ExitReason::RiskHalt {
                    record.note("flattening: daily drawdown halt");
                }
                record.outcome = Outcome::Executed;
                Ok(Some(BarPlan {
                    decided_at: bar.timestamp,
                    close_first: true,
                    open: None,
                }))
            }

            SignalKind::LongEntry | SignalKind::ShortEntry => {
                let side = if signal.kind == SignalKind::LongEntry {
                    Side::Long
                } else {
                    Side::Short
                };
                let close_first = self.position.is_some();

                match self.sizer.plan(side, equity, snapshot.close, snapshot.atr) {
                    Ok(sizing) => {
                        info!(
                            instrument = %self.instrument,
                            side = %side,
                            size = sizing.size,
                            stop = sizing.stop_price,
                            risk = sizing.risk_amount,
                            reversal = close_first,
                            "Entry signal"
                        );
                        record.sizing = Some(sizing);
                        record.outcome = Outcome::Executed;
                        Ok(Some(BarPlan {
                            decided_at: bar.timestamp,
                            close_first,
                            open: Some(Entry { side, sizing }),
                        }))
                    }
                    Err(Error::InvalidSizing(reason)) => {
                        warn!(
                            instrument = %self.instrument,
                            side = %side,
                            atr = snapshot.atr,
                            reason = %reason,
                            "Entry skipped, invalid sizing"
                        );
                        record.outcome = Outcome::InvalidSizing;
                        record.note(format!("invalid sizing: {reason}"));
                        // Still leave the position the crossover turned against
                        Ok(close_first.then_some(BarPlan {
                            decided_at: bar.timestamp,
                            close_first,
                            open: None,
                        }))
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Carry out `plan` through `venue`, booking fills on the position
    /// mirror, the governor and `record.orders`.
    ///
    /// Returns `Outcome::Suppressed` when the governor refuses the entry
    /// (a reversal whose close hit the daily limit). Venue errors are
    /// recorded on `record` and returned.
    pub async fn execute<V: Venue + ?Sized>(
        &mut self,
        plan: &BarPlan,
        venue: &mut V,
        record: &mut JournalRecord,
    ) -> Result<Outcome> {
        if plan.close_first {
            if let Some(position) = self.position.clone() {
                match venue.close(&position).await {
                    Ok(result) => self.book_close(&position, result, record),
                    Err(e) => {
                        warn!(instrument = %self.instrument, error = %e, "Close failed");
                        record.orders.push(OrderRecord {
                            action: OrderAction::Close,
                            side: position.side.opposite().entry_order(),
                            size: position.size,
                            result: None,
                            realized_pnl: None,
                            error: Some(e.to_string()),
                        });
                        return Err(e);
                    }
                }
            }
        }

        let Some(entry) = plan.open else {
            return Ok(Outcome::Executed);
        };
        if let Err(e) = self.governor.admit_entry() {
            warn!(instrument = %self.instrument, side = %entry.side, "Entry blocked: {e}");
            record.note(format!("entry blocked: {e}"));
            return Ok(Outcome::Suppressed);
        }
        if self.position.is_some() {
            warn!(instrument = %self.instrument, "Entry skipped, a position is still open");
            record.note("entry skipped: position still open");
            return Ok(Outcome::Skipped);
        }

        let side = entry.side.entry_order();
        match venue.open(&self.instrument, &entry).await {
            Ok(fill) => {
                info!(
                    instrument = %self.instrument,
                    side = %entry.side,
                    size = fill.position.size,
                    price = fill.position.entry_price,
                    stop = ?fill.position.stop_price,
                    adopted = fill.adopted,
                    "Position opened"
                );
                if fill.adopted {
                    record.note("entry adopted from existing broker position");
                }
                record.orders.push(OrderRecord {
                    action: OrderAction::Open,
                    side,
                    size: fill.result.size,
                    result: Some(fill.result),
                    realized_pnl: None,
                    error: None,
                });
                self.position = Some(fill.position);
                Ok(Outcome::Executed)
            }
            Err(e) => {
                warn!(instrument = %self.instrument, side = %entry.side, error = %e, "Entry failed");
                record.orders.push(OrderRecord {
                    action: OrderAction::Open,
                    side,
                    size: entry.sizing.size,
                    result: None,
                    realized_pnl: None,
                    error: Some(e.to_string()),
                });
                Err(e)
            }
        }
    }

    fn book_close(&mut self, position: &Position, result: OrderResult, record: &mut JournalRecord) {
        let pnl = position.pnl_at(result.fill_price);
        let status = self.governor.record_fill(pnl);
        info!(
            instrument = %self.instrument,
            side = %position.side,
            price = result.fill_price,
            pnl = pnl,
            status = ?status,
            "Position closed"
        );
        record.orders.push(OrderRecord {
            action: OrderAction::Close,
            side: position.side.opposite().entry_order(),
            size: position.size,
            result: Some(result),
            realized_pnl: Some(pnl),
            error: None,
        });
        self.position = None;
    }

    /// Book a position that the broker closed on its own, assumed filled at
    /// its protective stop (or `fallback_price` if it had none).
    pub fn book_external_close(&mut self, fallback_price: f64, record: &mut JournalRecord) -> Option<f64> {
        let position = self.position.take()?;
        let price = position.stop_price.unwrap_or(fallback_price);
        let pnl = position.pnl_at(price);
        let status = self.governor.record_fill(pnl);
        warn!(
            instrument = %self.instrument,
            side = %position.side,
            price = price,
            pnl = pnl,
            status = ?status,
            "Position closed broker-side, booked at stop"
        );
        record.orders.push(OrderRecord {
            action: OrderAction::Close,
            side: position.side.opposite().entry_order(),
            size: position.size,
            result: None,
            realized_pnl: Some(pnl),
            error: None,
        });
        record.note("position closed broker-side");
        Some(pnl)
    }

    /// Copy the governor's state onto a finished record.
    pub fn stamp(&self, record: &mut JournalRecord) {
        record.risk_state = self.governor.state();
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    /// Fills everything at a fixed price.
    struct FixedVenue {
        price: f64,
        opened: usize,
        closed: usize,
    }

    impl FixedVenue {
        fn new() -> Self {
            Self {
                price: 0.0,
                opened: 0,
                closed: 0,
            }
        }
    }

    #[async_trait]
    impl Venue for FixedVenue {
        async fn open(&mut self, instrument: &str, entry: &Entry) -> Result<EntryFill> {
            self.opened += 1;
            Ok(EntryFill {
                result: OrderResult {
                    filled: true,
                    fill_price: self.price,
                    order_id: format!("open-{}", self.opened),
                    size: entry.sizing.size,
                },
                position: Position {
                    instrument: instrument.to_string(),
                    side: entry.side,
                    size: entry.sizing.size,
                    entry_price: self.price,
                    stop_price: Some(entry.sizing.stop_price),
                    opened_at: Utc::now(),
                },
                adopted: false,
            })
        }

        async fn close(&mut self, position: &Position) -> Result<OrderResult> {
            self.closed += 1;
            Ok(OrderResult {
                filled: true,
                fill_price: self.price,
                order_id: format!("close-{}", self.closed),
                size: position.size,
            })
        }
    }

    fn strategy() -> StrategyParams {
        StrategyParams {
            fast_window: 2,
            slow_window: 4,
            atr_window: 2,
            atr_multiplier: 2.0,
        }
    }

    fn risk(risk_per_trade: f64) -> RiskParams {
        RiskParams {
            risk_per_trade,
            max_daily_drawdown: 0.02,
            ..RiskParams::default()
        }
    }

    fn make_bars(closes: &[f64]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
        let mut prev = closes[0];
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let bar = Bar::new(start + Duration::minutes(i as i64), prev, c + 0.25, c - 0.25, c, 100.0);
                prev = c;
                bar
            })
            .collect()
    }

    /// Falls, crosses golden on index 6, crosses death on index 9.
    const CLOSES: [f64; 10] = [10.0, 9.75, 9.5, 9.25, 9.0, 9.5, 10.0, 10.5, 9.5, 9.0];

    /// Run bars through evaluate + execute at the bar close.
    async fn drive(trader: &mut Trader, venue: &mut FixedVenue, bars: &[Bar]) -> Vec<JournalRecord> {
        let mut records = Vec::new();
        for bar in bars {
            let mut record = JournalRecord::new(bar.timestamp, "TEST", 10_000.0);
            record.bar = Some(*bar);
            trader.begin_bar(bar.timestamp, 10_000.0);
            if let Some(plan) = trader.evaluate(bar, 10_000.0, &mut record).unwrap() {
                venue.price = bar.close;
                let outcome = trader.execute(&plan, venue, &mut record).await.unwrap();
                if outcome != Outcome::Executed {
                    record.outcome = outcome;
                }
            }
            trader.stamp(&mut record);
            records.push(record);
        }
        records
    }

    #[tokio::test]
    async fn warm_up_bars_are_skipped() {
        let mut trader = Trader::new("TEST", &strategy(), &risk(0.005), 100);
        let mut venue = FixedVenue::new();
        let records = drive(&mut trader, &mut venue, &make_bars(&CLOSES[..4])).await;
        let outcomes: Vec<_> = records.iter().map(|r| r.outcome).collect();
        assert_eq!(
            outcomes,
            vec![Outcome::Skipped, Outcome::Skipped, Outcome::Skipped, Outcome::Hold]
        );
    }

    #[tokio::test]
    async fn golden_cross_opens_sized_long_with_atr_stop() {
        let mut trader = Trader::new("TEST", &strategy(), &risk(0.005), 100);
        let mut venue = FixedVenue::new();
        let records = drive(&mut trader, &mut venue, &make_bars(&CLOSES[..8])).await;

        let entry = &records[6];
        assert_eq!(entry.outcome, Outcome::Executed);
        assert_eq!(entry.signal.unwrap().kind, SignalKind::LongEntry);
        // ATR 0.75 x2 = 1.5 stop distance; 50 / 1.5 floors to 33 units
        let sizing = entry.sizing.unwrap();
        assert_eq!(sizing.size, 33.0);
        assert_eq!(sizing.stop_price, 8.5);

        assert_eq!(records[7].outcome, Outcome::Hold);
        assert_eq!(venue.opened, 1);
        assert_eq!(trader.position().unwrap().side, Side::Long);
    }

    #[tokio::test]
    async fn death_cross_reverses_close_then_open() {
        let mut trader = Trader::new("TEST", &strategy(), &risk(0.005), 100);
        let mut venue = FixedVenue::new();
        let records = drive(&mut trader, &mut venue, &make_bars(&CLOSES)).await;

        let reversal = &records[9];
        assert_eq!(reversal.signal.unwrap().kind, SignalKind::ShortEntry);
        assert_eq!(reversal.orders.len(), 2);
        assert_eq!(reversal.orders[0].action, OrderAction::Close);
        assert_eq!(reversal.orders[1].action, OrderAction::Open);
        // Long 33 from 10.0 closed at 9.0
        let pnl = reversal.orders[0].realized_pnl.unwrap();
        assert_eq!(pnl, -33.0);
        assert_eq!(trader.position().unwrap().side, Side::Short);
        assert_eq!(trader.risk_state().unwrap().realized_pnl_today, -33.0);
    }

    #[tokio::test]
    async fn reversal_that_hits_the_limit_suppresses_the_entry() {
        // 5% risk => 333 units; closing at 9.0 loses 333 against a 200 limit
        let mut trader = Trader::new("TEST", &strategy(), &risk(0.05), 100);
        let mut venue = FixedVenue::new();
        let records = drive(&mut trader, &mut venue, &make_bars(&CLOSES)).await;

        let reversal = &records[9];
        assert_eq!(reversal.outcome, Outcome::Suppressed);
        assert_eq!(reversal.orders.len(), 1);
        assert!(trader.position().is_none());
        assert!(trader.governor().is_halted());
        assert_eq!(venue.opened, 1);
    }

    #[tokio::test]
    async fn halted_governor_flattens_open_position() {
        let mut trader = Trader::new("TEST", &strategy(), &risk(0.005), 100);
        let mut venue = FixedVenue::new();
        let bars = make_bars(&CLOSES[..8]);
        drive(&mut trader, &mut venue, &bars[..7]).await;
        assert!(trader.position().is_some());

        trader.governor_mut().record_fill(-250.0);
        let records = drive(&mut trader, &mut venue, &bars[7..]).await;
        assert_eq!(
            records[0].signal.unwrap().kind,
            SignalKind::Exit {
                reason: ExitReason::RiskHalt
            }
        );
        assert!(trader.position().is_none());
        assert_eq!(venue.closed, 1);
    }

    #[tokio::test]
    async fn zero_atr_cross_is_invalid_sizing_without_orders() {
        let params = StrategyParams {
            fast_window: 2,
            slow_window: 3,
            atr_window: 1,
            atr_multiplier: 2.0,
        };
        let mut trader = Trader::new("TEST", &params, &risk(0.005), 100);
        let mut venue = FixedVenue::new();
        let start = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
        // Flat bars: the cross lands on a bar with zero true range
        let bars: Vec<Bar> = [12.0, 8.0, 10.0, 10.0]
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar::new(start + Duration::minutes(i as i64), c, c, c, c, 1.0))
            .collect();

        let records = drive(&mut trader, &mut venue, &bars).await;
        let last = &records[3];
        assert_eq!(last.signal.unwrap().kind, SignalKind::LongEntry);
        assert_eq!(last.outcome, Outcome::InvalidSizing);
        assert!(last.orders.is_empty());
        assert!(last.sizing.is_none());
        assert_eq!(venue.opened, 0);
    }

    #[test]
    fn duplicate_bar_is_rejected_before_any_decision() {
        let mut trader = Trader::new("TEST", &strategy(), &risk(0.005), 100);
        let bars = make_bars(&CLOSES[..2]);
        let mut record = JournalRecord::new(bars[1].timestamp, "TEST", 10_000.0);
        trader.evaluate(&bars[1], 10_000.0, &mut record).unwrap();
        let err = trader.evaluate(&bars[0], 10_000.0, &mut record).unwrap_err();
        assert!(matches!(err, Error::OutOfOrderBar { .. }));
    }

    #[test]
    fn external_close_books_pnl_at_stop() {
        let mut trader = Trader::new("TEST", &strategy(), &risk(0.005), 100);
        let ts = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
        trader.begin_bar(ts, 10_000.0);
        trader.adopt_position(Some(Position {
            instrument: "TEST".into(),
            side: Side::Short,
            size: 100.0,
            entry_price: 50.0,
            stop_price: Some(51.5),
            opened_at: ts,
        }));
        let mut record = JournalRecord::new(ts, "TEST", 10_000.0);
        let pnl = trader.book_external_close(49.0, &mut record).unwrap();
        assert!((pnl + 150.0).abs() < 1e-9);
        assert!(trader.position().is_none());
        assert_eq!(record.realized_fills().collect::<Vec<_>>(), vec![pnl]);
    }

    #[test]
    fn failure_outcomes() {
        assert_eq!(
            failure_outcome(&Error::OrderRejected { reason: "x".into() }),
            Outcome::Rejected
        );
        assert_eq!(failure_outcome(&Error::Timeout("x".into())), Outcome::Missed);
        assert_eq!(failure_outcome(&Error::Other("x".into())), Outcome::Unconfirmed);
    }
}
