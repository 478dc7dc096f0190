use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use common::{
    equity_from_balance, Bar, BarSource, BrokerAdapter, Config, Error, JournalRecord,
    OrderResult, Outcome, Position, Result, RiskParams,
};
use risk::RiskGovernor;

use crate::journal::Journal;
use crate::retry::RetryPolicy;
use crate::trader::{failure_outcome, Entry, EntryFill, Trader, Venue};

/// Places a plan's orders with the broker.
///
/// Never submits an entry blind: the broker position is queried first, and
/// again after any transient `place_order` failure, so an order that went
/// through despite the error is adopted instead of resubmitted.
struct BrokerVenue {
    broker: Arc<dyn BrokerAdapter>,
    policy: RetryPolicy,
    timestamp: DateTime<Utc>,
    /// Reference price for fills the broker did not confirm.
    mark: f64,
    /// Set when an order's fate could not be established.
    unconfirmed: bool,
}

impl BrokerVenue {
    async fn query_position(&self, instrument: &str) -> Result<Option<Position>> {
        self.policy
            .call("get_position", || self.broker.get_position(instrument))
            .await
    }

    fn adopted(position: Position) -> EntryFill {
        EntryFill {
            result: OrderResult {
                filled: true,
                fill_price: position.entry_price,
                order_id: "adopted".to_string(),
                size: position.size,
            },
            position,
            adopted: true,
        }
    }
}

#[async_trait]
impl Venue for BrokerVenue {
    async fn open(&mut self, instrument: &str, entry: &Entry) -> Result<EntryFill> {
        if let Some(existing) = self.query_position(instrument).await? {
            warn!(
                instrument,
                side = %existing.side,
                size = existing.size,
                "Broker already holds a position, adopting instead of ordering"
            );
            return Ok(Self::adopted(existing));
        }

        let side = entry.side.entry_order();
        let sizing = entry.sizing;
        let mut attempt = 1;
        loop {
            let placed = self
                .policy
                .attempt(
                    "place_order",
                    self.broker
                        .place_order(instrument, side, sizing.size, Some(sizing.stop_price)),
                )
                .await;

            let err = match placed {
                Ok(result) => {
                    return Ok(EntryFill {
                        position: Position {
                            instrument: instrument.to_string(),
                            side: entry.side,
                            size: result.size,
                            entry_price: result.fill_price,
                            stop_price: Some(sizing.stop_price),
                            opened_at: self.timestamp,
                        },
                        result,
                        adopted: false,
                    })
                }
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };

            // The order may have reached the broker before the failure
            match self.query_position(instrument).await {
                Ok(Some(position)) => {
                    info!(instrument, error = %err, "Order landed despite the error, adopting position");
                    return Ok(Self::adopted(position));
                }
                Ok(None) => {}
                Err(query_err) => {
                    error!(
                        instrument,
                        error = %err,
                        query_error = %query_err,
                        "Order state unknown after failed placement"
                    );
                    self.unconfirmed = true;
                    return Err(err);
                }
            }

            if attempt >= self.policy.max_attempts() {
                return Err(err);
            }
            let backoff = self.policy.backoff(attempt);
            warn!(instrument, attempt, error = %err, backoff = ?backoff, "Order not placed, retrying");
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    async fn close(&mut self, position: &Position) -> Result<OrderResult> {
        let instrument = position.instrument.as_str();
        let mut attempt = 1;
        loop {
            let err = match self
                .policy
                .attempt("close_position", self.broker.close_position(instrument))
                .await
            {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };

            match self.query_position(instrument).await {
                Ok(None) => {
                    warn!(instrument, error = %err, "Close unconfirmed but broker is flat, booking at mark");
                    return Ok(OrderResult {
                        filled: true,
                        fill_price: self.mark,
                        order_id: "unconfirmed-close".to_string(),
                        size: position.size,
                    });
                }
                Ok(Some(_)) => {}
                Err(_) => {
                    self.unconfirmed = true;
                    return Err(err);
                }
            }

            if attempt >= self.policy.max_attempts() {
                return Err(err);
            }
            let backoff = self.policy.backoff(attempt);
            warn!(instrument, attempt, error = %err, backoff = ?backoff, "Close not confirmed, retrying");
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }
}

/// Polls bars on a timer and trades them against a broker.
///
/// One loop per strategy instance. Bars are handled strictly in order; the
/// stop flag is honoured between bars.
pub struct LiveLoop<S: BarSource> {
    instrument: String,
    granularity: String,
    account_currency: Option<String>,
    poll_interval: Duration,
    max_consecutive_failures: u32,
    risk: RiskParams,
    source: S,
    journal: Box<dyn Journal>,
    trader: Trader,
    venue: BrokerVenue,
    consecutive_failures: u32,
    last_equity: f64,
    stop_rx: watch::Receiver<bool>,
}

impl<S: BarSource> LiveLoop<S> {
    pub fn new(
        config: &Config,
        broker: Arc<dyn BrokerAdapter>,
        source: S,
        journal: Box<dyn Journal>,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        let exec = &config.execution;
        Self {
            instrument: config.instrument.clone(),
            granularity: config.granularity.clone(),
            account_currency: config.account_currency.clone(),
            poll_interval: exec.poll_interval(),
            max_consecutive_failures: exec.max_consecutive_failures.max(1),
            risk: config.risk.clone(),
            source,
            journal,
            trader: Trader::new(
                &config.instrument,
                &config.strategy,
                &config.risk,
                exec.history_limit,
            ),
            venue: BrokerVenue {
                broker,
                policy: RetryPolicy::from_params(exec),
                timestamp: Utc::now(),
                mark: 0.0,
                unconfirmed: false,
            },
            consecutive_failures: 0,
            last_equity: 0.0,
            stop_rx,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.venue.policy = policy;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn trader(&self) -> &Trader {
        &self.trader
    }

    /// Continue from an earlier run: risk state is replayed from `history`
    /// and bars at or before the last journaled bar are treated as seen.
    pub fn resume_from(&mut self, history: &[JournalRecord]) -> Result<()> {
        if let Some(state) = RiskGovernor::replay(&self.risk, history) {
            self.trader.governor_mut().restore(state);
        }
        for bar in history.iter().filter_map(|r| r.bar) {
            if self.trader.last_bar_time().is_some_and(|t| bar.timestamp <= t) {
                continue;
            }
            self.trader.observe(&bar)?;
        }
        info!(
            instrument = %self.instrument,
            records = history.len(),
            last_bar = ?self.trader.last_bar_time(),
            "Resumed from journal"
        );
        Ok(())
    }

    /// Connect and adopt whatever position the broker already holds.
    pub async fn start(&mut self) -> Result<()> {
        let broker = self.venue.broker.clone();
        info!(
            instrument = %self.instrument,
            broker = broker.name(),
            mode = %broker.mode(),
            "Live loop starting"
        );
        if !self.venue.policy.call("connect", || broker.connect()).await? {
            return Err(Error::BrokerConnectivity(format!(
                "{} refused the connection",
                broker.name()
            )));
        }
        let position = self.venue.query_position(&self.instrument).await?;
        if let Some(p) = &position {
            info!(side = %p.side, size = p.size, entry = p.entry_price, "Adopted open broker position");
        }
        self.trader.adopt_position(position);
        Ok(())
    }

    /// Run until the stop flag is raised or failures become fatal.
    pub async fn run(mut self) -> Result<()> {
        self.start().await?;

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let result = loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = self.stop_rx.changed() => {
                    if changed.is_err() || *self.stop_rx.borrow() {
                        break Ok(());
                    }
                    continue;
                }
            }
            if *self.stop_rx.borrow() {
                break Ok(());
            }

            let polled = self
                .venue
                .policy
                .attempt(
                    "get_latest_bar",
                    self.source.get_latest_bar(&self.instrument, &self.granularity),
                )
                .await;
            let bar = match polled {
                Ok(Some(bar)) => bar,
                Ok(None) => continue,
                Err(e) => {
                    warn!(instrument = %self.instrument, error = %e, "Bar poll failed");
                    if let Err(fatal) = self.count_failure(true) {
                        break Err(fatal);
                    }
                    continue;
                }
            };

            if let Err(fatal) = self.on_bar(bar).await {
                break Err(fatal);
            }
        };

        if let Err(e) = self.shutdown().await {
            error!(instrument = %self.instrument, error = %e, "Shutdown could not be journaled");
            if result.is_ok() {
                return Err(e);
            }
        }
        result
    }

    /// Process one polled bar. Returns the journaled outcome, or an error
    /// once `max_consecutive_failures` bars in a row have failed.
    pub async fn on_bar(&mut self, bar: Bar) -> Result<Outcome> {
        if self.trader.last_bar_time().is_some_and(|t| bar.timestamp <= t) {
            debug!(instrument = %self.instrument, ts = %bar.timestamp, "Stale bar ignored");
            return Ok(Outcome::Skipped);
        }

        let record = self.decide_and_execute(bar).await;
        let outcome = record.outcome;
        self.journal.append(&record).await?;
        self.journal.flush().await?;

        self.count_failure(matches!(outcome, Outcome::Missed | Outcome::Unconfirmed))?;
        Ok(outcome)
    }

    async fn decide_and_execute(&mut self, bar: Bar) -> JournalRecord {
        let broker = self.venue.broker.clone();
        self.venue.timestamp = bar.timestamp;
        self.venue.mark = bar.close;

        let balance = self.venue.policy.call("get_balance", || broker.get_balance()).await;
        let equity = match balance {
            Ok(b) => equity_from_balance(&b, self.account_currency.as_deref()),
            Err(e) => {
                warn!(instrument = %self.instrument, error = %e, "Equity unavailable, bar not traded");
                let mut record = JournalRecord::new(bar.timestamp, &self.instrument, self.last_equity);
                record.bar = Some(bar);
                record.equity_stale = true;
                record.outcome = Outcome::Missed;
                record.note(format!("equity unavailable: {e}"));
                if let Err(e) = self.trader.observe(&bar) {
                    warn!(error = %e, "Bar rejected by history");
                }
                self.trader.stamp(&mut record);
                return record;
            }
        };
        self.last_equity = equity;

        let mut record = JournalRecord::new(bar.timestamp, &self.instrument, equity);
        record.bar = Some(bar);
        self.trader.begin_bar(bar.timestamp, equity);

        if let Err(e) = self.reconcile(&bar, &mut record).await {
            warn!(instrument = %self.instrument, error = %e, "Reconcile failed, bar not traded");
            record.outcome = Outcome::Missed;
            record.note(format!("reconcile failed: {e}"));
            if let Err(e) = self.trader.observe(&bar) {
                warn!(error = %e, "Bar rejected by history");
            }
            self.trader.stamp(&mut record);
            return record;
        }

        match self.trader.evaluate(&bar, equity, &mut record) {
            Ok(Some(plan)) => {
                self.venue.unconfirmed = false;
                match self.trader.execute(&plan, &mut self.venue, &mut record).await {
                    Ok(Outcome::Executed) => {}
                    Ok(outcome) => record.outcome = outcome,
                    Err(e) => {
                        record.outcome = if self.venue.unconfirmed {
                            Outcome::Unconfirmed
                        } else {
                            failure_outcome(&e)
                        };
                        record.note(format!("order failed: {e}"));
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(instrument = %self.instrument, error = %e, "Bar could not be evaluated");
                record.outcome = Outcome::Skipped;
                record.note(e.to_string());
            }
        }

        self.trader.stamp(&mut record);
        record
    }

    /// Bring the position mirror in line with the broker before deciding.
    async fn reconcile(&mut self, bar: &Bar, record: &mut JournalRecord) -> Result<()> {
        let actual = self.venue.query_position(&self.instrument).await?;
        let local = self.trader.position().cloned();

        match (local, actual) {
            (None, None) => {}
            (Some(_), None) => {
                // Broker flattened us, which means the protective stop filled
                self.trader.book_external_close(bar.close, record);
            }
            (None, Some(found)) => {
                warn!(side = %found.side, size = found.size, "Broker holds an untracked position, adopting");
                record.note("adopted untracked broker position");
                self.trader.adopt_position(Some(found));
            }
            (Some(mine), Some(found)) => {
                if mine.side != found.side || mine.size != found.size {
                    warn!(
                        local_side = %mine.side,
                        broker_side = %found.side,
                        local_size = mine.size,
                        broker_size = found.size,
                        "Position mismatch, adopting broker view"
                    );
                    record.note("position mismatch: adopted broker view");
                    self.trader.adopt_position(Some(Position {
                        stop_price: found.stop_price.or(mine.stop_price),
                        ..found
                    }));
                }
            }
        }
        self.venue.unconfirmed = false;
        Ok(())
    }

    fn count_failure(&mut self, failed: bool) -> Result<()> {
        if !failed {
            self.consecutive_failures = 0;
            return Ok(());
        }
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.max_consecutive_failures {
            error!(
                instrument = %self.instrument,
                failures = self.consecutive_failures,
                "Too many consecutive failed bars, giving up"
            );
            return Err(Error::BrokerConnectivity(format!(
                "{} consecutive bars failed",
                self.consecutive_failures
            )));
        }
        Ok(())
    }

    /// Settle any unconfirmed order with one last position query and close the journal.
    pub async fn shutdown(&mut self) -> Result<()> {
        let timestamp = Utc::now();
        let mut record = JournalRecord::new(timestamp, &self.instrument, self.last_equity);
        record.outcome = Outcome::Shutdown;

        if self.venue.unconfirmed {
            let broker = self.venue.broker.clone();
            let settled = self
                .venue
                .policy
                .attempt("get_position", broker.get_position(&self.instrument))
                .await;
            match settled {
                Ok(position) => {
                    record.note(format!(
                        "unconfirmed order settled: broker position {}",
                        position.as_ref().map(|p| p.side.to_string()).unwrap_or_else(|| "flat".into())
                    ));
                    self.trader.adopt_position(position);
                    self.venue.unconfirmed = false;
                }
                Err(e) => {
                    error!(instrument = %self.instrument, error = %e, "Unconfirmed order could not be settled");
                    record.note(format!("unconfirmed order unresolved: {e}"));
                }
            }
        }

        self.trader.stamp(&mut record);
        self.journal.append(&record).await?;
        self.journal.flush().await?;
        info!(
            instrument = %self.instrument,
            position = ?self.trader.position().map(|p| p.side),
            "Live loop stopped"
        );
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
