use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use common::{
    Bar, BarSource, BrokerAdapter, Error, OrderResult, OrderSide, PaperParams, Position, PriceSource, Result,
    Side, TradingMode,
};

/// In-process broker for paper trading.
///
/// Fills at the latest known price with slippage, holds at most one
/// position per instrument and enforces the attached stop itself when a
/// price update goes through it. Nothing ever leaves the process.
pub struct PaperBroker {
    currency: String,
    /// Realized cash balance.
    balance: Arc<RwLock<f64>>,
    positions: Arc<RwLock<HashMap<String, Position>>>,
    /// Latest known price per instrument, updated via `update_price`.
    prices: Arc<RwLock<HashMap<String, f64>>>,
    /// Slippage in basis points applied to all fills.
    slippage_bps: f64,
    orders_filled: AtomicUsize,
}

impl PaperBroker {
    pub fn new(currency: impl Into<String>, initial_balance: f64, slippage_bps: f64) -> Self {
        let currency = currency.into();
        info!(
            currency = %currency,
            balance = initial_balance,
            slippage_bps = slippage_bps,
            "PaperBroker initialized"
        );
        Self {
            currency,
            balance: Arc::new(RwLock::new(initial_balance)),
            positions: Arc::new(RwLock::new(HashMap::new())),
            prices: Arc::new(RwLock::new(HashMap::new())),
            slippage_bps,
            orders_filled: AtomicUsize::new(0),
        }
    }

    pub fn from_params(currency: impl Into<String>, params: &PaperParams) -> Self {
        Self::new(currency, params.initial_balance, params.slippage_bps)
    }

    /// Update the latest price. If it crosses the stop of an open position
    /// the position is closed at the stop price, as a broker-held stop would.
    pub async fn update_price(&self, instrument: &str, price: f64) {
        self.prices
            .write()
            .await
            .insert(instrument.to_string(), price);

        let mut positions = self.positions.write().await;
        let triggered = positions
            .get(instrument)
            .is_some_and(|p| p.stop_breached(price));
        if !triggered {
            return;
        }
        if let Some(pos) = positions.remove(instrument) {
            let stop = pos.stop_price.unwrap_or(price);
            let pnl = pos.pnl_at(stop);
            *self.balance.write().await += pnl;
            self.orders_filled.fetch_add(1, Ordering::SeqCst);
            info!(
                instrument = %instrument,
                side = %pos.side,
                stop = stop,
                pnl = pnl,
                "Paper stop-loss filled"
            );
        }
    }

    /// Number of fills so far, stop-outs included.
    pub fn orders_filled(&self) -> usize {
        self.orders_filled.load(Ordering::SeqCst)
    }

    pub async fn cash(&self) -> f64 {
        *self.balance.read().await
    }

    fn slipped(&self, price: f64, side: OrderSide) -> f64 {
        // Buys pay more, sells receive less
        match side {
            OrderSide::Buy => price * (1.0 + self.slippage_bps / 10_000.0),
            OrderSide::Sell => price * (1.0 - self.slippage_bps / 10_000.0),
        }
    }

    async fn price_of(&self, instrument: &str) -> Result<f64> {
        self.prices
            .read()
            .await
            .get(instrument)
            .copied()
            .ok_or_else(|| Error::OrderRejected {
                reason: format!("paper broker has no price for '{instrument}'"),
            })
    }
}

#[async_trait]
impl BrokerAdapter for PaperBroker {
    fn name(&self) -> &str {
        "paper"
    }

    fn mode(&self) -> TradingMode {
        TradingMode::Paper
    }

    async fn connect(&self) -> Result<bool> {
        Ok(true)
    }

    async fn get_balance(&self) -> Result<HashMap<String, f64>> {
        let cash = *self.balance.read().await;
        Ok(HashMap::from([(self.currency.clone(), cash)]))
    }

    async fn get_position(&self, instrument: &str) -> Result<Option<Position>> {
        Ok(self.positions.read().await.get(instrument).cloned())
    }

    async fn place_order(
        &self,
        instrument: &str,
        side: OrderSide,
        size: f64,
        stop_loss: Option<f64>,
    ) -> Result<OrderResult> {
        if !(size > 0.0) {
            return Err(Error::OrderRejected {
                reason: format!("size must be positive, got {size}"),
            });
        }
        let mid = self.price_of(instrument).await?;

        let mut positions = self.positions.write().await;
        if positions.contains_key(instrument) {
            return Err(Error::OrderRejected {
                reason: format!("position already open in '{instrument}'"),
            });
        }

        let fill_price = self.slipped(mid, side);
        let order_id = uuid::Uuid::new_v4().to_string();
        let position_side = match side {
            OrderSide::Buy => Side::Long,
            OrderSide::Sell => Side::Short,
        };
        positions.insert(
            instrument.to_string(),
            Position {
                instrument: instrument.to_string(),
                side: position_side,
                size,
                entry_price: fill_price,
                stop_price: stop_loss,
                opened_at: Utc::now(),
            },
        );
        self.orders_filled.fetch_add(1, Ordering::SeqCst);

        debug!(
            instrument = %instrument,
            side = %side,
            mid = mid,
            fill = fill_price,
            size = size,
            "Paper entry filled"
        );

        Ok(OrderResult {
            filled: true,
            fill_price,
            order_id,
            size,
        })
    }

    async fn close_position(&self, instrument: &str) -> Result<OrderResult> {
        let mid = self.price_of(instrument).await?;
        let Some(pos) = self.positions.write().await.remove(instrument) else {
            return Err(Error::OrderRejected {
                reason: format!("no open position in '{instrument}'"),
            });
        };

        let exit_side = pos.side.opposite().entry_order();
        let fill_price = self.slipped(mid, exit_side);
        let pnl = pos.pnl_at(fill_price);
        *self.balance.write().await += pnl;
        self.orders_filled.fetch_add(1, Ordering::SeqCst);

        debug!(
            instrument = %instrument,
            fill = fill_price,
            pnl = pnl,
            "Paper position closed"
        );

        Ok(OrderResult {
            filled: true,
            fill_price,
            order_id: uuid::Uuid::new_v4().to_string(),
            size: pos.size,
        })
    }
}

#[async_trait]
impl PriceSource for PaperBroker {
    async fn latest_price(&self, instrument: &str) -> Result<Option<f64>> {
        Ok(self.prices.read().await.get(instrument).copied())
    }
}

/// Wraps a bar source and walks the paper broker's price through each bar
/// before handing it on, so resting stops trigger on the bar's range.
pub struct PaperFeed<S> {
    inner: S,
    broker: Arc<PaperBroker>,
}

impl<S: BarSource> PaperFeed<S> {
    pub fn new(inner: S, broker: Arc<PaperBroker>) -> Self {
        Self { inner, broker }
    }
}

#[async_trait]
impl<S: BarSource> BarSource for PaperFeed<S> {
    async fn get_latest_bar(&mut self, instrument: &str, granularity: &str) -> Result<Option<Bar>> {
        let Some(bar) = self.inner.get_latest_bar(instrument, granularity).await? else {
            return Ok(None);
        };
        for price in [bar.open, bar.low, bar.high, bar.close] {
            self.broker.update_price(instrument, price).await;
        }
        debug!(instrument = %instrument, ts = %bar.timestamp, close = bar.close, "Paper feed bar");
        Ok(Some(bar))
    }
}
