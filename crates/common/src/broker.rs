use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{Bar, OrderResult, OrderSide, Position, Result, TradingMode};

/// Capability surface every broker integration exposes to the core.
///
/// One implementation per broker, chosen once at startup. The core only
/// depends on this trait. Paper vs live is a property of the adapter
/// (`mode()`), never a branch inside the trading loop.
///
/// Connectivity problems must surface as `Error::BrokerConnectivity`,
/// `Error::Timeout` or `Error::RateLimited`; a broker refusing an order is
/// `Error::OrderRejected`. Adapters are not assumed reentrant, see
/// [`SerializedBroker`].
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    fn mode(&self) -> TradingMode;

    /// Check credentials and reachability. `Ok(false)` means reachable but refused.
    async fn connect(&self) -> Result<bool>;

    /// Balances keyed by currency code.
    async fn get_balance(&self) -> Result<HashMap<String, f64>>;

    /// Open position for `instrument`, if any.
    async fn get_position(&self, instrument: &str) -> Result<Option<Position>>;

    /// Submit a market order with an optional protective stop.
    async fn place_order(
        &self,
        instrument: &str,
        side: OrderSide,
        size: f64,
        stop_loss: Option<f64>,
    ) -> Result<OrderResult>;

    /// Flatten the whole position in `instrument`.
    async fn close_position(&self, instrument: &str) -> Result<OrderResult>;
}

/// Live bar polling. `Ok(None)` means no new bar yet.
#[async_trait]
pub trait BarSource: Send {
    async fn get_latest_bar(&mut self, instrument: &str, granularity: &str)
        -> Result<Option<Bar>>;
}

/// Last traded (or mid) price, for sources that only quote prices.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn latest_price(&self, instrument: &str) -> Result<Option<f64>>;
}

/// Account equity from a balance map: the configured currency if given,
/// otherwise the sum of every balance.
pub fn equity_from_balance(balance: &HashMap<String, f64>, currency: Option<&str>) -> f64 {
    match currency {
        Some(code) => balance.get(code).copied().unwrap_or(0.0),
        None => balance.values().sum(),
    }
}

/// Wraps an adapter so that callers sharing one connection take turns.
///
/// Every call holds the lock for its full duration, which keeps a
/// non-reentrant client safe when several strategy instances share it.
pub struct SerializedBroker<B> {
    inner: B,
    gate: Mutex<()>,
}

impl<B: BrokerAdapter> SerializedBroker<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            gate: Mutex::new(()),
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }
}

#[async_trait]
impl<B: BrokerAdapter> BrokerAdapter for SerializedBroker<B> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn mode(&self) -> TradingMode {
        self.inner.mode()
    }

    async fn connect(&self) -> Result<bool> {
        let _guard = self.gate.lock().await;
        self.inner.connect().await
    }

    async fn get_balance(&self) -> Result<HashMap<String, f64>> {
        let _guard = self.gate.lock().await;
        self.inner.get_balance().await
    }

    async fn get_position(&self, instrument: &str) -> Result<Option<Position>> {
        let _guard = self.gate.lock().await;
        self.inner.get_position(instrument).await
    }

    async fn place_order(
        &self,
        instrument: &str,
        side: OrderSide,
        size: f64,
        stop_loss: Option<f64>,
    ) -> Result<OrderResult> {
        let _guard = self.gate.lock().await;
        self.inner.place_order(instrument, side, size, stop_loss).await
    }

    async fn close_position(&self, instrument: &str) -> Result<OrderResult> {
        let _guard = self.gate.lock().await;
        self.inner.close_position(instrument).await
    }
}
