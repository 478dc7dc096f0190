#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use common::{
    Bar, BarSeries, BrokerAdapter, Config, Error, OrderResult, OrderSide, Position, Result,
    RiskParams, StrategyParams, TradingMode,
};
use engine::RetryPolicy;
use paper::PaperBroker;

/// Falls, crosses golden on index 6, crosses death on index 9.
pub const CLOSES: [f64; 10] = [10.0, 9.75, 9.5, 9.25, 9.0, 9.5, 10.0, 10.5, 9.5, 9.0];

pub fn make_config() -> Config {
    let mut config = Config::default();
    config.instrument = "EUR_USD".into();
    config.account_currency = Some("USD".into());
    config.strategy = StrategyParams {
        fast_window: 2,
        slow_window: 4,
        atr_window: 2,
        atr_multiplier: 2.0,
    };
    config.risk = RiskParams {
        risk_per_trade: 0.005,
        max_daily_drawdown: 0.02,
        ..RiskParams::default()
    };
    config.execution.max_attempts = 2;
    config.execution.max_consecutive_failures = 3;
    config.backtest.initial_cash = 10_000.0;
    config.backtest.commission_rate = 0.0;
    config
}

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy::new(
        Duration::from_millis(50),
        2,
        Duration::from_millis(1),
        Duration::from_millis(2),
    )
}

/// One-minute bars around `closes`: high/low a quarter above and below the
/// close, opening `open_offset` above the previous close.
pub fn make_bars(closes: &[f64], open_offset: f64) -> Vec<Bar> {
    let start = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
    let mut prev = closes[0];
    closes
        .iter()
        .enumerate()
        .map(|(i, &c)| {
            let bar = Bar::new(
                start + chrono::Duration::minutes(i as i64),
                prev + open_offset,
                c + 0.25,
                c - 0.25,
                c,
                100.0,
            );
            prev = c;
            bar
        })
        .collect()
}

pub fn make_series(closes: &[f64], open_offset: f64) -> BarSeries {
    BarSeries::from_bars(make_bars(closes, open_offset)).unwrap()
}

pub fn make_paper() -> Arc<PaperBroker> {
    Arc::new(PaperBroker::new("USD", 10_000.0, 0.0))
}

/// Paper broker with switchable faults.
pub struct FlakyBroker {
    pub inner: Arc<PaperBroker>,
    /// Balance calls fail while set.
    pub balance_down: AtomicBool,
    /// Balance calls never answer while set.
    pub hang: AtomicBool,
    /// The next order is placed but its response is lost.
    pub lose_next_response: AtomicBool,
    /// Orders are refused while set.
    pub reject_orders: AtomicBool,
    pub place_calls: AtomicU32,
}

impl FlakyBroker {
    pub fn new(inner: Arc<PaperBroker>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            balance_down: AtomicBool::new(false),
            hang: AtomicBool::new(false),
            lose_next_response: AtomicBool::new(false),
            reject_orders: AtomicBool::new(false),
            place_calls: AtomicU32::new(0),
        })
    }

    pub fn place_calls(&self) -> u32 {
        self.place_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerAdapter for FlakyBroker {
    fn name(&self) -> &str {
        "flaky-paper"
    }

    fn mode(&self) -> TradingMode {
        TradingMode::Paper
    }

    async fn connect(&self) -> Result<bool> {
        self.inner.connect().await
    }

    async fn get_balance(&self) -> Result<HashMap<String, f64>> {
        if self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if self.balance_down.load(Ordering::SeqCst) {
            return Err(Error::BrokerConnectivity("connection reset".into()));
        }
        self.inner.get_balance().await
    }

    async fn get_position(&self, instrument: &str) -> Result<Option<Position>> {
        self.inner.get_position(instrument).await
    }

    async fn place_order(
        &self,
        instrument: &str,
        side: OrderSide,
        size: f64,
        stop_loss: Option<f64>,
    ) -> Result<OrderResult> {
        self.place_calls.fetch_add(1, Ordering::SeqCst);
        if self.reject_orders.load(Ordering::SeqCst) {
            return Err(Error::OrderRejected {
                reason: "market closed".into(),
            });
        }
        let result = self.inner.place_order(instrument, side, size, stop_loss).await?;
        if self.lose_next_response.swap(false, Ordering::SeqCst) {
            return Err(Error::Timeout("place_order response lost".into()));
        }
        Ok(result)
    }

    async fn close_position(&self, instrument: &str) -> Result<OrderResult> {
        self.inner.close_position(instrument).await
    }
}
