use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Error, Result, TradingMode};

/// Run configuration, loaded once at startup from a TOML file and then
/// overridden by environment variables (`.env` is honoured).
///
/// Example `config/crossbot.toml`:
/// ```toml
/// instrument = "EUR_USD"
/// granularity = "M1"
/// trading_mode = "paper"
/// run_mode = "backtest"
///
/// [strategy]
/// fast_window = 20
/// slow_window = 50
///
/// [risk]
/// risk_per_trade = 0.005
/// day_boundary = "utc"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_instrument")]
    pub instrument: String,
    #[serde(default = "default_granularity")]
    pub granularity: String,
    /// Balance entry used as account equity. `None` sums every currency.
    #[serde(default)]
    pub account_currency: Option<String>,
    #[serde(default)]
    pub trading_mode: TradingMode,
    #[serde(default)]
    pub run_mode: RunMode,
    /// Log sink location: a JSONL file path, or `sqlite:<url>`.
    #[serde(default = "default_journal")]
    pub journal: String,
    #[serde(default)]
    pub strategy: StrategyParams,
    #[serde(default)]
    pub risk: RiskParams,
    #[serde(default)]
    pub execution: ExecutionParams,
    #[serde(default)]
    pub backtest: BacktestParams,
    #[serde(default)]
    pub paper: PaperParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Backtest,
    Live,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyParams {
    pub fast_window: usize,
    pub slow_window: usize,
    pub atr_window: usize,
    pub atr_multiplier: f64,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            fast_window: 20,
            slow_window: 50,
            atr_window: 14,
            atr_multiplier: 2.0,
        }
    }
}

impl StrategyParams {
    /// Bars needed before the first indicator snapshot exists.
    pub fn warmup(&self) -> usize {
        self.fast_window.max(self.slow_window).max(self.atr_window)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskParams {
    /// Fraction of equity risked per trade (e.g. 0.005 = 0.5%).
    pub risk_per_trade: f64,
    /// Realized daily loss, as a fraction of day-start equity, that halts trading.
    pub max_daily_drawdown: f64,
    /// Hard cap on order size in instrument units.
    pub units_cap: f64,
    /// Smallest tradable size step for the instrument.
    pub min_increment: f64,
    pub day_boundary: DayBoundary,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            risk_per_trade: 0.005,
            max_daily_drawdown: 0.02,
            units_cap: 20_000.0,
            min_increment: 1.0,
            day_boundary: DayBoundary::Utc,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionParams {
    pub poll_interval_secs: u64,
    pub broker_timeout_secs: u64,
    /// Attempts per broker call, the first one included.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Consecutive bars lost to retry exhaustion before the loop gives up.
    pub max_consecutive_failures: u32,
    /// Bars kept in memory by the live loop.
    pub history_limit: usize,
}

impl Default for ExecutionParams {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            broker_timeout_secs: 10,
            max_attempts: 4,
            base_backoff_ms: 500,
            max_backoff_ms: 8_000,
            max_consecutive_failures: 3,
            history_limit: 400,
        }
    }
}

impl ExecutionParams {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn broker_timeout(&self) -> Duration {
        Duration::from_secs(self.broker_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestParams {
    pub csv_path: Option<String>,
    pub initial_cash: f64,
    /// Commission charged on each fill, as a fraction of notional.
    pub commission_rate: f64,
}

impl Default for BacktestParams {
    fn default() -> Self {
        Self {
            csv_path: None,
            initial_cash: 10_000.0,
            commission_rate: 0.0002,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperParams {
    pub initial_balance: f64,
    pub slippage_bps: f64,
}

impl Default for PaperParams {
    fn default() -> Self {
        Self {
            initial_balance: 10_000.0,
            slippage_bps: 1.0,
        }
    }
}

/// Where one trading day ends and the next begins.
///
/// Serialized as `"utc"` or a fixed offset such as `"-05:00"` for
/// broker-local midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DayBoundary {
    #[default]
    Utc,
    Offset(FixedOffset),
}

impl DayBoundary {
    /// Trading date a timestamp belongs to.
    pub fn trading_day(&self, timestamp: DateTime<Utc>) -> NaiveDate {
        match self {
            DayBoundary::Utc => timestamp.date_naive(),
            DayBoundary::Offset(offset) => timestamp.with_timezone(offset).date_naive(),
        }
    }
}

impl TryFrom<String> for DayBoundary {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("utc") {
            return Ok(DayBoundary::Utc);
        }
        trimmed
            .parse::<FixedOffset>()
            .map(DayBoundary::Offset)
            .map_err(|e| Error::Config(format!("invalid day_boundary '{trimmed}': {e}")))
    }
}

impl From<DayBoundary> for String {
    fn from(value: DayBoundary) -> Self {
        match value {
            DayBoundary::Utc => "utc".to_string(),
            DayBoundary::Offset(offset) => offset.to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instrument: default_instrument(),
            granularity: default_granularity(),
            account_currency: None,
            trading_mode: TradingMode::default(),
            run_mode: RunMode::default(),
            journal: default_journal(),
            strategy: StrategyParams::default(),
            risk: RiskParams::default(),
            execution: ExecutionParams::default(),
            backtest: BacktestParams::default(),
            paper: PaperParams::default(),
        }
    }
}

impl Config {
    /// Load from a TOML file, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let _ = dotenvy::dotenv(); // ignore error if .env not present

        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read config at '{}': {e}", path.display()))
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        info!(
            path = %path.display(),
            instrument = %config.instrument,
            mode = %config.trading_mode,
            "Configuration loaded"
        );
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("failed to parse config: {e}")))
    }

    /// Override fields from `lookup` (normally the process environment).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("INSTRUMENT") {
            self.instrument = v;
        }
        if let Some(v) = lookup("GRANULARITY") {
            self.granularity = v;
        }
        if let Some(v) = lookup("JOURNAL_PATH") {
            self.journal = v;
        }
        if let Some(v) = lookup("TRADING_MODE") {
            self.trading_mode = match v.to_lowercase().as_str() {
                "paper" => TradingMode::Paper,
                "live" => TradingMode::Live,
                other => {
                    return Err(Error::Config(format!(
                        "TRADING_MODE must be 'paper' or 'live', got: '{other}'"
                    )))
                }
            };
        }
        override_parsed(&lookup, "RISK_PER_TRADE", &mut self.risk.risk_per_trade)?;
        override_parsed(&lookup, "MAX_DAILY_DRAWDOWN", &mut self.risk.max_daily_drawdown)?;
        override_parsed(&lookup, "UNITS_CAP", &mut self.risk.units_cap)?;
        override_parsed(&lookup, "FAST_SMA", &mut self.strategy.fast_window)?;
        override_parsed(&lookup, "SLOW_SMA", &mut self.strategy.slow_window)?;
        override_parsed(&lookup, "ATR_WINDOW", &mut self.strategy.atr_window)?;
        override_parsed(&lookup, "ATR_MULTIPLIER", &mut self.strategy.atr_multiplier)?;
        override_parsed(&lookup, "POLL_INTERVAL_SECS", &mut self.execution.poll_interval_secs)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.strategy;
        if s.fast_window == 0 || s.atr_window == 0 {
            return Err(Error::Config("indicator windows must be >= 1".into()));
        }
        if s.fast_window >= s.slow_window {
            return Err(Error::Config(format!(
                "fast_window ({}) must be smaller than slow_window ({})",
                s.fast_window, s.slow_window
            )));
        }
        if !(s.atr_multiplier > 0.0) {
            return Err(Error::Config("atr_multiplier must be > 0".into()));
        }

        let r = &self.risk;
        if !(r.risk_per_trade > 0.0 && r.risk_per_trade < 1.0) {
            return Err(Error::Config("risk_per_trade must be in (0, 1)".into()));
        }
        if !(r.max_daily_drawdown > 0.0 && r.max_daily_drawdown < 1.0) {
            return Err(Error::Config("max_daily_drawdown must be in (0, 1)".into()));
        }
        if !(r.units_cap > 0.0) || !(r.min_increment > 0.0) {
            return Err(Error::Config("units_cap and min_increment must be > 0".into()));
        }

        let e = &self.execution;
        if e.poll_interval_secs == 0 || e.max_attempts == 0 {
            return Err(Error::Config(
                "poll_interval_secs and max_attempts must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) -> Result<()> {
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{key} has an invalid value: '{raw}'")))?;
    }
    Ok(())
}

fn default_instrument() -> String {
    "EUR_USD".to_string()
}

fn default_granularity() -> String {
    "M1".to_string()
}

fn default_journal() -> String {
    "journal.jsonl".to_string()
}
