pub mod broker;
pub mod config;
pub mod error;
pub mod record;
pub mod types;

pub use broker::{equity_from_balance, BarSource, BrokerAdapter, PriceSource, SerializedBroker};
pub use config::{
    BacktestParams, Config, DayBoundary, ExecutionParams, PaperParams, RiskParams, RunMode,
    StrategyParams,
};
pub use error::{Error, Result};
pub use record::{JournalRecord, OrderAction, OrderRecord, Outcome};
pub use types::*;
