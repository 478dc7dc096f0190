pub mod backtest;
pub mod feed;
pub mod journal;
pub mod live;
pub mod retry;
pub mod trader;

pub use backtest::{BacktestReport, BacktestRunner, Trade};
pub use feed::{granularity_period, load_csv, parse_csv, CandleAggregator, ReplayFeed, TickFeed};
pub use journal::{load_history, open_journal, Journal, JsonlJournal, MemoryJournal, SqliteJournal};
pub use live::LiveLoop;
pub use retry::RetryPolicy;
pub use trader::Trader;
