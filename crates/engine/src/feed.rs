use std::collections::VecDeque;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use common::{Bar, BarSeries, BarSource, Error, PriceSource, Result};

// ─── CSV history ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(alias = "date", alias = "time")]
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: f64,
}

/// Load a bar history from a CSV file with a
/// `timestamp,open,high,low,close,volume` header.
pub fn load_csv(path: impl AsRef<Path>) -> Result<BarSeries> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Data(format!("failed to read {}: {e}", path.display())))?;
    let series = parse_csv(file)?;
    info!(path = %path.display(), bars = series.len(), "Bar history loaded");
    Ok(series)
}

/// Parse CSV bars from any reader. Rows must already be in time order.
pub fn parse_csv(reader: impl Read) -> Result<BarSeries> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut bars = Vec::new();
    for (i, row) in rdr.deserialize::<CsvRow>().enumerate() {
        // Header is line 1
        let line = i + 2;
        let row = row.map_err(|e| Error::Data(format!("CSV line {line}: {e}")))?;
        let timestamp = parse_timestamp(&row.timestamp)
            .ok_or_else(|| Error::Data(format!("CSV line {line}: bad timestamp '{}'", row.timestamp)))?;
        bars.push(Bar::new(timestamp, row.open, row.high, row.low, row.close, row.volume));
    }
    BarSeries::from_bars(bars)
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC) or a bare `YYYY-MM-DD` date.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(ts.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ts| ts.and_utc())
}

/// Bar length for an OANDA-style granularity code (`S5`, `M1`, `M15`, `H4`, `D`).
pub fn granularity_period(code: &str) -> Result<Duration> {
    let bad = || Error::Config(format!("unknown granularity '{code}'"));
    if code == "D" {
        return Ok(Duration::days(1));
    }
    if code.len() < 2 {
        return Err(bad());
    }
    let (unit, count) = code.split_at(1);
    let count: i64 = count.parse().map_err(|_| bad())?;
    if count <= 0 {
        return Err(bad());
    }
    match unit {
        "S" => Ok(Duration::seconds(count)),
        "M" => Ok(Duration::minutes(count)),
        "H" => Ok(Duration::hours(count)),
        _ => Err(bad()),
    }
}

// ─── Replay ──────────────────────────────────────────────────────────────────

/// Hands out a fixed series one bar per poll, then reports no new bar.
pub struct ReplayFeed {
    bars: VecDeque<Bar>,
}

impl ReplayFeed {
    pub fn new(series: &BarSeries) -> Self {
        Self {
            bars: series.iter().copied().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.bars.len()
    }
}

#[async_trait]
impl BarSource for ReplayFeed {
    async fn get_latest_bar(&mut self, _instrument: &str, _granularity: &str) -> Result<Option<Bar>> {
        Ok(self.bars.pop_front())
    }
}

// ─── Tick aggregation ────────────────────────────────────────────────────────

/// Builds fixed-length candles from a stream of price observations.
///
/// A candle is emitted once an observation lands in a later bucket. Volume
/// counts observations, as price-only sources carry no traded volume.
#[derive(Debug, Clone)]
pub struct CandleAggregator {
    period: Duration,
    current: Option<Bar>,
}

impl CandleAggregator {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            current: None,
        }
    }

    fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let period = self.period.num_seconds().max(1);
        let secs = ts.timestamp().div_euclid(period) * period;
        DateTime::from_timestamp(secs, 0).unwrap_or(ts)
    }

    /// Feed one observation; returns the previous candle if this one closed it.
    pub fn push(&mut self, ts: DateTime<Utc>, price: f64) -> Option<Bar> {
        let bucket = self.bucket_start(ts);
        let fresh = Bar::new(bucket, price, price, price, price, 1.0);
        let Some(bar) = self.current.as_mut() else {
            self.current = Some(fresh);
            return None;
        };
        if bucket == bar.timestamp {
            bar.high = bar.high.max(price);
            bar.low = bar.low.min(price);
            bar.close = price;
            bar.volume += 1.0;
            return None;
        }
        if bucket < bar.timestamp {
            debug!(%ts, "Late price observation ignored");
            return None;
        }
        self.current.replace(fresh)
    }
}

type Clock = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// `BarSource` over a `PriceSource`: each poll samples the latest price and
/// returns a candle when one completes.
pub struct TickFeed {
    source: Arc<dyn PriceSource>,
    aggregator: CandleAggregator,
    clock: Clock,
}

impl TickFeed {
    pub fn new(source: Arc<dyn PriceSource>, period: Duration) -> Self {
        Self::with_clock(source, period, Box::new(Utc::now))
    }

    pub fn with_clock(source: Arc<dyn PriceSource>, period: Duration, clock: Clock) -> Self {
        Self {
            source,
            aggregator: CandleAggregator::new(period),
            clock,
        }
    }
}

#[async_trait]
impl BarSource for TickFeed {
    async fn get_latest_bar(&mut self, instrument: &str, _granularity: &str) -> Result<Option<Bar>> {
        let Some(price) = self.source.latest_price(instrument).await? else {
            return Ok(None);
        };
        Ok(self.aggregator.push((self.clock)(), price))
    }
}
