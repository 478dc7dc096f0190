use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use common::{Config, RunMode, TradingMode};
use engine::{load_csv, load_history, open_journal, BacktestRunner, LiveLoop, ReplayFeed};
use paper::{PaperBroker, PaperFeed};

const DEFAULT_CONFIG_PATH: &str = "config/crossbot.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Logging ──────────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ────────────────────────────────────────────────────────────────
    let path = std::env::var("CROSSBOT_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let cfg = Config::load(&path).with_context(|| format!("loading {path}"))?;
    info!(
        instrument = %cfg.instrument,
        mode = %cfg.trading_mode,
        run_mode = ?cfg.run_mode,
        "Crossbot starting"
    );

    match cfg.run_mode {
        RunMode::Backtest => backtest(&cfg).await,
        RunMode::Live => live(&cfg).await,
    }
}

fn csv_path(cfg: &Config) -> anyhow::Result<&str> {
    cfg.backtest
        .csv_path
        .as_deref()
        .context("backtest.csv_path must name a bar history file")
}

async fn backtest(cfg: &Config) -> anyhow::Result<()> {
    let bars = load_csv(csv_path(cfg)?)?;
    let mut journal = open_journal(&cfg.journal).await?;

    let report = BacktestRunner::new(cfg).run(&bars, journal.as_mut()).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn live(cfg: &Config) -> anyhow::Result<()> {
    if cfg.trading_mode == TradingMode::Live {
        bail!("no live broker adapter is built in; set trading_mode = \"paper\"");
    }

    // ── Broker + feed ─────────────────────────────────────────────────────────
    let currency = cfg.account_currency.clone().unwrap_or_else(|| "USD".into());
    let broker = Arc::new(PaperBroker::from_params(currency, &cfg.paper));
    let bars = load_csv(csv_path(cfg)?)?;
    let source = PaperFeed::new(ReplayFeed::new(&bars), broker.clone());

    // ── Journal ───────────────────────────────────────────────────────────────
    let history = load_history(&cfg.journal, &cfg.instrument).await?;
    let journal = open_journal(&cfg.journal).await?;

    // ── Shutdown ──────────────────────────────────────────────────────────────
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            return;
        }
        info!("Shutdown signal received");
        let _ = stop_tx.send(true);
    });

    let mut live = LiveLoop::new(cfg, broker, source, journal, stop_rx);
    live.resume_from(&history)?;
    live.run().await?;
    info!("Crossbot stopped");
    Ok(())
}
