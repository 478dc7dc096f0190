mod support;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio::sync::watch;

use common::{Bar, BarSeries, BrokerAdapter, Config, Error, OrderAction, Outcome, Side, StrategyParams};
use engine::{LiveLoop, MemoryJournal, ReplayFeed};
use paper::{PaperBroker, PaperFeed};
use risk::RiskGovernor;

use support::{fast_policy, make_bars, make_config, make_paper, make_series, FlakyBroker, CLOSES};

fn make_loop(
    config: &Config,
    broker: Arc<dyn BrokerAdapter>,
    journal: &MemoryJournal,
) -> LiveLoop<ReplayFeed> {
    let (_tx, rx) = watch::channel(false);
    LiveLoop::new(
        config,
        broker,
        ReplayFeed::new(&BarSeries::new()),
        Box::new(journal.clone()),
        rx,
    )
    .with_retry_policy(fast_policy())
}

/// Move the paper price to the bar's close, then hand the bar to the loop.
async fn feed(
    live: &mut LiveLoop<ReplayFeed>,
    paper: &PaperBroker,
    bars: &[Bar],
) -> Vec<common::Result<Outcome>> {
    let mut outcomes = Vec::new();
    for bar in bars {
        paper.update_price("EUR_USD", bar.close).await;
        outcomes.push(live.on_bar(*bar).await);
    }
    outcomes
}

#[tokio::test]
async fn crossover_round_trip_through_paper_broker() {
    let config = make_config();
    let paper = make_paper();
    let journal = MemoryJournal::new();
    let mut live = make_loop(&config, paper.clone(), &journal);
    live.start().await.unwrap();

    feed(&mut live, &paper, &make_bars(&CLOSES, 0.0)).await;
    let records = journal.records().await;
    assert_eq!(records.len(), 10);

    assert_eq!(records[6].outcome, Outcome::Executed);
    assert_eq!(records[6].sizing.unwrap().size, 33.0);

    let reversal = &records[9];
    assert_eq!(reversal.outcome, Outcome::Executed);
    assert_eq!(reversal.orders.len(), 2);
    assert_eq!(reversal.orders[0].action, OrderAction::Close);
    assert_eq!(reversal.orders[0].realized_pnl, Some(-33.0));

    let position = paper.get_position("EUR_USD").await.unwrap().unwrap();
    assert_eq!(position.side, Side::Short);
    assert_eq!(position.size, 25.0);
    assert_eq!(position.stop_price, Some(11.0));
    assert_eq!(live.trader().position().unwrap().side, Side::Short);
    assert_eq!(paper.cash().await, 10_000.0 - 33.0);
}

#[tokio::test]
async fn journal_replay_reproduces_live_risk_state() {
    let config = make_config();
    let paper = make_paper();
    let journal = MemoryJournal::new();
    let mut live = make_loop(&config, paper.clone(), &journal);
    live.start().await.unwrap();
    feed(&mut live, &paper, &make_bars(&CLOSES, 0.0)).await;

    let records = journal.records().await;
    let replayed = RiskGovernor::replay(&config.risk, &records);
    assert!(replayed.is_some());
    assert_eq!(replayed, live.trader().risk_state());
    assert_eq!(records.last().unwrap().risk_state, replayed);
}

#[tokio::test]
async fn restart_resumes_without_repeating_bars() {
    let config = make_config();
    let bars = make_bars(&CLOSES, 0.0);

    // Uninterrupted reference run
    let paper_a = make_paper();
    let journal_a = MemoryJournal::new();
    let mut reference = make_loop(&config, paper_a.clone(), &journal_a);
    reference.start().await.unwrap();
    feed(&mut reference, &paper_a, &bars).await;

    // Same bars with a restart while the long is open
    let paper_b = make_paper();
    let journal_b = MemoryJournal::new();
    let mut first = make_loop(&config, paper_b.clone(), &journal_b);
    first.start().await.unwrap();
    feed(&mut first, &paper_b, &bars[..7]).await;
    first.shutdown().await.unwrap();
    drop(first);

    let history = journal_b.records().await;
    let mut second = make_loop(&config, paper_b.clone(), &journal_b);
    second.resume_from(&history).unwrap();
    second.start().await.unwrap();
    assert_eq!(second.trader().position().unwrap().size, 33.0);

    // The feed re-delivers everything; already seen bars are dropped
    let outcomes = feed(&mut second, &paper_b, &bars).await;
    assert!(outcomes[..7].iter().all(|o| matches!(o, Ok(Outcome::Skipped))));

    let records = journal_b.records().await;
    let bar_records = records.iter().filter(|r| r.bar.is_some()).count();
    assert_eq!(bar_records, bars.len());
    assert_eq!(second.trader().risk_state(), reference.trader().risk_state());
    assert_eq!(paper_b.cash().await, paper_a.cash().await);

    let a = paper_a.get_position("EUR_USD").await.unwrap().unwrap();
    let b = paper_b.get_position("EUR_USD").await.unwrap().unwrap();
    assert_eq!((a.side, a.size, a.entry_price), (b.side, b.size, b.entry_price));
}

#[tokio::test]
async fn lost_order_response_adopts_the_fill_once() {
    let config = make_config();
    let paper = make_paper();
    let broker = FlakyBroker::new(paper.clone());
    broker.lose_next_response.store(true, Ordering::SeqCst);
    let journal = MemoryJournal::new();
    let mut live = make_loop(&config, broker.clone(), &journal);
    live.start().await.unwrap();

    feed(&mut live, &paper, &make_bars(&CLOSES[..7], 0.0)).await;
    let entry = &journal.records().await[6];
    assert_eq!(entry.outcome, Outcome::Executed);
    assert!(entry.note.as_deref().unwrap_or_default().contains("adopted"));
    assert_eq!(broker.place_calls(), 1);
    assert_eq!(paper.orders_filled(), 1);
    assert_eq!(live.trader().position().unwrap().size, 33.0);
}

#[tokio::test]
async fn rejected_order_leaves_position_flat() {
    let config = make_config();
    let paper = make_paper();
    let broker = FlakyBroker::new(paper.clone());
    broker.reject_orders.store(true, Ordering::SeqCst);
    let journal = MemoryJournal::new();
    let mut live = make_loop(&config, broker.clone(), &journal);
    live.start().await.unwrap();

    let outcomes = feed(&mut live, &paper, &make_bars(&CLOSES[..8], 0.0)).await;
    assert!(matches!(outcomes[6], Ok(Outcome::Rejected)));
    assert!(matches!(outcomes[7], Ok(Outcome::Hold)));
    assert_eq!(broker.place_calls(), 1);
    assert!(live.trader().position().is_none());

    let entry = &journal.records().await[6];
    assert!(entry.orders[0].error.is_some());
}

#[tokio::test]
async fn equity_outage_becomes_fatal_after_consecutive_failures() {
    let config = make_config();
    let paper = make_paper();
    let broker = FlakyBroker::new(paper.clone());
    let journal = MemoryJournal::new();
    let mut live = make_loop(&config, broker.clone(), &journal);
    live.start().await.unwrap();
    broker.balance_down.store(true, Ordering::SeqCst);

    let outcomes = feed(&mut live, &paper, &make_bars(&CLOSES[..3], 0.0)).await;
    assert!(matches!(outcomes[0], Ok(Outcome::Missed)));
    assert!(matches!(outcomes[1], Ok(Outcome::Missed)));
    assert!(matches!(outcomes[2], Err(Error::BrokerConnectivity(_))));

    let records = journal.records().await;
    assert_eq!(records.len(), 3);
    assert!(records
        .iter()
        .all(|r| r.outcome == Outcome::Missed && r.bar.is_some() && r.equity_stale));
}

#[tokio::test]
async fn resume_after_missed_bar_matches_uninterrupted_run() {
    let config = make_config();
    let bars = make_bars(&CLOSES, 0.0);

    // Balance unreadable on bar 5, the bar before the golden cross
    let paper_a = make_paper();
    let broker_a = FlakyBroker::new(paper_a.clone());
    let journal_a = MemoryJournal::new();
    let mut reference = make_loop(&config, broker_a.clone(), &journal_a);
    reference.start().await.unwrap();
    feed(&mut reference, &paper_a, &bars[..5]).await;
    broker_a.balance_down.store(true, Ordering::SeqCst);
    feed(&mut reference, &paper_a, &bars[5..6]).await;
    broker_a.balance_down.store(false, Ordering::SeqCst);
    feed(&mut reference, &paper_a, &bars[6..]).await;

    // Same outage, then a restart straight after the missed bar
    let paper_b = make_paper();
    let broker_b = FlakyBroker::new(paper_b.clone());
    let journal_b = MemoryJournal::new();
    let mut first = make_loop(&config, broker_b.clone(), &journal_b);
    first.start().await.unwrap();
    feed(&mut first, &paper_b, &bars[..5]).await;
    broker_b.balance_down.store(true, Ordering::SeqCst);
    let missed = feed(&mut first, &paper_b, &bars[5..6]).await;
    assert!(matches!(missed[0], Ok(Outcome::Missed)));
    broker_b.balance_down.store(false, Ordering::SeqCst);
    first.shutdown().await.unwrap();
    drop(first);

    let history = journal_b.records().await;
    let missed_record = history.iter().find(|r| r.equity_stale).unwrap();
    assert_eq!(missed_record.bar, Some(bars[5]));

    let mut second = make_loop(&config, broker_b.clone(), &journal_b);
    second.resume_from(&history).unwrap();
    second.start().await.unwrap();
    assert_eq!(second.trader().last_bar_time(), Some(bars[5].timestamp));
    feed(&mut second, &paper_b, &bars).await;

    let signals = |records: &[common::JournalRecord]| -> Vec<_> {
        records
            .iter()
            .filter(|r| r.bar.is_some_and(|b| b.timestamp > bars[5].timestamp))
            .map(|r| (r.outcome, r.signal.map(|s| s.kind)))
            .collect()
    };
    let expected = signals(&journal_a.records().await);
    assert_eq!(expected.len(), 4);
    assert_eq!(expected[0].0, Outcome::Executed);
    assert_eq!(signals(&journal_b.records().await), expected);

    assert_eq!(second.trader().risk_state(), reference.trader().risk_state());
    let records = journal_b.records().await;
    assert_eq!(RiskGovernor::replay(&config.risk, &records), second.trader().risk_state());
    let a = paper_a.get_position("EUR_USD").await.unwrap().unwrap();
    let b = paper_b.get_position("EUR_USD").await.unwrap().unwrap();
    assert_eq!((a.side, a.size, a.stop_price), (b.side, b.size, b.stop_price));
}

#[tokio::test]
async fn recovered_bar_resets_the_failure_count() {
    let config = make_config();
    let paper = make_paper();
    let broker = FlakyBroker::new(paper.clone());
    let journal = MemoryJournal::new();
    let mut live = make_loop(&config, broker.clone(), &journal);
    live.start().await.unwrap();
    let bars = make_bars(&CLOSES, 0.0);

    for chunk in bars.chunks(3) {
        broker.balance_down.store(true, Ordering::SeqCst);
        let missed = feed(&mut live, &paper, &chunk[..chunk.len().min(2)]).await;
        assert!(missed.iter().all(|o| matches!(o, Ok(Outcome::Missed))));
        broker.balance_down.store(false, Ordering::SeqCst);
        let rest = feed(&mut live, &paper, &chunk[chunk.len().min(2)..]).await;
        assert!(rest.iter().all(|o| o.is_ok()));
    }
}

#[tokio::test]
async fn hung_broker_call_times_out() {
    let config = make_config();
    let paper = make_paper();
    let broker = FlakyBroker::new(paper.clone());
    let journal = MemoryJournal::new();
    let mut live = make_loop(&config, broker.clone(), &journal);
    live.start().await.unwrap();
    broker.hang.store(true, Ordering::SeqCst);

    let bar = make_bars(&CLOSES[..1], 0.0)[0];
    let outcome = tokio::time::timeout(Duration::from_secs(5), live.on_bar(bar))
        .await
        .expect("loop should not hang");
    assert!(matches!(outcome, Ok(Outcome::Missed)));
    let note = journal.records().await[0].note.clone().unwrap_or_default();
    assert!(note.contains("did not answer"));
}

#[tokio::test]
async fn zero_range_cross_places_no_order() {
    let mut config = make_config();
    config.strategy = StrategyParams {
        fast_window: 2,
        slow_window: 3,
        atr_window: 1,
        atr_multiplier: 2.0,
    };
    let paper = make_paper();
    let broker = FlakyBroker::new(paper.clone());
    let journal = MemoryJournal::new();
    let mut live = make_loop(&config, broker.clone(), &journal);
    live.start().await.unwrap();

    let start = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
    let bars: Vec<Bar> = [12.0, 8.0, 10.0, 10.0]
        .iter()
        .enumerate()
        .map(|(i, &c)| Bar::new(start + chrono::Duration::minutes(i as i64), c, c, c, c, 1.0))
        .collect();
    let outcomes = feed(&mut live, &paper, &bars).await;

    assert!(matches!(outcomes[3], Ok(Outcome::InvalidSizing)));
    assert_eq!(broker.place_calls(), 0);
    assert!(journal.records().await[3].orders.is_empty());
}

#[tokio::test]
async fn stop_signal_ends_run_with_shutdown_record() {
    let config = make_config();
    let paper = make_paper();
    let journal = MemoryJournal::new();
    let (tx, rx) = watch::channel(false);
    let source = PaperFeed::new(ReplayFeed::new(&make_series(&CLOSES, 0.0)), paper.clone());
    let live = LiveLoop::new(&config, paper.clone(), source, Box::new(journal.clone()), rx)
        .with_retry_policy(fast_policy())
        .with_poll_interval(Duration::from_millis(1));

    let watcher = journal.clone();
    let stopper = async move {
        while watcher.records().await.len() < CLOSES.len() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        tx.send(true).unwrap();
    };

    let (result, ()) = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(live.run(), stopper)
    })
    .await
    .expect("run should stop");
    result.unwrap();

    let records = journal.records().await;
    assert_eq!(records.len(), CLOSES.len() + 1);
    let last = records.last().unwrap();
    assert_eq!(last.outcome, Outcome::Shutdown);
    assert!(last.bar.is_none());
    assert_eq!(
        RiskGovernor::replay(&config.risk, &records),
        records[CLOSES.len() - 1].risk_state
    );
}
