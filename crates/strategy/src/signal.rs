use common::{Crossover, ExitReason, IndicatorSnapshot, Position, Side, Signal, SignalKind};

/// Classify the move between two consecutive snapshots.
///
/// Golden: fast was at or below slow and is now strictly above.
/// Death: fast was at or above slow and is now strictly below.
pub fn detect_crossover(prev: &IndicatorSnapshot, curr: &IndicatorSnapshot) -> Crossover {
    if prev.fast_sma <= prev.slow_sma && curr.fast_sma > curr.slow_sma {
        Crossover::Golden
    } else if prev.fast_sma >= prev.slow_sma && curr.fast_sma < curr.slow_sma {
        Crossover::Death
    } else {
        Crossover::None
    }
}

/// Turns indicator snapshots into discrete trade signals.
///
/// Stateless: the caller keeps the previous snapshot and the position mirror.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalGenerator;

impl SignalGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Decide what to do on the bar behind `curr`.
    ///
    /// A stop breach on an open position always wins, even when the same bar
    /// also crosses the other way. An entry in the direction of the open
    /// position is ignored; an entry against it is returned as-is and the
    /// executor closes before opening.
    pub fn next_signal(
        &self,
        prev: Option<&IndicatorSnapshot>,
        curr: &IndicatorSnapshot,
        position: Option<&Position>,
    ) -> Signal {
        let crossover = prev
            .map(|p| detect_crossover(p, curr))
            .unwrap_or(Crossover::None);

        if let Some(pos) = position {
            if pos.stop_breached(curr.close) {
                return Signal {
                    timestamp: curr.timestamp,
                    kind: SignalKind::Exit {
                        reason: ExitReason::StopLoss,
                    },
                    crossover,
                };
            }
        }

        let wanted = match crossover {
            Crossover::Golden => Side::Long,
            Crossover::Death => Side::Short,
            Crossover::None => return Signal::hold(curr.timestamp, crossover),
        };

        if position.is_some_and(|p| p.side == wanted) {
            return Signal::hold(curr.timestamp, crossover);
        }

        let kind = match wanted {
            Side::Long => SignalKind::LongEntry,
            Side::Short => SignalKind::ShortEntry,
        };
        Signal {
            timestamp: curr.timestamp,
            kind,
            crossover,
        }
    }
}
