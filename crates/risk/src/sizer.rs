use common::{Error, PositionSizing, Result, RiskParams, Side};

/// Size before and after the cap and increment rounding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizeQuote {
    pub risk_amount: f64,
    /// `risk_amount / stop_distance`, before capping.
    pub raw_size: f64,
    /// Capped at `units_cap` and floored to `min_increment`.
    pub size: f64,
}

const INCREMENT_TOLERANCE: f64 = 1e-9;

/// Risk-based sizing: lose at most `equity * risk_per_trade` if the stop is hit.
///
/// Fails with `InvalidSizing` when the stop distance is not positive (flat
/// prices give a zero ATR) or when the result rounds down to nothing.
pub fn size_position(
    equity: f64,
    risk_per_trade: f64,
    stop_distance: f64,
    units_cap: f64,
    min_increment: f64,
) -> Result<SizeQuote> {
    if !(stop_distance > 0.0) || !stop_distance.is_finite() {
        return Err(Error::InvalidSizing(format!(
            "stop distance must be positive, got {stop_distance}"
        )));
    }
    if !(equity > 0.0) {
        return Err(Error::InvalidSizing(format!(
            "equity must be positive, got {equity}"
        )));
    }

    let risk_amount = equity * risk_per_trade;
    let raw_size = risk_amount / stop_distance;
    let capped = raw_size.min(units_cap);
    // Absorb representation error so an exact multiple (2.3 / 0.1) keeps its last step
    let steps = (capped / min_increment + INCREMENT_TOLERANCE).floor();
    let size = (steps * min_increment).min(units_cap);

    if size <= 0.0 {
        return Err(Error::InvalidSizing(format!(
            "size {capped} is below the minimum increment {min_increment}"
        )));
    }

    Ok(SizeQuote {
        risk_amount,
        raw_size,
        size,
    })
}

/// Turns an entry decision into an order size and protective stop.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    risk_per_trade: f64,
    atr_multiplier: f64,
    units_cap: f64,
    min_increment: f64,
}

impl PositionSizer {
    pub fn new(risk: &RiskParams, atr_multiplier: f64) -> Self {
        Self {
            risk_per_trade: risk.risk_per_trade,
            atr_multiplier,
            units_cap: risk.units_cap,
            min_increment: risk.min_increment,
        }
    }

    /// Stop sits `atr * atr_multiplier` away from `entry_price`, below for
    /// longs and above for shorts.
    pub fn plan(&self, side: Side, equity: f64, entry_price: f64, atr: f64) -> Result<PositionSizing> {
        let stop_distance = atr * self.atr_multiplier;
        let quote = size_position(
            equity,
            self.risk_per_trade,
            stop_distance,
            self.units_cap,
            self.min_increment,
        )?;
        let stop_price = match side {
            Side::Long => entry_price - stop_distance,
            Side::Short => entry_price + stop_distance,
        };
        Ok(PositionSizing {
            size: quote.size,
            stop_price,
            risk_amount: quote.risk_amount,
        })
    }
}
