pub mod indicators;
pub mod signal;

pub use indicators::{compute, IndicatorEngine};
pub use signal::{detect_crossover, SignalGenerator};
