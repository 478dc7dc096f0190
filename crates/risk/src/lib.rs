pub mod governor;
pub mod sizer;

pub use governor::{GovernorStatus, RiskGovernor};
pub use sizer::{size_position, PositionSizer, SizeQuote};
