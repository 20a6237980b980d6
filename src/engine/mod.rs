// 8.0: core trading engine. coordinates entry lifecycle, manual trading,
// take-profit / stop-loss sweeps and live valuation.
// synchronous; the async loops in broadcast.rs and settlement.rs drive it.

mod auto_close;
mod core;
mod entries;
mod results;
mod trading;

pub use core::Engine;
pub use results::{AutoCloseResult, TradingError};
pub use trading::{EditRequest, OpenRequest};
