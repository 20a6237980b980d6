// arena-core: daily trading competition engine.
// live prices in, mark-to-market out, end-of-day settlement with prizes.
// the engine itself is synchronous; tokio tasks drive the feed, the 1s
// broadcast loop and the daily settlement.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: ids, Symbol, Direction, Level, Price, Quote, Timestamp
//   2.x  position.rs: simulated trade, close reasons, TP/SL trigger rules
//   3.x  entry.rs: competition entry + its positions, the close path
//   4.x  valuation.rs: pnl formulas, per-entry live capital
//   5.x  candle.rs: one-minute OHLC bars, CandleStore trait
//   6.x  price_cache.rs: latest price per symbol
//   7.x  config.rs: levels, limits, schedule, feed, advice, env presets
//   8.x  engine/: entries, open/close/edit, auto-close sweep, leaderboards
//   9.x  feed.rs: tick parsing, symbol map, websocket source, reconnect loop
//   10.x ledger.rs: in-memory persistence, per-entry locks
//   11.x events.rs: state transition events, audit log, push channel
//   12.x broadcast.rs: 1s valuation loop
//   13.x settlement.rs: daily ranking, prizes, rollover, pruning
//   14.x advice.rs: end-of-day advice text boundary
//   15.x runtime.rs: task wiring, start/stop

// domain
pub mod candle;
pub mod entry;
pub mod position;
pub mod price_cache;
pub mod types;
pub mod valuation;

// engine and state
pub mod engine;
pub mod events;
pub mod ledger;

// async services
pub mod advice;
pub mod broadcast;
pub mod config;
pub mod feed;
pub mod runtime;
pub mod settlement;

// re exports for convenience
pub use candle::*;
pub use engine::*;
pub use entry::*;
pub use events::*;
pub use position::*;
pub use price_cache::*;
pub use types::*;
pub use valuation::*;
pub use advice::{AdviceGenerator, HttpAdviceGenerator, PerformanceSummary, TemplateAdvice};
pub use broadcast::{BroadcastLoop, CycleReport};
pub use config::{ArenaConfig, ConfigError, Environment, FeedConfig, LevelConfig, TradingLimits};
pub use feed::{ChannelFeedHandle, ChannelTickSource, FeedError, FeedIngestor, RawTick, SymbolMap, TickSource, WsTickSource};
pub use ledger::{Ledger, Payout, SettledEntry, SettlementGate};
pub use runtime::Arena;
pub use settlement::{LevelSettlement, SettlementError, SettlementReport, SettlementScheduler};
