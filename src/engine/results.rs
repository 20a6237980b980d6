// 8.0.2: result types and errors for engine operations.

use crate::entry::EntryStatus;
use crate::position::{CloseReason, TargetError};
use crate::types::{EntryId, Level, PositionId, Price, Quote, Symbol, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One position closed by the take-profit / stop-loss sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoCloseResult {
    pub position_id: PositionId,
    pub entry_id: EntryId,
    pub user_id: UserId,
    pub symbol: Symbol,
    pub reason: CloseReason,
    pub exit_price: Price,
    pub pnl_percent: Decimal,
    pub pnl_amount: Quote,
    pub capital_after: Quote,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TradingError {
    #[error("Entry {0} not found")]
    EntryNotFound(EntryId),

    #[error("Position {0} not found")]
    PositionNotFound(PositionId),

    #[error("Position {0} is already closed")]
    PositionAlreadyClosed(PositionId),

    #[error("User {user_id} already holds an active {level} entry")]
    DuplicateEntry { user_id: UserId, level: Level },

    #[error("Entry {entry_id} is {status:?}, trading needs a confirmed entry")]
    EntryNotConfirmed { entry_id: EntryId, status: EntryStatus },

    #[error("Lot size {lot} outside [{min}, {max}] or not a multiple of {step}")]
    InvalidLotSize {
        lot: Decimal,
        min: Decimal,
        max: Decimal,
        step: Decimal,
    },

    #[error("Open lot would be {requested}, limit is {limit}")]
    LotLimitExceeded { requested: Decimal, limit: Decimal },

    #[error("Daily limit of {limit} opened positions reached")]
    DailyLimitReached { limit: usize },

    #[error("Lot can only shrink: current {current}, requested {requested}")]
    LotIncrease { current: Decimal, requested: Decimal },

    #[error("Level {0} is settling, no new positions until it finishes")]
    LevelSettling(Level),

    #[error("No current price for {0}")]
    NoPrice(Symbol),

    #[error("Invalid target: {0}")]
    Target(#[from] TargetError),
}
