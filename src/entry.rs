// 3.0: competition entries. one user, one level, one trading day.
// an EntryBook is the unit of serialization: the entry plus every position it owns.
// all capital read-modify-writes happen on a locked book (see ledger.rs).

use crate::engine::TradingError;
use crate::position::{CloseReason, Position};
use crate::types::{EntryId, Level, PositionId, Price, Quote, Timestamp, UserId};
use crate::valuation::{pnl_amount, pnl_percent};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub user_id: UserId,
    pub level: Level,
    pub status: EntryStatus,
    // realized capital only, never includes open pnl
    pub virtual_capital: Quote,
    pub initial_capital: Quote,
    pub created_at: Timestamp,
}

impl Entry {
    pub fn new(
        id: EntryId,
        user_id: UserId,
        level: Level,
        initial_capital: Quote,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            user_id,
            level,
            status: EntryStatus::Pending,
            virtual_capital: initial_capital,
            initial_capital,
            created_at,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == EntryStatus::Confirmed
    }

    // (final - initial) / initial * 100
    pub fn return_percent(&self) -> Decimal {
        return_percent(self.virtual_capital, self.initial_capital)
    }
}

pub fn return_percent(capital: Quote, initial: Quote) -> Decimal {
    if initial.value().is_zero() {
        return Decimal::ZERO;
    }
    (capital.value() - initial.value()) / initial.value() * Decimal::ONE_HUNDRED
}

/// Outcome of one position close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedPosition {
    pub position: Position,
    pub exit_price: Price,
    pub pnl_percent: Decimal,
    pub pnl_amount: Quote,
    pub capital_after: Quote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryBook {
    pub entry: Entry,
    pub positions: Vec<Position>,
}

impl EntryBook {
    pub fn new(entry: Entry) -> Self {
        Self {
            entry,
            positions: Vec::new(),
        }
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.iter().filter(|p| p.is_open())
    }

    pub fn has_open_positions(&self) -> bool {
        self.positions.iter().any(Position::is_open)
    }

    pub fn open_lot(&self) -> Decimal {
        self.open_positions().map(|p| p.lot_size).sum()
    }

    // open lot ignoring one position, used by edits
    pub fn open_lot_excluding(&self, id: PositionId) -> Decimal {
        self.open_positions()
            .filter(|p| p.id != id)
            .map(|p| p.lot_size)
            .sum()
    }

    pub fn opened_on(&self, day: NaiveDate) -> usize {
        self.positions
            .iter()
            .filter(|p| p.opened_at.utc_day() == day)
            .count()
    }

    pub fn position(&self, id: PositionId) -> Option<&Position> {
        self.positions.iter().find(|p| p.id == id)
    }

    pub fn position_mut(&mut self, id: PositionId) -> Option<&mut Position> {
        self.positions.iter_mut().find(|p| p.id == id)
    }

    // 3.1: the one place capital moves on a close. pnl is computed against the
    // realized capital at the moment of closing, then added to it. a closed
    // position is rejected so capital is never adjusted twice.
    pub fn close_position(
        &mut self,
        id: PositionId,
        exit_price: Price,
        reason: CloseReason,
        at: Timestamp,
    ) -> Result<ClosedPosition, TradingError> {
        let capital = self.entry.virtual_capital;
        let entry_id = self.entry.id;
        let position = self
            .position_mut(id)
            .ok_or(TradingError::PositionNotFound(id))?;

        if !position.is_open() {
            return Err(TradingError::PositionAlreadyClosed(id));
        }

        let pct = pnl_percent(position.direction, position.entry_price, exit_price);
        let amount = pnl_amount(capital, position.lot_size, pct);
        position.mark_closed(exit_price, pct, reason, at);
        let closed = position.clone();

        self.entry.virtual_capital = capital.add(amount);

        tracing::debug!(
            entry_id = %entry_id,
            position_id = %id,
            reason = %reason,
            pnl_percent = %pct,
            capital = %self.entry.virtual_capital,
            "position closed"
        );

        Ok(ClosedPosition {
            position: closed,
            exit_price,
            pnl_percent: pct,
            pnl_amount: amount,
            capital_after: self.entry.virtual_capital,
        })
    }

    pub fn reset_capital(&mut self, initial: Quote) {
        self.entry.initial_capital = initial;
        self.entry.virtual_capital = initial;
    }

    // stats for the day, used by settlement summaries
    pub fn closed_on(&self, day: NaiveDate) -> impl Iterator<Item = &Position> {
        self.positions
            .iter()
            .filter(move |p| p.closed_at.map(|t| t.utc_day() == day).unwrap_or(false))
    }
}
