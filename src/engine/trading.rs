//! Manual position operations: open, close, edit.
//!
//! Lot shape and TP/SL sides are checked up front. The per-entry limits run
//! inside the entry lock together with the mutation, so a rejected request
//! never leaves partial state and two requests on the same entry cannot both
//! pass the lot or daily limits.

use super::core::Engine;
use super::results::TradingError;
use crate::config::TradingLimits;
use crate::entry::ClosedPosition;
use crate::events::{EventPayload, PositionClosedEvent, PositionEditedEvent, PositionOpenedEvent};
use crate::position::{validate_targets, CloseReason, Position};
use crate::price_cache::PriceLookup;
use crate::types::{Direction, EntryId, PositionId, Price, Symbol, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenRequest {
    pub entry_id: EntryId,
    pub symbol: Symbol,
    pub direction: Direction,
    pub lot_size: Decimal,
    pub take_profit: Option<Price>,
    pub stop_loss: Option<Price>,
}

impl OpenRequest {
    pub fn new(entry_id: EntryId, symbol: Symbol, direction: Direction, lot_size: Decimal) -> Self {
        Self {
            entry_id,
            symbol,
            direction,
            lot_size,
            take_profit: None,
            stop_loss: None,
        }
    }

    pub fn with_take_profit(mut self, price: Price) -> Self {
        self.take_profit = Some(price);
        self
    }

    pub fn with_stop_loss(mut self, price: Price) -> Self {
        self.stop_loss = Some(price);
        self
    }
}

// None leaves the field as it is
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EditRequest {
    pub lot_size: Option<Decimal>,
    pub take_profit: Option<Price>,
    pub stop_loss: Option<Price>,
}

fn check_lot(limits: &TradingLimits, lot: Decimal) -> Result<(), TradingError> {
    let on_step = (lot % limits.lot_step).is_zero();
    if lot < limits.min_lot || lot > limits.max_lot || !on_step {
        return Err(TradingError::InvalidLotSize {
            lot,
            min: limits.min_lot,
            max: limits.max_lot,
            step: limits.lot_step,
        });
    }
    Ok(())
}

impl Engine {
    // 8.3: open at the current cached price
    pub fn open_position(&self, request: OpenRequest, at: Timestamp) -> Result<Position, TradingError> {
        let limits = &self.config.limits;
        check_lot(limits, request.lot_size)?;

        let price = self
            .prices
            .price(&request.symbol)
            .ok_or_else(|| TradingError::NoPrice(request.symbol.clone()))?;
        validate_targets(request.direction, price, request.take_profit, request.stop_loss)?;

        let position = self.ledger.with_book(request.entry_id, |book| {
            if !book.entry.is_confirmed() {
                return Err(TradingError::EntryNotConfirmed {
                    entry_id: book.entry.id,
                    status: book.entry.status,
                });
            }
            if self.ledger.is_settling(book.entry.level) {
                return Err(TradingError::LevelSettling(book.entry.level));
            }

            let requested = book.open_lot() + request.lot_size;
            if requested > limits.max_open_lot {
                return Err(TradingError::LotLimitExceeded {
                    requested,
                    limit: limits.max_open_lot,
                });
            }
            if book.opened_on(at.utc_day()) >= limits.max_positions_per_day {
                return Err(TradingError::DailyLimitReached {
                    limit: limits.max_positions_per_day,
                });
            }

            let position = Position::new(
                self.ledger.next_position_id(),
                book.entry.id,
                request.symbol.clone(),
                request.direction,
                request.lot_size,
                price,
                request.take_profit,
                request.stop_loss,
                at,
            );
            book.positions.push(position.clone());
            self.ledger.index_position(position.id, book.entry.id);
            Ok(position)
        })??;

        tracing::info!(
            entry_id = %position.entry_id,
            position_id = %position.id,
            symbol = %position.symbol,
            direction = %position.direction,
            lot = %position.lot_size,
            price = %price,
            "position opened"
        );
        self.emit(
            at,
            EventPayload::PositionOpened(PositionOpenedEvent {
                position_id: position.id,
                entry_id: position.entry_id,
                symbol: position.symbol.clone(),
                direction: position.direction,
                lot_size: position.lot_size,
                entry_price: position.entry_price,
                take_profit: position.take_profit,
                stop_loss: position.stop_loss,
            }),
        );
        Ok(position)
    }

    // 8.4: manual close at the current cached price
    pub fn close_position(
        &self,
        position_id: PositionId,
        at: Timestamp,
    ) -> Result<ClosedPosition, TradingError> {
        let entry_id = self
            .ledger
            .entry_for_position(position_id)
            .ok_or(TradingError::PositionNotFound(position_id))?;

        let closed = self.ledger.with_book(entry_id, |book| {
            let position = book
                .position(position_id)
                .ok_or(TradingError::PositionNotFound(position_id))?;
            if !position.is_open() {
                return Err(TradingError::PositionAlreadyClosed(position_id));
            }
            let price = self
                .prices
                .price(&position.symbol)
                .ok_or_else(|| TradingError::NoPrice(position.symbol.clone()))?;
            book.close_position(position_id, price, CloseReason::Manual, at)
        })??;

        self.emit_closed(&closed, at);
        Ok(closed)
    }

    pub(super) fn emit_closed(&self, closed: &ClosedPosition, at: Timestamp) {
        let position = &closed.position;
        self.emit(
            at,
            EventPayload::PositionClosed(PositionClosedEvent {
                position_id: position.id,
                entry_id: position.entry_id,
                exit_price: closed.exit_price,
                pnl_percent: closed.pnl_percent,
                pnl_amount: closed.pnl_amount,
                capital_after: closed.capital_after,
                close_reason: position.close_reason.unwrap_or(CloseReason::Manual),
            }),
        );
    }

    // 8.5: shrink the lot and/or replace targets. targets are checked against the
    // live price when there is one, otherwise against the entry price.
    pub fn edit_position(
        &self,
        position_id: PositionId,
        edit: EditRequest,
        at: Timestamp,
    ) -> Result<Position, TradingError> {
        let limits = &self.config.limits;
        let entry_id = self
            .ledger
            .entry_for_position(position_id)
            .ok_or(TradingError::PositionNotFound(position_id))?;

        let (old_lot, position) = self.ledger.with_book(entry_id, |book| {
            let current = book
                .position(position_id)
                .ok_or(TradingError::PositionNotFound(position_id))?;
            if !current.is_open() {
                return Err(TradingError::PositionAlreadyClosed(position_id));
            }
            let old_lot = current.lot_size;

            if let Some(lot) = edit.lot_size {
                check_lot(limits, lot)?;
                if lot > old_lot {
                    return Err(TradingError::LotIncrease {
                        current: old_lot,
                        requested: lot,
                    });
                }
                let requested = book.open_lot_excluding(position_id) + lot;
                if requested > limits.max_open_lot {
                    return Err(TradingError::LotLimitExceeded {
                        requested,
                        limit: limits.max_open_lot,
                    });
                }
            }

            let reference = self.prices.price(&current.symbol).unwrap_or(current.entry_price);
            validate_targets(current.direction, reference, edit.take_profit, edit.stop_loss)?;

            let position = book
                .position_mut(position_id)
                .ok_or(TradingError::PositionNotFound(position_id))?;
            if let Some(lot) = edit.lot_size {
                position.lot_size = lot;
            }
            if edit.take_profit.is_some() {
                position.take_profit = edit.take_profit;
            }
            if edit.stop_loss.is_some() {
                position.stop_loss = edit.stop_loss;
            }
            Ok((old_lot, position.clone()))
        })??;

        tracing::info!(
            entry_id = %entry_id,
            position_id = %position_id,
            old_lot = %old_lot,
            new_lot = %position.lot_size,
            "position edited"
        );
        self.emit(
            at,
            EventPayload::PositionEdited(PositionEditedEvent {
                position_id,
                entry_id,
                old_lot_size: old_lot,
                new_lot_size: position.lot_size,
                take_profit: position.take_profit,
                stop_loss: position.stop_loss,
            }),
        );
        Ok(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArenaConfig;
    use crate::types::{Level, UserId};
    use rust_decimal_macros::dec;

    fn px(v: Decimal) -> Price {
        Price::new_unchecked(v)
    }

    fn ts(ms: i64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    fn setup() -> (Engine, EntryId) {
        let engine = Engine::new(ArenaConfig::default());
        let entry = engine.register_entry(UserId(1), Level::Basic, ts(0)).unwrap();
        engine.confirm_entry(entry.id, ts(0)).unwrap();
        engine.prices().update(Symbol::from("EURUSD"), px(dec!(1.1000)), ts(0));
        (engine, entry.id)
    }

    fn open(engine: &Engine, entry_id: EntryId, lot: Decimal) -> Result<Position, TradingError> {
        engine.open_position(
            OpenRequest::new(entry_id, Symbol::from("EURUSD"), Direction::Long, lot),
            ts(1_000),
        )
    }

    #[test]
    fn open_at_current_price() {
        let (engine, entry_id) = setup();
        let pos = open(&engine, entry_id, dec!(0.5)).unwrap();
        assert_eq!(pos.entry_price.value(), dec!(1.1000));
        assert!(pos.is_open());
        assert_eq!(engine.ledger().entry_for_position(pos.id), Some(entry_id));
    }

    #[test]
    fn open_requires_confirmed_entry() {
        let engine = Engine::new(ArenaConfig::default());
        engine.prices().update(Symbol::from("EURUSD"), px(dec!(1.1)), ts(0));
        let entry = engine.register_entry(UserId(1), Level::Basic, ts(0)).unwrap();
        assert!(matches!(
            open(&engine, entry.id, dec!(0.1)),
            Err(TradingError::EntryNotConfirmed { .. })
        ));
    }

    #[test]
    fn open_rejects_bad_lots() {
        let (engine, entry_id) = setup();
        assert!(matches!(open(&engine, entry_id, dec!(0.001)), Err(TradingError::InvalidLotSize { .. })));
        assert!(matches!(open(&engine, entry_id, dec!(1.5)), Err(TradingError::InvalidLotSize { .. })));
        assert!(matches!(open(&engine, entry_id, dec!(0.015)), Err(TradingError::InvalidLotSize { .. })));

        open(&engine, entry_id, dec!(0.7)).unwrap();
        assert!(matches!(
            open(&engine, entry_id, dec!(0.31)),
            Err(TradingError::LotLimitExceeded { .. })
        ));
        open(&engine, entry_id, dec!(0.3)).unwrap();
        assert_eq!(engine.book(entry_id).unwrap().open_lot(), dec!(1.0));
    }

    #[test]
    fn open_without_price() {
        let (engine, entry_id) = setup();
        let res = engine.open_position(
            OpenRequest::new(entry_id, Symbol::from("XAUUSD"), Direction::Short, dec!(0.1)),
            ts(1),
        );
        assert!(matches!(res, Err(TradingError::NoPrice(_))));
        assert!(engine.book(entry_id).unwrap().positions.is_empty());
    }

    #[test]
    fn open_rejects_wrong_side_targets() {
        let (engine, entry_id) = setup();
        let req = OpenRequest::new(entry_id, Symbol::from("EURUSD"), Direction::Long, dec!(0.1))
            .with_take_profit(px(dec!(1.0900)));
        assert!(matches!(engine.open_position(req, ts(1)), Err(TradingError::Target(_))));
    }

    #[test]
    fn daily_cap() {
        let (engine, entry_id) = setup();
        for _ in 0..20 {
            let pos = open(&engine, entry_id, dec!(0.01)).unwrap();
            engine.close_position(pos.id, ts(2_000)).unwrap();
        }
        assert!(matches!(
            open(&engine, entry_id, dec!(0.01)),
            Err(TradingError::DailyLimitReached { limit: 20 })
        ));
    }

    #[test]
    fn close_at_same_price_leaves_capital() {
        let (engine, entry_id) = setup();
        let pos = open(&engine, entry_id, dec!(1.0)).unwrap();
        let closed = engine.close_position(pos.id, ts(2_000)).unwrap();

        assert_eq!(closed.pnl_percent, Decimal::ZERO);
        assert_eq!(engine.entry(entry_id).unwrap().virtual_capital.value(), dec!(10000));
        assert!(matches!(
            engine.close_position(pos.id, ts(3_000)),
            Err(TradingError::PositionAlreadyClosed(_))
        ));
    }

    #[test]
    fn close_realizes_pnl() {
        let (engine, entry_id) = setup();
        let pos = open(&engine, entry_id, dec!(0.5)).unwrap();
        engine.prices().update(Symbol::from("EURUSD"), px(dec!(1.1110)), ts(1_500));

        let closed = engine.close_position(pos.id, ts(2_000)).unwrap();
        assert_eq!(closed.pnl_amount.value(), dec!(50));
        assert_eq!(closed.position.close_reason, Some(CloseReason::Manual));
        assert_eq!(engine.entry(entry_id).unwrap().virtual_capital.value(), dec!(10050));
    }

    #[test]
    fn open_rejected_while_level_settles() {
        let (engine, entry_id) = setup();
        let gate = engine.ledger().begin_settlement(Level::Basic).unwrap();
        assert!(matches!(
            open(&engine, entry_id, dec!(0.1)),
            Err(TradingError::LevelSettling(Level::Basic))
        ));
        assert!(engine.book(entry_id).unwrap().positions.is_empty());

        drop(gate);
        assert!(open(&engine, entry_id, dec!(0.1)).is_ok());
    }

    #[test]
    fn edit_only_shrinks() {
        let (engine, entry_id) = setup();
        let pos = open(&engine, entry_id, dec!(0.5)).unwrap();

        let grow = EditRequest {
            lot_size: Some(dec!(0.6)),
            ..Default::default()
        };
        assert!(matches!(
            engine.edit_position(pos.id, grow, ts(2)),
            Err(TradingError::LotIncrease { .. })
        ));

        let shrink = EditRequest {
            lot_size: Some(dec!(0.2)),
            take_profit: Some(px(dec!(1.1200))),
            stop_loss: None,
        };
        let edited = engine.edit_position(pos.id, shrink, ts(3)).unwrap();
        assert_eq!(edited.lot_size, dec!(0.2));
        assert_eq!(edited.take_profit, Some(px(dec!(1.1200))));
        assert_eq!(engine.book(entry_id).unwrap().open_lot(), dec!(0.2));
    }

    #[test]
    fn edit_validates_targets_against_entry_price_without_feed() {
        let (engine, entry_id) = setup();
        let pos = engine
            .open_position(
                OpenRequest::new(entry_id, Symbol::from("EURUSD"), Direction::Short, dec!(0.1)),
                ts(1),
            )
            .unwrap();

        let fresh = Engine::with_parts(
            std::sync::Arc::new(engine.config().clone()),
            engine.ledger().clone(),
            crate::price_cache::PriceCache::new(),
            engine.events().clone(),
        );
        let bad = EditRequest {
            stop_loss: Some(px(dec!(1.0))),
            ..Default::default()
        };
        assert!(matches!(fresh.edit_position(pos.id, bad, ts(2)), Err(TradingError::Target(_))));

        let good = EditRequest {
            stop_loss: Some(px(dec!(1.2))),
            ..Default::default()
        };
        assert!(fresh.edit_position(pos.id, good, ts(3)).is_ok());
    }
}
