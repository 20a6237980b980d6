//! Mark-to-market valuation of entries.
//!
//! Every path that needs a pnl figure (auto-close, manual close, broadcast,
//! ranking, settlement) goes through `pnl_percent` / `pnl_amount` here, so the
//! numbers never drift between call sites. Nothing in this module mutates.
//!
//! A position whose symbol has no current price contributes zero unrealized
//! pnl and is reported with `current_price: None`. That understates risk while
//! the feed is down; callers that care can check `unpriced`.

use crate::entry::{return_percent, EntryBook};
use crate::position::Position;
use crate::price_cache::PriceLookup;
use crate::types::{Direction, EntryId, Level, PositionId, Price, Quote, Symbol, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// sign(direction) * (current - entry) / entry * 100
pub fn pnl_percent(direction: Direction, entry_price: Price, current_price: Price) -> Decimal {
    direction.sign() * (current_price.value() - entry_price.value()) / entry_price.value()
        * Decimal::ONE_HUNDRED
}

/// capital * lot * pnl% / 100
pub fn pnl_amount(capital: Quote, lot_size: Decimal, pnl_percent: Decimal) -> Quote {
    Quote::new(capital.value() * lot_size * pnl_percent / Decimal::ONE_HUNDRED)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionValuation {
    pub position_id: PositionId,
    pub symbol: Symbol,
    pub direction: Direction,
    pub lot_size: Decimal,
    pub entry_price: Price,
    pub current_price: Option<Price>,
    pub pnl_percent: Decimal,
    pub pnl_amount: Quote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryValuation {
    pub entry_id: EntryId,
    pub user_id: UserId,
    pub level: Level,
    pub virtual_capital: Quote,
    pub unrealized_pnl: Quote,
    pub live_capital: Quote,
    pub return_percent: Decimal,
    pub open_lot: Decimal,
    pub unpriced: usize,
    pub positions: Vec<PositionValuation>,
}

pub fn value_position<P: PriceLookup + ?Sized>(
    capital: Quote,
    position: &Position,
    prices: &P,
) -> PositionValuation {
    let current_price = prices.price(&position.symbol);
    let (pct, amount) = match current_price {
        Some(current) => {
            let pct = pnl_percent(position.direction, position.entry_price, current);
            (pct, pnl_amount(capital, position.lot_size, pct))
        }
        None => (Decimal::ZERO, Quote::zero()),
    };

    PositionValuation {
        position_id: position.id,
        symbol: position.symbol.clone(),
        direction: position.direction,
        lot_size: position.lot_size,
        entry_price: position.entry_price,
        current_price,
        pnl_percent: pct,
        pnl_amount: amount,
    }
}

/// Live capital = realized capital + unrealized pnl of open positions.
pub fn value_entry<P: PriceLookup + ?Sized>(book: &EntryBook, prices: &P) -> EntryValuation {
    let capital = book.entry.virtual_capital;
    let positions: Vec<PositionValuation> = book
        .open_positions()
        .map(|p| value_position(capital, p, prices))
        .collect();

    let unrealized: Quote = positions.iter().map(|v| v.pnl_amount).sum();
    let live_capital = capital.add(unrealized);

    EntryValuation {
        entry_id: book.entry.id,
        user_id: book.entry.user_id,
        level: book.entry.level,
        virtual_capital: capital,
        unrealized_pnl: unrealized,
        live_capital,
        return_percent: return_percent(live_capital, book.entry.initial_capital),
        open_lot: book.open_lot(),
        unpriced: positions.iter().filter(|v| v.current_price.is_none()).count(),
        positions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Entry;
    use crate::price_cache::PriceCache;
    use crate::types::Timestamp;
    use rust_decimal_macros::dec;

    fn px(v: Decimal) -> Price {
        Price::new_unchecked(v)
    }

    fn book(positions: Vec<(u64, &str, Direction, Decimal, Decimal)>) -> EntryBook {
        let entry = Entry::new(
            EntryId(1),
            UserId(1),
            Level::Basic,
            Quote::new(dec!(10000)),
            Timestamp::from_millis(0),
        );
        let mut book = EntryBook::new(entry);
        for (id, sym, dir, lot, entry_price) in positions {
            book.positions.push(Position::new(
                PositionId(id),
                EntryId(1),
                Symbol::from(sym),
                dir,
                lot,
                px(entry_price),
                None,
                None,
                Timestamp::from_millis(0),
            ));
        }
        book
    }

    #[test]
    fn long_eurusd_scenario() {
        let cache = PriceCache::new();
        cache.update(Symbol::from("EURUSD"), px(dec!(1.1010)), Timestamp::from_millis(0));
        let book = book(vec![(1, "EURUSD", Direction::Long, dec!(0.5), dec!(1.1000))]);

        let v = value_entry(&book, &cache);
        let pos = &v.positions[0];

        assert!((pos.pnl_percent - dec!(0.0909)).abs() < dec!(0.0001));
        assert!((v.unrealized_pnl.value() - dec!(4.545)).abs() < dec!(0.001));
        assert!((v.live_capital.value() - dec!(10004.545)).abs() < dec!(0.001));
        // realized capital is untouched by valuation
        assert_eq!(v.virtual_capital.value(), dec!(10000));
    }

    #[test]
    fn short_profits_when_price_falls() {
        let pct = pnl_percent(Direction::Short, px(dec!(1.2500)), px(dec!(1.2375)));
        assert_eq!(pct, dec!(1));
        let amount = pnl_amount(Quote::new(dec!(10000)), dec!(1.0), pct);
        assert_eq!(amount.value(), dec!(100));
    }

    #[test]
    fn missing_price_contributes_zero() {
        let cache = PriceCache::new();
        cache.update(Symbol::from("EURUSD"), px(dec!(1.1110)), Timestamp::from_millis(0));
        let book = book(vec![
            (1, "EURUSD", Direction::Long, dec!(0.5), dec!(1.1000)),
            (2, "XAUUSD", Direction::Short, dec!(0.3), dec!(2300)),
        ]);

        let v = value_entry(&book, &cache);
        assert_eq!(v.unpriced, 1);
        assert_eq!(v.positions[1].pnl_amount, Quote::zero());
        assert_eq!(v.unrealized_pnl.value(), dec!(50));
        assert_eq!(v.open_lot, dec!(0.8));
    }

    #[test]
    fn deterministic_for_same_prices() {
        let cache = PriceCache::new();
        cache.update(Symbol::from("EURUSD"), px(dec!(1.0987)), Timestamp::from_millis(0));
        cache.update(Symbol::from("GBPUSD"), px(dec!(1.2611)), Timestamp::from_millis(0));
        let book = book(vec![
            (1, "EURUSD", Direction::Long, dec!(0.25), dec!(1.1000)),
            (2, "GBPUSD", Direction::Short, dec!(0.4), dec!(1.2500)),
        ]);

        assert_eq!(value_entry(&book, &cache), value_entry(&book, &cache));
    }

    #[test]
    fn closed_positions_are_not_valued() {
        let cache = PriceCache::new();
        cache.update(Symbol::from("EURUSD"), px(dec!(1.2)), Timestamp::from_millis(0));
        let mut book = book(vec![(1, "EURUSD", Direction::Long, dec!(1.0), dec!(1.1000))]);
        book.positions[0].closed_at = Some(Timestamp::from_millis(1));

        let v = value_entry(&book, &cache);
        assert!(v.positions.is_empty());
        assert_eq!(v.live_capital, v.virtual_capital);
    }
}
