//! In-memory latest-price cache.
//!
//! One writer (the feed listener), many readers (valuation, auto-close,
//! settlement). Last write wins per symbol; nothing is ordered across symbols.

use crate::types::{Price, Symbol, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Latest observation for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricePoint {
    pub price: Price,
    pub observed_at: Timestamp,
}

/// Anything valuation can read a current price from.
pub trait PriceLookup {
    fn price(&self, symbol: &Symbol) -> Option<Price>;
}

impl PriceLookup for HashMap<Symbol, Price> {
    fn price(&self, symbol: &Symbol) -> Option<Price> {
        self.get(symbol).copied()
    }
}

/// Cloneable handle to the shared cache. Clones see the same state.
#[derive(Debug, Clone, Default)]
pub struct PriceCache {
    inner: Arc<RwLock<HashMap<Symbol, PricePoint>>>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, symbol: Symbol, price: Price, observed_at: Timestamp) {
        self.inner
            .write()
            .insert(symbol, PricePoint { price, observed_at });
    }

    pub fn point(&self, symbol: &Symbol) -> Option<PricePoint> {
        self.inner.read().get(symbol).copied()
    }

    /// Copy of every current price. Used when one pass must see a single
    /// consistent view (settlement, broadcast).
    pub fn snapshot(&self) -> HashMap<Symbol, Price> {
        self.inner
            .read()
            .iter()
            .map(|(symbol, point)| (symbol.clone(), point.price))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl PriceLookup for PriceCache {
    fn price(&self, symbol: &Symbol) -> Option<Price> {
        self.inner.read().get(symbol).map(|point| point.price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn last_write_wins() {
        let cache = PriceCache::new();
        let eurusd = Symbol::from("EURUSD");

        cache.update(eurusd.clone(), Price::new_unchecked(dec!(1.1000)), Timestamp::from_millis(2_000));
        // an older tick arriving late still overwrites
        cache.update(eurusd.clone(), Price::new_unchecked(dec!(1.0990)), Timestamp::from_millis(1_000));

        assert_eq!(cache.price(&eurusd).unwrap().value(), dec!(1.0990));
        assert_eq!(cache.point(&eurusd).unwrap().observed_at, Timestamp::from_millis(1_000));
    }

    #[test]
    fn clones_share_state() {
        let cache = PriceCache::new();
        let reader = cache.clone();
        cache.update(Symbol::from("BTCUSD"), Price::new_unchecked(dec!(64000)), Timestamp::from_millis(0));

        assert_eq!(reader.len(), 1);
        assert!(reader.price(&Symbol::from("ETHUSD")).is_none());
    }

    #[test]
    fn snapshot_is_detached() {
        let cache = PriceCache::new();
        let sym = Symbol::from("GBPUSD");
        cache.update(sym.clone(), Price::new_unchecked(dec!(1.25)), Timestamp::from_millis(0));

        let snap = cache.snapshot();
        cache.update(sym.clone(), Price::new_unchecked(dec!(1.26)), Timestamp::from_millis(1));

        assert_eq!(snap.price(&sym).unwrap().value(), dec!(1.25));
        assert_eq!(cache.price(&sym).unwrap().value(), dec!(1.26));
    }
}
