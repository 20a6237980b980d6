// 5.0 candle.rs: one-minute OHLC bars folded from ticks.
// key is (symbol, utc day, minute bucket). open is fixed at creation,
// high/low/close move with every tick inside the bucket.

use crate::types::{Price, Symbol, Timestamp};
use chrono::NaiveDate;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: Symbol,
    pub date: NaiveDate,
    // epoch seconds, minute aligned
    pub time: i64,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
}

impl Candle {
    pub fn open_at(symbol: Symbol, at: Timestamp, price: Price) -> Self {
        Self {
            symbol,
            date: at.utc_day(),
            time: at.minute_bucket(),
            open: price,
            high: price,
            low: price,
            close: price,
        }
    }

    // 5.1: fold one more tick into the bar. open is never touched.
    pub fn fold(&mut self, price: Price) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
    }

    pub fn is_consistent(&self) -> bool {
        self.low <= self.open
            && self.low <= self.close
            && self.open <= self.high
            && self.close <= self.high
    }
}

/// Storage boundary for candles: unique-key upsert, ordered range reads,
/// day-granular pruning.
pub trait CandleStore: Send + Sync {
    /// Fold `price` into the bucket containing `at`, creating it if needed.
    fn upsert_tick(&self, symbol: &Symbol, price: Price, at: Timestamp) -> Candle;

    /// Candles with `from <= time <= to` (epoch seconds), oldest first.
    fn range(&self, symbol: &Symbol, from: i64, to: i64) -> Vec<Candle>;

    fn latest(&self, symbol: &Symbol) -> Option<Candle>;

    /// Delete every candle whose day is before `day`. Returns rows removed.
    fn prune_before(&self, day: NaiveDate) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type Series = Arc<Mutex<BTreeMap<i64, Candle>>>;

/// In-memory store. Each symbol has its own series lock so writers on
/// different symbols never contend.
#[derive(Debug, Default)]
pub struct MemoryCandleStore {
    series: RwLock<HashMap<Symbol, Series>>,
}

impl MemoryCandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn series(&self, symbol: &Symbol) -> Series {
        if let Some(series) = self.series.read().get(symbol) {
            return Arc::clone(series);
        }
        let mut all = self.series.write();
        Arc::clone(all.entry(symbol.clone()).or_default())
    }

    fn existing(&self, symbol: &Symbol) -> Option<Series> {
        self.series.read().get(symbol).cloned()
    }
}

impl CandleStore for MemoryCandleStore {
    fn upsert_tick(&self, symbol: &Symbol, price: Price, at: Timestamp) -> Candle {
        let series = self.series(symbol);
        let mut bars = series.lock();
        let candle = bars
            .entry(at.minute_bucket())
            .and_modify(|bar| bar.fold(price))
            .or_insert_with(|| Candle::open_at(symbol.clone(), at, price));
        candle.clone()
    }

    fn range(&self, symbol: &Symbol, from: i64, to: i64) -> Vec<Candle> {
        if from > to {
            return Vec::new();
        }
        let Some(series) = self.existing(symbol) else {
            return Vec::new();
        };
        let bars = series.lock();
        bars.range(from..=to).map(|(_, bar)| bar.clone()).collect()
    }

    fn latest(&self, symbol: &Symbol) -> Option<Candle> {
        let series = self.existing(symbol)?;
        let bars = series.lock();
        bars.values().next_back().cloned()
    }

    fn prune_before(&self, day: NaiveDate) -> usize {
        let all: Vec<Series> = self.series.read().values().cloned().collect();
        let mut removed = 0;
        for series in all {
            let mut bars = series.lock();
            let before = bars.len();
            bars.retain(|_, bar| bar.date >= day);
            removed += before - bars.len();
        }
        removed
    }

    fn len(&self) -> usize {
        let all: Vec<Series> = self.series.read().values().cloned().collect();
        all.iter().map(|series| series.lock().len()).sum()
    }
}
