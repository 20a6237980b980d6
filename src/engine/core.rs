// 8.0 engine/core.rs: main engine. holds config, ledger, price cache and event bus.
// every field is a shared handle, so the engine is cheap to clone into tasks.

use crate::config::ArenaConfig;
use crate::entry::{Entry, EntryBook};
use crate::events::{EventBus, EventPayload};
use crate::ledger::Ledger;
use crate::price_cache::PriceCache;
use crate::types::{EntryId, Level, Timestamp};
use crate::valuation::{value_entry, EntryValuation};
use std::sync::Arc;

/** 8.1: main engine struct. all state lives behind these handles */
#[derive(Debug, Clone)]
pub struct Engine {
    pub(super) config: Arc<ArenaConfig>,
    pub(super) ledger: Arc<Ledger>,
    pub(super) prices: PriceCache,
    pub(super) events: EventBus,
}

impl Engine {
    pub fn new(config: ArenaConfig) -> Self {
        let events = EventBus::new(config.max_events);
        Self::with_parts(Arc::new(config), Arc::new(Ledger::new()), PriceCache::new(), events)
    }

    pub fn with_parts(
        config: Arc<ArenaConfig>,
        ledger: Arc<Ledger>,
        prices: PriceCache,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            ledger,
            prices,
            events,
        }
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn prices(&self) -> &PriceCache {
        &self.prices
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn entry(&self, id: EntryId) -> Option<Entry> {
        self.ledger.entry(id)
    }

    pub fn book(&self, id: EntryId) -> Option<EntryBook> {
        self.ledger.book(id)
    }

    pub(super) fn emit(&self, at: Timestamp, payload: EventPayload) {
        self.events.emit(at, payload);
    }

    // 8.2: valuations. one price snapshot per pass so every entry sees the same prices.

    pub fn valuation(&self, id: EntryId) -> Option<EntryValuation> {
        let book = self.ledger.book(id)?;
        Some(value_entry(&book, &self.prices))
    }

    pub fn valuations(&self) -> Vec<EntryValuation> {
        let prices = self.prices.snapshot();
        self.ledger
            .snapshot()
            .iter()
            .map(|book| value_entry(book, &prices))
            .collect()
    }

    /// Confirmed entries of one level ranked by live capital, best first.
    pub fn leaderboard(&self, level: Level) -> Vec<EntryValuation> {
        let prices = self.prices.snapshot();
        let mut rows: Vec<(Timestamp, EntryValuation)> = self
            .ledger
            .snapshot()
            .iter()
            .filter(|book| book.entry.level == level && book.entry.is_confirmed())
            .map(|book| (book.entry.created_at, value_entry(book, &prices)))
            .collect();

        rows.sort_by(|(a_at, a), (b_at, b)| {
            b.return_percent
                .cmp(&a.return_percent)
                .then(a_at.cmp(b_at))
                .then(a.entry_id.cmp(&b.entry_id))
        });
        rows.into_iter().map(|(_, v)| v).collect()
    }
}
