// 10.0 ledger.rs: in-memory persistence for entries, positions, payouts and advice.
// every entry sits behind its own mutex. anything that reads then writes capital
// or positions does it inside `with_book`, so two closes on the same entry
// serialize and never lose an update. locks here are short and never held
// across an await.
// a level being settled is gated: no position opens on it until the gate drops.

use crate::engine::TradingError;
use crate::entry::{Entry, EntryBook};
use crate::types::{EntryId, Level, PositionId, Quote, Timestamp, UserId};
use chrono::NaiveDate;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Immutable prize record. Only settlement creates these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payout {
    pub user_id: UserId,
    pub entry_id: EntryId,
    pub level: Level,
    // rank 1..=3
    pub position: u32,
    pub amount: Quote,
    pub date: NaiveDate,
}

/// Entry retired after its level paid out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettledEntry {
    pub book: EntryBook,
    pub rank: u32,
    pub final_capital: Quote,
    pub date: NaiveDate,
}

type SharedBook = Arc<Mutex<EntryBook>>;

/// Held for one level's settlement pass. Dropping it reopens the level.
#[derive(Debug)]
pub struct SettlementGate<'a> {
    ledger: &'a Ledger,
    level: Level,
}

impl SettlementGate<'_> {
    pub fn level(&self) -> Level {
        self.level
    }
}

impl Drop for SettlementGate<'_> {
    fn drop(&mut self) {
        self.ledger.settling.lock().remove(&self.level);
    }
}

#[derive(Debug)]
pub struct Ledger {
    books: RwLock<HashMap<EntryId, SharedBook>>,
    position_index: RwLock<HashMap<PositionId, EntryId>>,
    next_entry_id: AtomicU64,
    next_position_id: AtomicU64,
    payouts: Mutex<Vec<Payout>>,
    settled: Mutex<Vec<SettledEntry>>,
    advice: Mutex<HashMap<(UserId, NaiveDate), String>>,
    settling: Mutex<HashSet<Level>>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            position_index: RwLock::new(HashMap::new()),
            next_entry_id: AtomicU64::new(1),
            next_position_id: AtomicU64::new(1),
            payouts: Mutex::new(Vec::new()),
            settled: Mutex::new(Vec::new()),
            advice: Mutex::new(HashMap::new()),
            settling: Mutex::new(HashSet::new()),
        }
    }

    // 10.1: entries

    /// Create a pending entry. A user may hold one active entry per level.
    pub fn register(
        &self,
        user_id: UserId,
        level: Level,
        initial_capital: Quote,
        at: Timestamp,
    ) -> Result<Entry, TradingError> {
        let mut books = self.books.write();
        let duplicate = books.values().any(|book| {
            let book = book.lock();
            book.entry.user_id == user_id && book.entry.level == level
        });
        if duplicate {
            return Err(TradingError::DuplicateEntry { user_id, level });
        }

        let id = EntryId(self.next_entry_id.fetch_add(1, Ordering::Relaxed));
        let entry = Entry::new(id, user_id, level, initial_capital, at);
        books.insert(id, Arc::new(Mutex::new(EntryBook::new(entry.clone()))));
        Ok(entry)
    }

    fn shared(&self, id: EntryId) -> Option<SharedBook> {
        self.books.read().get(&id).cloned()
    }

    /// Run `f` with exclusive access to one entry and its positions.
    pub fn with_book<R>(
        &self,
        id: EntryId,
        f: impl FnOnce(&mut EntryBook) -> R,
    ) -> Result<R, TradingError> {
        let book = self.shared(id).ok_or(TradingError::EntryNotFound(id))?;
        let mut guard = book.lock();
        Ok(f(&mut guard))
    }

    pub fn entry(&self, id: EntryId) -> Option<Entry> {
        self.shared(id).map(|book| book.lock().entry.clone())
    }

    pub fn book(&self, id: EntryId) -> Option<EntryBook> {
        self.shared(id).map(|book| book.lock().clone())
    }

    /// Cloned view of every active book, ordered by entry id.
    pub fn snapshot(&self) -> Vec<EntryBook> {
        let mut out: Vec<EntryBook> = self.shared_all().iter().map(|b| b.lock().clone()).collect();
        out.sort_by_key(|b| b.entry.id);
        out
    }

    pub fn entry_ids(&self) -> Vec<EntryId> {
        let mut ids: Vec<EntryId> = self.books.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn entry_ids_at(&self, level: Level) -> Vec<EntryId> {
        let mut ids: Vec<EntryId> = self
            .books
            .read()
            .iter()
            .filter(|(_, book)| book.lock().entry.level == level)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    fn shared_all(&self) -> Vec<SharedBook> {
        self.books.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.books.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.read().is_empty()
    }

    // 10.2: positions

    pub fn next_position_id(&self) -> PositionId {
        PositionId(self.next_position_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn index_position(&self, position_id: PositionId, entry_id: EntryId) {
        self.position_index.write().insert(position_id, entry_id);
    }

    pub fn entry_for_position(&self, position_id: PositionId) -> Option<EntryId> {
        self.position_index.read().get(&position_id).copied()
    }

    // 10.3: settlement gate and output

    /// Close `level` to new positions. `None` while another pass holds it.
    pub fn begin_settlement(&self, level: Level) -> Option<SettlementGate<'_>> {
        if !self.settling.lock().insert(level) {
            return None;
        }
        Some(SettlementGate {
            ledger: self,
            level,
        })
    }

    // called under a book lock: book -> settling
    pub fn is_settling(&self, level: Level) -> bool {
        self.settling.lock().contains(&level)
    }

    /// Move an entry out of the active set into the day's archive.
    pub fn retire(&self, id: EntryId, rank: u32, date: NaiveDate) -> Option<SettledEntry> {
        let shared = self.books.write().remove(&id)?;
        let book = shared.lock().clone();
        {
            let mut index = self.position_index.write();
            for position in &book.positions {
                index.remove(&position.id);
            }
        }
        let settled = SettledEntry {
            final_capital: book.entry.virtual_capital,
            book,
            rank,
            date,
        };
        self.settled.lock().push(settled.clone());
        Some(settled)
    }

    pub fn settled(&self) -> Vec<SettledEntry> {
        self.settled.lock().clone()
    }

    pub fn record_payout(&self, payout: Payout) {
        self.payouts.lock().push(payout);
    }

    pub fn payouts(&self) -> Vec<Payout> {
        self.payouts.lock().clone()
    }

    pub fn payouts_on(&self, date: NaiveDate, level: Level) -> Vec<Payout> {
        self.payouts
            .lock()
            .iter()
            .filter(|p| p.date == date && p.level == level)
            .cloned()
            .collect()
    }

    pub fn store_advice(&self, user_id: UserId, date: NaiveDate, text: String) {
        self.advice.lock().insert((user_id, date), text);
    }

    pub fn advice(&self, user_id: UserId, date: NaiveDate) -> Option<String> {
        self.advice.lock().get(&(user_id, date)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ts() -> Timestamp {
        Timestamp::from_millis(0)
    }

    #[test]
    fn register_assigns_ids_and_rejects_duplicates() {
        let ledger = Ledger::new();
        let a = ledger.register(UserId(1), Level::Basic, Quote::new(dec!(10000)), ts()).unwrap();
        let b = ledger.register(UserId(1), Level::Premium, Quote::new(dec!(100000)), ts()).unwrap();
        assert_ne!(a.id, b.id);

        let dup = ledger.register(UserId(1), Level::Basic, Quote::new(dec!(10000)), ts());
        assert!(matches!(dup, Err(TradingError::DuplicateEntry { .. })));
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.entry_ids_at(Level::Premium), vec![b.id]);
    }

    #[test]
    fn with_book_mutates_in_place() {
        let ledger = Ledger::new();
        let e = ledger.register(UserId(1), Level::Basic, Quote::new(dec!(10000)), ts()).unwrap();
        ledger
            .with_book(e.id, |book| book.entry.virtual_capital = Quote::new(dec!(9000)))
            .unwrap();
        assert_eq!(ledger.entry(e.id).unwrap().virtual_capital.value(), dec!(9000));

        assert!(matches!(
            ledger.with_book(EntryId(99), |_| ()),
            Err(TradingError::EntryNotFound(EntryId(99)))
        ));
    }

    #[test]
    fn retire_moves_entry_to_archive() {
        let ledger = Ledger::new();
        let e = ledger.register(UserId(3), Level::Medium, Quote::new(dec!(50000)), ts()).unwrap();
        let day = ts().utc_day();

        let settled = ledger.retire(e.id, 2, day).unwrap();
        assert_eq!(settled.rank, 2);
        assert!(ledger.entry(e.id).is_none());
        assert_eq!(ledger.settled().len(), 1);
        assert!(ledger.retire(e.id, 2, day).is_none());

        // the user can enter the level again the next day
        assert!(ledger.register(UserId(3), Level::Medium, Quote::new(dec!(50000)), ts()).is_ok());
    }

    #[test]
    fn settlement_gate_is_exclusive_per_level() {
        let ledger = Ledger::new();
        let gate = ledger.begin_settlement(Level::Basic).unwrap();
        assert_eq!(gate.level(), Level::Basic);
        assert!(ledger.is_settling(Level::Basic));
        assert!(!ledger.is_settling(Level::Premium));
        assert!(ledger.begin_settlement(Level::Basic).is_none());
        assert!(ledger.begin_settlement(Level::Premium).is_some());

        drop(gate);
        assert!(!ledger.is_settling(Level::Basic));
        assert!(ledger.begin_settlement(Level::Basic).is_some());
    }

    #[test]
    fn advice_last_write_wins() {
        let ledger = Ledger::new();
        let day = ts().utc_day();
        ledger.store_advice(UserId(1), day, "first".into());
        ledger.store_advice(UserId(1), day, "second".into());
        assert_eq!(ledger.advice(UserId(1), day).as_deref(), Some("second"));
        assert!(ledger.advice(UserId(2), day).is_none());
    }
}
