//! Entry lifecycle: registration and payment confirmation.

use super::core::Engine;
use super::results::TradingError;
use crate::entry::{Entry, EntryStatus};
use crate::events::{EntryConfirmedEvent, EntryRegisteredEvent, EventPayload};
use crate::types::{EntryId, Level, Timestamp, UserId};

impl Engine {
    /// Create a pending entry with the level's starting capital.
    pub fn register_entry(
        &self,
        user_id: UserId,
        level: Level,
        at: Timestamp,
    ) -> Result<Entry, TradingError> {
        let initial_capital = self.config.level(level).initial_capital;
        let entry = self.ledger.register(user_id, level, initial_capital, at)?;

        tracing::info!(entry_id = %entry.id, user_id = %user_id, level = %level, "entry registered");
        self.emit(
            at,
            EventPayload::EntryRegistered(EntryRegisteredEvent {
                entry_id: entry.id,
                user_id,
                level,
                initial_capital,
            }),
        );
        Ok(entry)
    }

    /// Mark an entry paid. Confirming an already confirmed entry is a no-op.
    pub fn confirm_entry(&self, entry_id: EntryId, at: Timestamp) -> Result<Entry, TradingError> {
        let (entry, changed) = self.ledger.with_book(entry_id, |book| {
            let changed = book.entry.status == EntryStatus::Pending;
            book.entry.status = EntryStatus::Confirmed;
            (book.entry.clone(), changed)
        })?;

        if changed {
            tracing::info!(entry_id = %entry_id, user_id = %entry.user_id, "entry confirmed");
            self.emit(
                at,
                EventPayload::EntryConfirmed(EntryConfirmedEvent {
                    entry_id,
                    user_id: entry.user_id,
                }),
            );
        }
        Ok(entry)
    }
}
