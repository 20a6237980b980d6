//! Take-profit / stop-loss sweep, run once per broadcast cycle.

use super::core::Engine;
use super::results::AutoCloseResult;
use crate::events::{EventPayload, TradeClosedAutoEvent};
use crate::position::CloseReason;
use crate::price_cache::PriceLookup;
use crate::types::{PositionId, Timestamp};

impl Engine {
    /// Close every open position whose target was reached at the current
    /// price. Positions without targets or without a price are left alone.
    pub fn sweep_auto_close(&self, now: Timestamp) -> Vec<AutoCloseResult> {
        let prices = self.prices.snapshot();
        let mut results = Vec::new();
        let mut closed = Vec::new();

        for entry_id in self.ledger.entry_ids() {
            let swept = self.ledger.with_book(entry_id, |book| {
                let triggered: Vec<(PositionId, _, _)> = book
                    .open_positions()
                    .filter(|p| p.has_targets())
                    .filter_map(|p| match prices.price(&p.symbol) {
                        Some(price) => p.check_trigger(price).map(|reason| (p.id, price, reason)),
                        None => {
                            tracing::debug!(position_id = %p.id, symbol = %p.symbol, "no price, auto-close skipped");
                            None
                        }
                    })
                    .collect();

                let mut out = Vec::new();
                for (position_id, price, reason) in triggered {
                    match book.close_position(position_id, price, reason, now) {
                        Ok(done) => out.push((book.entry.user_id, done)),
                        Err(e) => {
                            tracing::warn!(position_id = %position_id, error = %e, "auto-close failed")
                        }
                    }
                }
                out
            });

            // entry retired between listing and locking
            let Ok(swept) = swept else { continue };
            closed.extend(swept);
        }

        for (user_id, done) in closed {
            let position = &done.position;
            let reason = position.close_reason.unwrap_or(CloseReason::Manual);
            tracing::info!(
                entry_id = %position.entry_id,
                position_id = %position.id,
                symbol = %position.symbol,
                reason = %reason,
                pnl_percent = %done.pnl_percent,
                "position auto-closed"
            );

            self.emit_closed(&done, now);
            self.emit(
                now,
                EventPayload::TradeClosedAuto(TradeClosedAutoEvent {
                    position_id: position.id,
                    entry_id: position.entry_id,
                    user_id,
                    symbol: position.symbol.clone(),
                    reason,
                    pnl_percent: done.pnl_percent,
                    pnl_amount: done.pnl_amount,
                }),
            );

            results.push(AutoCloseResult {
                position_id: position.id,
                entry_id: position.entry_id,
                user_id,
                symbol: position.symbol.clone(),
                reason,
                exit_price: done.exit_price,
                pnl_percent: done.pnl_percent,
                pnl_amount: done.pnl_amount,
                capital_after: done.capital_after,
            });
        }

        results
    }
}
