// 13.0 settlement.rs: the daily job. per level: force-close, participation check,
// ranking, prizes, retirement. then candle pruning and advice for everyone.
// 13.1 settle_level, 13.2 run_once (isolation + retries), 13.3 scheduling.
//
// a level pass holds the ledger's settlement gate, so nothing opens on the level
// between the force-close and retirement. it only moves money at the very end
// (payouts, retirement), and force-close and rollover are idempotent, so
// retrying a failed level is safe.

use crate::advice::{AdviceGenerator, PerformanceSummary};
use crate::candle::CandleStore;
use crate::engine::{Engine, TradingError};
use crate::entry::{ClosedPosition, Entry};
use crate::events::{
    CandlesPrunedEvent, CapitalResetEvent, CompetitionEndedEvent, EventPayload, PayoutEvent,
    PositionClosedEvent, RankedEntry,
};
use crate::ledger::Payout;
use crate::position::CloseReason;
use crate::price_cache::PriceLookup;
use crate::runtime::{is_shutdown, sleep_or_shutdown};
use crate::types::{EntryId, Level, Quote, Timestamp};
use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SettlementError {
    #[error("trading error during settlement: {0}")]
    Trading(#[from] TradingError),

    #[error("level {0} is already being settled")]
    AlreadySettling(Level),

    #[error("level {level} failed after {attempts} attempts: {reason}")]
    Exhausted {
        level: Level,
        attempts: u32,
        reason: String,
    },
}

/// Outcome of one level's pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelSettlement {
    pub level: Level,
    pub date: NaiveDate,
    pub participants: usize,
    pub rolled_over: bool,
    pub forced_closes: usize,
    pub prize_pool: Quote,
    pub ranking: Vec<RankedEntry>,
    pub payouts: Vec<Payout>,
    pub summaries: Vec<PerformanceSummary>,
}

#[derive(Debug, Clone, Default)]
pub struct SettlementReport {
    pub levels: Vec<LevelSettlement>,
    pub failures: Vec<SettlementError>,
    pub candles_pruned: usize,
    pub advice_stored: usize,
    pub advice_failed: usize,
}

impl SettlementReport {
    pub fn level(&self, level: Level) -> Option<&LevelSettlement> {
        self.levels.iter().find(|l| l.level == level)
    }
}

// best return first; ties go to the earlier entry, then the lower id
fn rank_order(a: &Entry, b: &Entry) -> std::cmp::Ordering {
    b.return_percent()
        .cmp(&a.return_percent())
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

/// Next occurrence of `at` (UTC) strictly after `now`.
pub fn next_run_after(now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        today
    } else {
        today + chrono::Duration::days(1)
    }
}

#[derive(Clone)]
pub struct SettlementScheduler {
    engine: Engine,
    candles: Arc<dyn CandleStore>,
    advice: Arc<dyn AdviceGenerator>,
}

impl SettlementScheduler {
    pub fn new(engine: Engine, candles: Arc<dyn CandleStore>, advice: Arc<dyn AdviceGenerator>) -> Self {
        Self {
            engine,
            candles,
            advice,
        }
    }

    // 13.1: one level
    pub fn settle_level(&self, level: Level, now: Timestamp) -> Result<LevelSettlement, SettlementError> {
        let date = now.utc_day();
        let ledger = self.engine.ledger();
        let config = self.engine.config();
        let level_cfg = config.level(level);

        // from here until return no position opens on this level, so capital
        // is frozen once the force-close below is done
        let Some(_gate) = ledger.begin_settlement(level) else {
            return Err(SettlementError::AlreadySettling(level));
        };
        let prices = self.engine.prices().snapshot();

        // pending entries never traded and are left for the next day
        let mut confirmed: Vec<EntryId> = Vec::new();
        for id in ledger.entry_ids_at(level) {
            if ledger.with_book(id, |book| book.entry.is_confirmed())? {
                confirmed.push(id);
            }
        }

        // step 1: force-close at the live price, entry price if there is none
        let mut closed: Vec<ClosedPosition> = Vec::new();
        for &id in &confirmed {
            let mut done = ledger.with_book(id, |book| {
                let open: Vec<_> = book
                    .open_positions()
                    .map(|p| (p.id, prices.price(&p.symbol).unwrap_or(p.entry_price)))
                    .collect();
                open.into_iter()
                    .map(|(position_id, price)| {
                        book.close_position(position_id, price, CloseReason::ForcedEndOfDay, now)
                    })
                    .collect::<Result<Vec<_>, _>>()
            })??;
            closed.append(&mut done);
        }
        for c in &closed {
            self.engine.events().emit(
                now,
                EventPayload::PositionClosed(PositionClosedEvent {
                    position_id: c.position.id,
                    entry_id: c.position.entry_id,
                    exit_price: c.exit_price,
                    pnl_percent: c.pnl_percent,
                    pnl_amount: c.pnl_amount,
                    capital_after: c.capital_after,
                    close_reason: CloseReason::ForcedEndOfDay,
                }),
            );
        }

        let mut entries: Vec<Entry> = confirmed
            .iter()
            .map(|id| ledger.entry(*id).ok_or(TradingError::EntryNotFound(*id)))
            .collect::<Result<_, _>>()?;
        entries.sort_by(rank_order);
        let participants = entries.len();

        // step 2: not enough players, everyone starts over tomorrow
        if participants < config.settlement.min_participants {
            let mut summaries = Vec::with_capacity(participants);
            for entry in &entries {
                let summary = ledger.with_book(entry.id, |book| {
                    let summary = PerformanceSummary::from_book(book, date, None, participants);
                    book.reset_capital(level_cfg.initial_capital);
                    summary
                })?;
                summaries.push(summary);
            }
            for entry in &entries {
                self.engine.events().emit(
                    now,
                    EventPayload::CapitalReset(CapitalResetEvent {
                        entry_id: entry.id,
                        level,
                        capital: level_cfg.initial_capital,
                    }),
                );
            }

            tracing::info!(
                level = %level,
                participants,
                threshold = config.settlement.min_participants,
                "not enough participants, level rolled over"
            );
            let settlement = LevelSettlement {
                level,
                date,
                participants,
                rolled_over: true,
                forced_closes: closed.len(),
                prize_pool: Quote::zero(),
                ranking: Vec::new(),
                payouts: Vec::new(),
                summaries,
            };
            self.emit_ended(&settlement, now);
            return Ok(settlement);
        }

        // step 3: ranking
        let ranking: Vec<RankedEntry> = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| RankedEntry {
                rank: i as u32 + 1,
                entry_id: entry.id,
                user_id: entry.user_id,
                final_capital: entry.virtual_capital,
                return_percent: entry.return_percent(),
            })
            .collect();

        // step 4: prizes for the top ranks
        let prize_pool = level_cfg.prize_pool(participants);
        let payouts: Vec<Payout> = ranking
            .iter()
            .zip(prize_split(prize_pool, &config.settlement.prize_shares, participants))
            .map(|(ranked, amount)| Payout {
                user_id: ranked.user_id,
                entry_id: ranked.entry_id,
                level,
                position: ranked.rank,
                amount,
                date,
            })
            .collect();

        let summaries: Vec<PerformanceSummary> = ranking
            .iter()
            .filter_map(|ranked| {
                ledger
                    .book(ranked.entry_id)
                    .map(|book| PerformanceSummary::from_book(&book, date, Some(ranked.rank), participants))
            })
            .collect();

        // nothing below can fail
        for payout in &payouts {
            ledger.record_payout(payout.clone());
            self.engine.events().emit(now, EventPayload::PayoutCreated(payout_event(payout)));
        }
        for ranked in &ranking {
            ledger.retire(ranked.entry_id, ranked.rank, date);
        }

        tracing::info!(
            level = %level,
            participants,
            prize_pool = %prize_pool,
            winners = payouts.len(),
            "level settled"
        );
        let settlement = LevelSettlement {
            level,
            date,
            participants,
            rolled_over: false,
            forced_closes: closed.len(),
            prize_pool,
            ranking,
            payouts,
            summaries,
        };
        self.emit_ended(&settlement, now);
        Ok(settlement)
    }

    fn emit_ended(&self, settlement: &LevelSettlement, now: Timestamp) {
        self.engine.events().emit(
            now,
            EventPayload::CompetitionEnded(CompetitionEndedEvent {
                level: settlement.level,
                date: settlement.date,
                participants: settlement.participants,
                rolled_over: settlement.rolled_over,
                prize_pool: settlement.prize_pool,
                ranking: settlement.ranking.clone(),
                winners: settlement.payouts.iter().map(payout_event).collect(),
            }),
        );
    }

    // 13.2: every level, isolated; then housekeeping
    pub async fn run_once(&self, now: Timestamp) -> SettlementReport {
        let mut report = SettlementReport::default();
        let retries = self.engine.config().settlement.retries;

        for level in Level::ALL {
            let mut attempt = 0;
            loop {
                attempt += 1;
                match self.settle_level(level, now) {
                    Ok(settlement) => {
                        report.levels.push(settlement);
                        break;
                    }
                    Err(err) if attempt <= retries => {
                        tracing::warn!(level = %level, attempt, error = %err, "level settlement failed, retrying");
                    }
                    Err(err) => {
                        tracing::error!(level = %level, attempt, error = %err, "level settlement gave up");
                        report.failures.push(SettlementError::Exhausted {
                            level,
                            attempts: attempt,
                            reason: err.to_string(),
                        });
                        break;
                    }
                }
            }
        }

        report.candles_pruned = self.prune_candles(now.utc_day(), now);

        for summary in report.levels.iter().flat_map(|l| l.summaries.iter()) {
            match self.advice.generate(summary).await {
                Ok(text) => {
                    self.engine.ledger().store_advice(summary.user_id, summary.date, text);
                    report.advice_stored += 1;
                }
                Err(err) => {
                    tracing::warn!(user_id = %summary.user_id, error = ?err, "advice generation failed");
                    report.advice_failed += 1;
                }
            }
        }

        tracing::info!(
            settled = report.levels.len(),
            failed = report.failures.len(),
            candles_pruned = report.candles_pruned,
            advice = report.advice_stored,
            "settlement pass finished"
        );
        report
    }

    // keep yesterday and today
    fn prune_candles(&self, today: NaiveDate, now: Timestamp) -> usize {
        let Some(yesterday) = today.checked_sub_days(Days::new(1)) else {
            return 0;
        };
        let removed = self.candles.prune_before(yesterday);
        self.engine.events().emit(
            now,
            EventPayload::CandlesPruned(CandlesPrunedEvent {
                before: yesterday,
                removed,
            }),
        );
        removed
    }

    // 13.3: sleep until the configured UTC time, run, repeat
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let at = self.engine.config().settlement.run_at;
        tracing::info!(run_at = %at, "settlement scheduler started");

        while !is_shutdown(&shutdown) {
            let now = Utc::now();
            let next = next_run_after(now, at);
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            tracing::info!(next = %next, "next settlement scheduled");

            if sleep_or_shutdown(wait, &mut shutdown).await {
                break;
            }
            // a started pass always finishes
            self.run_once(Timestamp::now()).await;
        }
        tracing::info!("settlement scheduler stopped");
    }
}

fn payout_event(payout: &Payout) -> PayoutEvent {
    PayoutEvent {
        user_id: payout.user_id,
        entry_id: payout.entry_id,
        level: payout.level,
        position: payout.position,
        amount: payout.amount,
        date: payout.date,
    }
}

/// Pool split over the paid ranks; never more shares than participants.
pub fn prize_split(pool: Quote, shares: &[Decimal], participants: usize) -> Vec<Quote> {
    shares.iter().take(participants).map(|s| pool.mul(*s)).collect()
}
