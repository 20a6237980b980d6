//! End-of-day settlement tests
//!
//! Rollover, prize distribution, ranking ties, pruning and advice, driven
//! through the public engine and scheduler.

use anyhow::anyhow;
use arena_core::*;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

// 2024-03-01T21:00:00Z
const SETTLE_AT: i64 = 1_709_326_800_000;
const DAY_MS: i64 = 86_400_000;

fn ts(ms: i64) -> Timestamp {
    Timestamp::from_millis(ms)
}

fn px(v: Decimal) -> Price {
    Price::new_unchecked(v)
}

struct Harness {
    engine: Engine,
    candles: Arc<MemoryCandleStore>,
    scheduler: SettlementScheduler,
}

fn harness(config: ArenaConfig, advice: Arc<dyn AdviceGenerator>) -> Harness {
    let engine = Engine::new(config);
    let candles = Arc::new(MemoryCandleStore::new());
    let scheduler = SettlementScheduler::new(engine.clone(), candles.clone(), advice);
    Harness {
        engine,
        candles,
        scheduler,
    }
}

fn entry_priced_level() -> ArenaConfig {
    let mut config = ArenaConfig::default();
    config.levels.basic = LevelConfig::new(dec!(10000), dec!(12), dec!(2));
    config
}

fn confirmed(engine: &Engine, user: u64, level: Level, at: i64) -> EntryId {
    let entry = engine.register_entry(UserId(user), level, ts(at)).unwrap();
    engine.confirm_entry(entry.id, ts(at)).unwrap();
    entry.id
}

struct FailingAdvice;

#[async_trait]
impl AdviceGenerator for FailingAdvice {
    async fn generate(&self, _summary: &PerformanceSummary) -> anyhow::Result<String> {
        Err(anyhow!("service unavailable"))
    }
}

/// Tests for the participation threshold.
mod rollover_tests {
    use super::*;

    #[tokio::test]
    async fn four_entries_roll_over() {
        let h = harness(ArenaConfig::default(), Arc::new(TemplateAdvice));
        let eur = Symbol::from("EURUSD");
        h.engine.prices().update(eur.clone(), px(dec!(1.1000)), ts(SETTLE_AT));

        let mut ids = Vec::new();
        for user in 1..=4 {
            let id = confirmed(&h.engine, user, Level::Basic, SETTLE_AT - 3_600_000);
            h.engine
                .open_position(OpenRequest::new(id, eur.clone(), Direction::Long, dec!(0.5)), ts(SETTLE_AT - 1_000))
                .unwrap();
            ids.push(id);
        }
        h.engine.prices().update(eur, px(dec!(1.1110)), ts(SETTLE_AT));

        let report = h.scheduler.run_once(ts(SETTLE_AT)).await;
        let basic = report.level(Level::Basic).unwrap();

        assert!(basic.rolled_over);
        assert_eq!(basic.participants, 4);
        assert_eq!(basic.forced_closes, 4);
        assert!(basic.payouts.is_empty());
        assert!(h.engine.ledger().payouts().is_empty());

        for id in ids {
            let book = h.engine.book(id).expect("rolled over entries persist");
            assert_eq!(book.entry.virtual_capital.value(), dec!(10000));
            assert!(!book.has_open_positions());
            assert_eq!(
                book.positions[0].close_reason,
                Some(CloseReason::ForcedEndOfDay)
            );
        }
    }

    #[tokio::test]
    async fn empty_levels_roll_over_quietly() {
        let h = harness(ArenaConfig::default(), Arc::new(TemplateAdvice));
        let report = h.scheduler.run_once(ts(SETTLE_AT)).await;

        assert_eq!(report.levels.len(), 3);
        assert!(report.failures.is_empty());
        assert!(report.levels.iter().all(|l| l.rolled_over && l.participants == 0));
    }
}

/// Tests for ranking and prize distribution.
mod distribution_tests {
    use super::*;

    #[tokio::test]
    async fn ten_entries_split_fifty_thirty_twenty() {
        let h = harness(entry_priced_level(), Arc::new(TemplateAdvice));
        let eur = Symbol::from("EURUSD");
        h.engine.prices().update(eur.clone(), px(dec!(1.1000)), ts(SETTLE_AT));

        let mut users = Vec::new();
        for user in 1..=10u64 {
            let id = confirmed(&h.engine, user, Level::Basic, SETTLE_AT - 3_600_000);
            // bigger lot, bigger gain
            let lot = Decimal::new(user as i64 * 5, 2);
            h.engine
                .open_position(OpenRequest::new(id, eur.clone(), Direction::Long, lot), ts(SETTLE_AT - 1_000))
                .unwrap();
            users.push(UserId(user));
        }
        h.engine.prices().update(eur, px(dec!(1.1110)), ts(SETTLE_AT));

        let report = h.scheduler.run_once(ts(SETTLE_AT)).await;
        let basic = report.level(Level::Basic).unwrap();

        assert!(!basic.rolled_over);
        assert_eq!(basic.prize_pool.value(), dec!(100));
        assert_eq!(basic.ranking.len(), 10);
        assert_eq!(basic.ranking[0].user_id, UserId(10));
        assert_eq!(basic.ranking[9].user_id, UserId(1));

        let amounts: Vec<(u32, UserId, Decimal)> = basic
            .payouts
            .iter()
            .map(|p| (p.position, p.user_id, p.amount.value()))
            .collect();
        assert_eq!(
            amounts,
            vec![
                (1, UserId(10), dec!(50)),
                (2, UserId(9), dec!(30)),
                (3, UserId(8), dec!(20)),
            ]
        );

        let date = ts(SETTLE_AT).utc_day();
        assert_eq!(h.engine.ledger().payouts_on(date, Level::Basic).len(), 3);

        // everyone in the level is archived, nobody is left active
        assert!(h.engine.ledger().entry_ids_at(Level::Basic).is_empty());
        let settled = h.engine.ledger().settled();
        assert_eq!(settled.len(), 10);
        assert!(settled.iter().any(|s| s.rank == 10 && s.book.entry.user_id == UserId(1)));

        let winner = &basic.ranking[0];
        assert_eq!(winner.final_capital.value(), dec!(10050));
        assert_eq!(winner.return_percent, dec!(0.5));
    }

    #[tokio::test]
    async fn ties_go_to_the_earlier_entry() {
        let mut config = ArenaConfig::default();
        config.settlement.min_participants = 3;
        let h = harness(config, Arc::new(TemplateAdvice));

        // nobody trades, every return is zero
        let late = confirmed(&h.engine, 1, Level::Premium, SETTLE_AT - 1_000);
        let early = confirmed(&h.engine, 2, Level::Premium, SETTLE_AT - 9_000);
        let middle = confirmed(&h.engine, 3, Level::Premium, SETTLE_AT - 5_000);

        let report = h.scheduler.run_once(ts(SETTLE_AT)).await;
        let premium = report.level(Level::Premium).unwrap();
        let order: Vec<EntryId> = premium.ranking.iter().map(|r| r.entry_id).collect();
        assert_eq!(order, vec![early, middle, late]);
    }

    #[tokio::test]
    async fn pending_entries_are_left_alone() {
        let mut config = entry_priced_level();
        config.settlement.min_participants = 2;
        let h = harness(config, Arc::new(TemplateAdvice));

        confirmed(&h.engine, 1, Level::Basic, SETTLE_AT - 1_000);
        confirmed(&h.engine, 2, Level::Basic, SETTLE_AT - 1_000);
        let pending = h
            .engine
            .register_entry(UserId(3), Level::Basic, ts(SETTLE_AT - 1_000))
            .unwrap();

        let report = h.scheduler.run_once(ts(SETTLE_AT)).await;
        let basic = report.level(Level::Basic).unwrap();

        assert_eq!(basic.participants, 2);
        assert_eq!(basic.prize_pool.value(), dec!(20));
        assert_eq!(basic.payouts.len(), 2);
        assert_eq!(h.engine.ledger().entry_ids_at(Level::Basic), vec![pending.id]);
    }

    #[tokio::test]
    async fn levels_settle_independently() {
        let mut config = entry_priced_level();
        config.settlement.min_participants = 2;
        let h = harness(config, Arc::new(TemplateAdvice));

        confirmed(&h.engine, 1, Level::Basic, SETTLE_AT - 1_000);
        confirmed(&h.engine, 2, Level::Basic, SETTLE_AT - 1_000);
        let lonely = confirmed(&h.engine, 3, Level::Medium, SETTLE_AT - 1_000);

        let report = h.scheduler.run_once(ts(SETTLE_AT)).await;
        assert!(!report.level(Level::Basic).unwrap().rolled_over);
        assert!(report.level(Level::Medium).unwrap().rolled_over);
        assert!(h.engine.entry(lonely).is_some());

        let ended = h
            .engine
            .events()
            .events()
            .iter()
            .filter(|e| matches!(e.payload, EventPayload::CompetitionEnded(_)))
            .count();
        assert_eq!(ended, 3);
    }
}

/// Tests for the degraded paths and housekeeping.
mod housekeeping_tests {
    use super::*;

    #[tokio::test]
    async fn force_close_without_price_uses_entry_price() {
        let h = harness(ArenaConfig::default(), Arc::new(TemplateAdvice));
        let xau = Symbol::from("XAUUSD");
        h.engine.prices().update(xau.clone(), px(dec!(2300)), ts(SETTLE_AT - 1_000));
        let id = confirmed(&h.engine, 1, Level::Basic, SETTLE_AT - 2_000);
        h.engine
            .open_position(OpenRequest::new(id, xau, Direction::Short, dec!(0.3)), ts(SETTLE_AT - 1_000))
            .unwrap();

        // same ledger, cold price cache
        let cold = Engine::with_parts(
            Arc::new(h.engine.config().clone()),
            h.engine.ledger().clone(),
            PriceCache::new(),
            h.engine.events().clone(),
        );
        let scheduler = SettlementScheduler::new(cold, h.candles.clone(), Arc::new(TemplateAdvice));
        let settlement = scheduler.settle_level(Level::Basic, ts(SETTLE_AT)).unwrap();

        assert_eq!(settlement.forced_closes, 1);
        let book = h.engine.book(id).unwrap();
        assert_eq!(book.positions[0].exit_price, Some(px(dec!(2300))));
        assert_eq!(book.positions[0].current_pnl, Some(Decimal::ZERO));
    }

    #[tokio::test]
    async fn pruning_twice_removes_nothing_the_second_time() {
        let h = harness(ArenaConfig::default(), Arc::new(TemplateAdvice));
        let sym = Symbol::from("EURUSD");
        h.candles.upsert_tick(&sym, px(dec!(1.1)), ts(SETTLE_AT - 2 * DAY_MS));
        h.candles.upsert_tick(&sym, px(dec!(1.1)), ts(SETTLE_AT - DAY_MS));
        h.candles.upsert_tick(&sym, px(dec!(1.1)), ts(SETTLE_AT));

        let first = h.scheduler.run_once(ts(SETTLE_AT)).await;
        let second = h.scheduler.run_once(ts(SETTLE_AT)).await;

        assert_eq!(first.candles_pruned, 1);
        assert_eq!(second.candles_pruned, 0);
        assert_eq!(h.candles.len(), 2);
    }

    #[tokio::test]
    async fn advice_failures_do_not_abort_settlement() {
        let mut config = entry_priced_level();
        config.settlement.min_participants = 2;
        let h = harness(config, Arc::new(FailingAdvice));

        confirmed(&h.engine, 1, Level::Basic, SETTLE_AT - 1_000);
        confirmed(&h.engine, 2, Level::Basic, SETTLE_AT - 1_000);

        let report = h.scheduler.run_once(ts(SETTLE_AT)).await;
        assert!(report.failures.is_empty());
        assert_eq!(report.advice_failed, 2);
        assert_eq!(report.advice_stored, 0);
        assert_eq!(report.level(Level::Basic).unwrap().payouts.len(), 2);
        assert!(h.engine.ledger().advice(UserId(1), ts(SETTLE_AT).utc_day()).is_none());
    }

    #[tokio::test]
    async fn advice_is_stored_per_participant() {
        let h = harness(ArenaConfig::default(), Arc::new(TemplateAdvice));
        for user in 1..=3 {
            confirmed(&h.engine, user, Level::Medium, SETTLE_AT - 1_000);
        }

        let report = h.scheduler.run_once(ts(SETTLE_AT)).await;
        assert_eq!(report.advice_stored, 3);
        let day = ts(SETTLE_AT).utc_day();
        for user in 1..=3 {
            assert!(h.engine.ledger().advice(UserId(user), day).is_some());
        }
    }
}

/// Tests for a level that cannot settle.
mod failure_tests {
    use super::*;

    #[tokio::test]
    async fn busy_level_is_retried_and_reported_while_others_settle() {
        let mut config = entry_priced_level();
        config.settlement.min_participants = 2;
        let h = harness(config, Arc::new(TemplateAdvice));
        let retries = h.engine.config().settlement.retries;
        let eur = Symbol::from("EURUSD");
        h.engine.prices().update(eur.clone(), px(dec!(1.1000)), ts(SETTLE_AT));

        confirmed(&h.engine, 1, Level::Basic, SETTLE_AT - 1_000);
        confirmed(&h.engine, 2, Level::Basic, SETTLE_AT - 1_000);
        let medium = confirmed(&h.engine, 3, Level::Medium, SETTLE_AT - 1_000);
        h.engine
            .open_position(OpenRequest::new(medium, eur, Direction::Long, dec!(0.2)), ts(SETTLE_AT - 500))
            .unwrap();

        // another pass already owns the medium level
        let gate = h.engine.ledger().begin_settlement(Level::Medium).unwrap();
        let report = h.scheduler.run_once(ts(SETTLE_AT)).await;

        assert_eq!(
            report.failures,
            vec![SettlementError::Exhausted {
                level: Level::Medium,
                attempts: retries + 1,
                reason: SettlementError::AlreadySettling(Level::Medium).to_string(),
            }]
        );
        assert!(report.level(Level::Medium).is_none());
        assert!(!report.level(Level::Basic).unwrap().rolled_over);
        assert!(report.level(Level::Premium).is_some());
        // the failed level was not touched at all
        assert!(h.engine.book(medium).unwrap().has_open_positions());

        drop(gate);
        let again = h.scheduler.run_once(ts(SETTLE_AT)).await;
        assert!(again.failures.is_empty());
        let settled = again.level(Level::Medium).unwrap();
        assert_eq!(settled.forced_closes, 1);
        assert!(settled.rolled_over);
    }
}
