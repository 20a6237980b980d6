//! Trading arena simulation.
//!
//! `arena-sim live` connects to the configured websocket feed and runs until
//! Ctrl+C. Without arguments it plays scripted scenarios through the engine
//! and prints what happened.

use anyhow::{Context, Result};
use arena_core::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ArenaConfig::from_env();
    config.validate().context("invalid configuration")?;

    match std::env::args().nth(1).as_deref() {
        Some("live") => run_live(config).await,
        _ => run_scenarios().await,
    }
}

async fn run_live(config: ArenaConfig) -> Result<()> {
    let source = WsTickSource::new(&config.feed);
    let mut arena = Arena::new(config);
    arena.start(source);

    tokio::signal::ctrl_c().await.context("listen for ctrl-c")?;
    tracing::info!("shutdown requested");
    arena.stop().await;
    Ok(())
}

async fn run_scenarios() -> Result<()> {
    println!("Trading Arena Simulation");
    println!("Three levels, daily settlement, scripted prices\n");

    scenario_1_mark_to_market()?;
    scenario_2_stop_loss()?;
    scenario_3_rollover().await?;
    scenario_4_prize_distribution().await?;
    scenario_5_live_feed().await?;

    println!("\nAll simulations completed successfully.");
    Ok(())
}

fn px(value: Decimal) -> Price {
    Price::new_unchecked(value)
}

fn confirmed_entry(engine: &Engine, user: u64, level: Level, at: Timestamp) -> Result<EntryId> {
    let entry = engine.register_entry(UserId(user), level, at)?;
    engine.confirm_entry(entry.id, at)?;
    Ok(entry.id)
}

/// Long EURUSD, price moves, live capital follows.
fn scenario_1_mark_to_market() -> Result<()> {
    println!("Scenario 1: Mark to Market\n");

    let engine = Engine::new(ArenaConfig::default());
    let t0 = Timestamp::now();
    let eur = Symbol::from("EURUSD");
    engine.prices().update(eur.clone(), px(dec!(1.1000)), t0);

    let alice = confirmed_entry(&engine, 1, Level::Basic, t0)?;
    let pos = engine.open_position(OpenRequest::new(alice, eur.clone(), Direction::Long, dec!(0.5)), t0)?;
    println!("  Alice opens LONG 0.5 EURUSD @ {}", pos.entry_price);

    engine.prices().update(eur.clone(), px(dec!(1.1010)), t0);
    let v = engine.valuation(alice).context("alice valuation")?;
    println!("  EURUSD ticks to 1.1010");
    println!("  Unrealized: {:.3}, live capital: {:.3}\n", v.unrealized_pnl.value(), v.live_capital.value());

    let closed = engine.close_position(pos.id, t0)?;
    println!("  Closed at {}: pnl {:.4}%, capital now {:.3}\n", closed.exit_price, closed.pnl_percent, closed.capital_after.value());
    Ok(())
}

/// Short with a stop loss, the sweep closes it.
fn scenario_2_stop_loss() -> Result<()> {
    println!("Scenario 2: Stop Loss Sweep\n");

    let engine = Engine::new(ArenaConfig::default());
    let t0 = Timestamp::now();
    let gbp = Symbol::from("GBPUSD");
    engine.prices().update(gbp.clone(), px(dec!(1.2500)), t0);

    let bob = confirmed_entry(&engine, 2, Level::Basic, t0)?;
    let req = OpenRequest::new(bob, gbp.clone(), Direction::Short, dec!(1.0)).with_stop_loss(px(dec!(1.2550)));
    engine.open_position(req, t0)?;
    println!("  Bob opens SHORT 1.0 GBPUSD @ 1.2500, SL 1.2550");

    engine.prices().update(gbp, px(dec!(1.2555)), t0);
    let report = BroadcastLoop::new(engine.clone()).cycle(t0);
    for c in &report.closed {
        println!("  {} closed: {} pnl {:.2} ({:.4}%)", c.position_id, c.reason, c.pnl_amount.value(), c.pnl_percent);
    }
    println!("  Capital after: {}\n", engine.entry(bob).context("bob entry")?.virtual_capital);
    Ok(())
}

/// Four players at a level that needs five: everyone is reset.
async fn scenario_3_rollover() -> Result<()> {
    println!("Scenario 3: Under-subscribed Level Rolls Over\n");

    let arena = Arena::new(ArenaConfig::production());
    let engine = arena.engine();
    let t0 = Timestamp::now();
    let eur = Symbol::from("EURUSD");
    engine.prices().update(eur.clone(), px(dec!(1.1000)), t0);

    for user in 1..=4 {
        let id = confirmed_entry(engine, user, Level::Medium, t0)?;
        engine.open_position(OpenRequest::new(id, eur.clone(), Direction::Long, dec!(0.25)), t0)?;
    }
    engine.prices().update(eur, px(dec!(1.1100)), t0);

    let report = arena.scheduler().run_once(t0).await;
    let medium = report.level(Level::Medium).context("medium settled")?;
    println!("  Participants: {}, rolled over: {}", medium.participants, medium.rolled_over);
    println!("  Forced closes: {}, payouts: {}", medium.forced_closes, medium.payouts.len());
    for entry in engine.ledger().snapshot() {
        println!("  {} capital reset to {}", entry.entry.id, entry.entry.virtual_capital);
    }
    println!();
    Ok(())
}

/// Ten players, pool 100, 50/30/20 split.
async fn scenario_4_prize_distribution() -> Result<()> {
    println!("Scenario 4: Prize Distribution\n");

    let mut config = ArenaConfig::production();
    config.levels.basic = LevelConfig::new(dec!(10000), dec!(12), dec!(2));
    let arena = Arena::with_parts(Engine::new(config), Arc::new(MemoryCandleStore::new()), Arc::new(TemplateAdvice));
    let engine = arena.engine();
    let t0 = Timestamp::now();
    let btc = Symbol::from("BTCUSD");
    engine.prices().update(btc.clone(), px(dec!(60000)), t0);

    for user in 1..=10u64 {
        let id = confirmed_entry(engine, user, Level::Basic, t0)?;
        let direction = if user % 2 == 0 { Direction::Long } else { Direction::Short };
        let lot = Decimal::new(user as i64 * 5, 2);
        engine.open_position(OpenRequest::new(id, btc.clone(), direction, lot), t0)?;
    }
    engine.prices().update(btc, px(dec!(61200)), t0);

    let report = arena.scheduler().run_once(t0).await;
    let basic = report.level(Level::Basic).context("basic settled")?;
    println!("  Prize pool: {}", basic.prize_pool);
    for ranked in basic.ranking.iter().take(5) {
        println!("  #{} {} return {:.3}%", ranked.rank, ranked.user_id, ranked.return_percent);
    }
    for payout in &basic.payouts {
        println!("  Payout rank {} -> {}: {}", payout.position, payout.user_id, payout.amount);
    }
    println!("  Advice stored: {}\n", report.advice_stored);
    Ok(())
}

/// Full runtime against a scripted feed.
async fn scenario_5_live_feed() -> Result<()> {
    println!("Scenario 5: Runtime With Scripted Feed\n");

    let mut arena = Arena::new(ArenaConfig::development());
    let mut events = arena.engine().events().subscribe();
    let (source, feed) = ChannelTickSource::new();
    arena.start(source);

    for (i, price) in [dec!(2300.0), dec!(2301.5), dec!(2299.8)].into_iter().enumerate() {
        feed.send_text(format!(r#"{{"type":"trade","data":[{{"s":"OANDA:XAU_USD","p":{price},"t":{i}}}]}}"#));
    }
    tokio::time::sleep(Duration::from_millis(1_200)).await;

    let xau = Symbol::from("XAUUSD");
    let bar = arena.candles().latest(&xau).context("gold candle")?;
    println!("  XAUUSD candle: O {} H {} L {} C {}", bar.open, bar.high, bar.low, bar.close);

    let mut live_updates = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event.payload, EventPayload::LiveUpdate(_)) {
            live_updates += 1;
        }
    }
    println!("  Live updates published: {}", live_updates);

    arena.stop().await;
    Ok(())
}
