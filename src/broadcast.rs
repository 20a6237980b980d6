// 12.0 broadcast.rs: the fast loop. every interval: sweep take-profit / stop-loss,
// value every entry against one price snapshot, publish a liveUpdate.
// an overrunning pass skips the next tick instead of queueing it.

use crate::engine::{AutoCloseResult, Engine};
use crate::events::{EventPayload, LiveUpdateEvent};
use crate::runtime::is_shutdown;
use crate::types::Timestamp;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub closed: Vec<AutoCloseResult>,
    pub entries: usize,
}

#[derive(Debug, Clone)]
pub struct BroadcastLoop {
    engine: Engine,
    interval: Duration,
}

impl BroadcastLoop {
    pub fn new(engine: Engine) -> Self {
        let interval = engine.config().broadcast_interval();
        Self { engine, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One pass. Auto-close runs first so the snapshot already reflects it.
    pub fn cycle(&self, now: Timestamp) -> CycleReport {
        let closed = self.engine.sweep_auto_close(now);
        let entries = self.engine.valuations();
        let count = entries.len();

        self.engine
            .events()
            .emit(now, EventPayload::LiveUpdate(LiveUpdateEvent { entries }));

        if !closed.is_empty() {
            tracing::debug!(closed = closed.len(), entries = count, "broadcast cycle");
        }
        CycleReport {
            closed,
            entries: count,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "broadcast loop started");

        while !is_shutdown(&shutdown) {
            tokio::select! {
                _ = ticker.tick() => {
                    self.cycle(Timestamp::now());
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("broadcast loop stopped");
    }
}
