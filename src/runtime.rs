// 15.0 runtime.rs: wires the three long-running tasks together.
// feed listener, broadcast loop and settlement scheduler share one engine and
// one candle store, and all stop on the same watch signal.

use crate::advice::{generator_from_config, AdviceGenerator};
use crate::broadcast::BroadcastLoop;
use crate::candle::{CandleStore, MemoryCandleStore};
use crate::config::ArenaConfig;
use crate::engine::Engine;
use crate::feed::{FeedIngestor, TickSource};
use crate::settlement::SettlementScheduler;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub(crate) fn is_shutdown(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// Sleep for `duration` unless shutdown fires first. Returns true on shutdown.
pub(crate) async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if is_shutdown(shutdown) {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => is_shutdown(shutdown),
        // a dropped sender counts as shutdown
        changed = shutdown.changed() => changed.is_err() || is_shutdown(shutdown),
    }
}

pub struct Arena {
    engine: Engine,
    candles: Arc<dyn CandleStore>,
    advice: Arc<dyn AdviceGenerator>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Arena {
    pub fn new(config: ArenaConfig) -> Self {
        let advice = generator_from_config(&config.advice);
        Self::with_parts(Engine::new(config), Arc::new(MemoryCandleStore::new()), advice)
    }

    pub fn with_parts(engine: Engine, candles: Arc<dyn CandleStore>, advice: Arc<dyn AdviceGenerator>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            engine,
            candles,
            advice,
            shutdown,
            tasks: Vec::new(),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn candles(&self) -> &Arc<dyn CandleStore> {
        &self.candles
    }

    pub fn scheduler(&self) -> SettlementScheduler {
        SettlementScheduler::new(self.engine.clone(), Arc::clone(&self.candles), Arc::clone(&self.advice))
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Spawn the feed listener, the broadcast loop and the scheduler.
    /// Calling it again while running does nothing.
    pub fn start<S: TickSource + 'static>(&mut self, source: S) {
        if self.is_running() {
            tracing::warn!("arena already running");
            return;
        }
        self.shutdown.send_replace(false);

        let ingestor = FeedIngestor::new(
            &self.engine.config().feed,
            self.engine.prices().clone(),
            Arc::clone(&self.candles),
        );
        self.tasks.push(tokio::spawn(ingestor.run(source, self.shutdown.subscribe())));
        self.tasks.push(tokio::spawn(
            BroadcastLoop::new(self.engine.clone()).run(self.shutdown.subscribe()),
        ));
        self.tasks.push(tokio::spawn(self.scheduler().run(self.shutdown.subscribe())));

        tracing::info!(tasks = self.tasks.len(), "arena started");
    }

    /// Signal every task and wait for them. A settlement pass in progress
    /// completes first.
    pub async fn stop(&mut self) {
        self.shutdown.send_replace(true);
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "arena task ended abnormally");
            }
        }
        tracing::info!("arena stopped");
    }
}
