//! Background task deciding when reconciliation cycles run.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use super::engine::ReconciliationEngine;
use super::gateway::RemoteGateway;
use super::signals::{SignalChange, Subscription, SyncSignals};

/// Runs reconciliation cycles on explicit triggers, connectivity regained,
/// app foregrounded and a periodic timer while foregrounded.
///
/// Triggers arriving while a cycle runs collapse into a single follow-up run.
#[derive(Debug)]
pub struct SyncDriver {
    trigger: Arc<Notify>,
    stop: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl SyncDriver {
    /// Spawn the driver on the current tokio runtime. Startup recovery runs
    /// before the first cycle.
    pub fn spawn<G>(
        engine: Arc<ReconciliationEngine<G>>,
        signals: SyncSignals,
        interval: Option<Duration>,
    ) -> Self
    where
        G: RemoteGateway + 'static,
    {
        let trigger = Arc::new(Notify::new());
        let stop = Arc::new(Notify::new());
        let task = DriverTask {
            engine,
            subscription: signals.subscribe(),
            signals,
            ticker: interval.map(|period| {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker
            }),
            trigger: Arc::clone(&trigger),
            stop: Arc::clone(&stop),
        };
        let handle = tokio::spawn(task.run());
        Self {
            trigger,
            stop,
            handle,
        }
    }

    /// Request a cycle (user-initiated sync).
    pub fn trigger_sync(&self) {
        self.trigger.notify_one();
    }

    /// Stop the driver, letting an in-flight call finish first.
    pub async fn shutdown(self) {
        self.stop.notify_one();
        if let Err(error) = self.handle.await {
            tracing::warn!("Sync driver task ended abnormally: {}", error);
        }
    }
}

struct DriverTask<G> {
    engine: Arc<ReconciliationEngine<G>>,
    signals: SyncSignals,
    subscription: Subscription,
    ticker: Option<Interval>,
    trigger: Arc<Notify>,
    stop: Arc<Notify>,
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending::<()>().await,
    }
}

impl<G: RemoteGateway + 'static> DriverTask<G> {
    async fn run(mut self) {
        if let Err(error) = self.engine.store().recover().await {
            tracing::warn!("Startup recovery failed: {}", error);
        }

        loop {
            let should_run = tokio::select! {
                () = self.stop.notified() => break,
                () = self.trigger.notified() => true,
                change = self.subscription.changed() => match change {
                    Some(change) => self.react(&change),
                    None => break,
                },
                () = tick(&mut self.ticker) => self.signals.snapshot().foreground,
            };

            if should_run && self.run_cycle().await {
                break;
            }
        }
        tracing::debug!("Sync driver stopped");
    }

    /// Apply a signal change; returns whether it warrants a cycle.
    fn react(&self, change: &SignalChange) -> bool {
        if change.went_background() {
            self.engine.cancel();
        }
        if change.new_session() {
            self.engine.resume();
        }
        change.came_online() || change.went_foreground() || change.new_session()
    }

    /// Run one cycle while still reacting to signals. Returns `true` when a
    /// stop was requested meanwhile.
    async fn run_cycle(&mut self) -> bool {
        let context = self.signals.snapshot().cycle_context();
        let engine = Arc::clone(&self.engine);
        let cycle = engine.run_cycle(&context);
        tokio::pin!(cycle);
        let mut stopping = false;

        let result = loop {
            tokio::select! {
                result = &mut cycle => break result,
                () = self.stop.notified(), if !stopping => {
                    stopping = true;
                    self.engine.cancel();
                }
                Some(change) = self.subscription.changed() => {
                    if self.react(&change) {
                        self.trigger.notify_one();
                    }
                }
            }
        };

        match result {
            Ok(report) => tracing::debug!("Driver cycle report: {:?}", report),
            Err(error) => tracing::warn!("Sync cycle failed: {}", error),
        }
        stopping
    }
}
