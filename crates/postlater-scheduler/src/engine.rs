//! Scheduler loop: polls for due messages and hands each to the delivery engine.
//! Uses tokio::interval for ticking (sleeps between checks) and a watch channel
//! as the stop signal, so `stop` can be called from any task or thread.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use postlater_core::config::SchedulerConfig;
use postlater_core::error::Result;
use postlater_core::traits::MessageStore;

use crate::delivery::DeliveryEngine;

/// Everything one tick needs. Cloned into the background task.
#[derive(Clone)]
struct TickRunner {
    messages: Arc<dyn MessageStore>,
    delivery: Arc<DeliveryEngine>,
    concurrent: bool,
}

impl TickRunner {
    /// Deliver every message due at `now`. Returns how many were dispatched.
    async fn run(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.messages.list_due(now).await?;
        if due.is_empty() {
            return Ok(0);
        }
        tracing::info!("🔔 {} message(s) due", due.len());

        // One task per message: a panic in one delivery cannot take down the tick.
        if self.concurrent {
            let mut deliveries = JoinSet::new();
            for message in &due {
                let delivery = self.delivery.clone();
                let id = message.id.clone();
                deliveries.spawn(async move { delivery.deliver(&id).await });
            }
            while let Some(joined) = deliveries.join_next().await {
                if let Err(e) = joined {
                    tracing::error!("delivery task aborted: {e}");
                }
            }
        } else {
            for message in &due {
                let delivery = self.delivery.clone();
                let id = message.id.clone();
                if let Err(e) = tokio::spawn(async move { delivery.deliver(&id).await }).await {
                    tracing::error!(message_id = %message.id, "delivery task aborted: {e}");
                }
            }
        }

        Ok(due.len())
    }

    async fn run_logged(&self, now: DateTime<Utc>) -> usize {
        match self.run(now).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!("⚠️ Scheduler tick failed: {e}");
                0
            }
        }
    }
}

struct RunningLoop {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Recurring background delivery. Start and stop are idempotent.
pub struct Scheduler {
    runner: TickRunner,
    period: Duration,
    running: Mutex<Option<RunningLoop>>,
}

impl Scheduler {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        delivery: Arc<DeliveryEngine>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            runner: TickRunner {
                messages,
                delivery,
                concurrent: config.concurrent_dispatch,
            },
            period: config.period(),
            running: Mutex::new(None),
        }
    }

    /// Spawn the loop on the current tokio runtime. Returns `false` if it is already running.
    pub fn start(&self) -> bool {
        let mut running = self.lock_running();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return false;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(self.runner.clone(), self.period, shutdown_rx));
        *running = Some(RunningLoop { shutdown_tx, handle });
        tracing::info!("⏰ Scheduler started (check every {}s)", self.period.as_secs());
        true
    }

    /// Signal the loop to stop. Ticks in flight get one period to finish.
    /// Returns `false` if it was not running.
    pub fn stop(&self) -> bool {
        match self.lock_running().take() {
            Some(running) => {
                running.shutdown_tx.send(true).ok();
                tracing::info!("🛑 Scheduler stopping");
                true
            }
            None => false,
        }
    }

    /// Stop and wait for the loop task to exit.
    pub async fn shutdown(&self) {
        let Some(running) = self.lock_running().take() else {
            return;
        };
        running.shutdown_tx.send(true).ok();
        if let Err(e) = running.handle.await {
            tracing::error!("scheduler task ended abnormally: {e}");
        }
        tracing::info!("🛑 Scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.lock_running()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Run one pass now, outside the loop.
    pub async fn tick(&self) -> usize {
        self.tick_at(Utc::now()).await
    }

    /// Run one pass as if the current instant were `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> usize {
        self.runner.run_logged(now).await
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<RunningLoop>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_loop(runner: TickRunner, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Ticks run beside the timer: a hung send must not delay the next tick.
    let mut ticks = JoinSet::new();

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        while let Some(joined) = ticks.try_join_next() {
            if let Err(e) = joined {
                tracing::error!("scheduler tick aborted: {e}");
            }
        }

        let runner = runner.clone();
        ticks.spawn(async move {
            let dispatched = runner.run_logged(Utc::now()).await;
            if dispatched > 0 {
                tracing::debug!("tick dispatched {dispatched} message(s)");
            }
        });
    }

    // Give in-flight ticks one period to finish, then leave them to the runtime.
    let drained = tokio::time::timeout(period, async {
        while ticks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!("⚠️ {} tick(s) still delivering at shutdown", ticks.len());
        ticks.detach_all();
    }

    tracing::debug!("scheduler loop exited");
}
