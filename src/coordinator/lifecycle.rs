// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle management: run loop and shutdown.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{BackendSlot, EngineState, SyncEngine};

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// GC interval, or `None` when collection is disabled.
fn gc_period(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Tick an optional interval; a disabled one never fires.
async fn tick_optional(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

impl SyncEngine {
    /// Run the main event loop until [`shutdown()`](Self::shutdown).
    ///
    /// - sync every enabled backend each `sync_interval_ms`
    /// - collect tombstones each `gc_interval_secs` (0 disables)
    /// - apply config updates from the watch channel
    #[tracing::instrument(skip(self))]
    pub async fn run(&self) {
        if self.state() == EngineState::ShuttingDown {
            return;
        }
        self.set_state(EngineState::Running);
        info!(device = %self.device_id, "Sync engine running");

        let (mut sync_period, mut gc_secs) = {
            let config = self.config.read();
            (config.sync_interval(), config.gc_interval_secs)
        };
        let mut sync_interval = ticker(sync_period);
        let mut gc_interval = gc_period(gc_secs).map(ticker);
        let mut state_rx = self.state_receiver();
        let mut config_rx = self.config_rx.lock().await;

        loop {
            tokio::select! {
                Ok(()) = state_rx.changed() => {
                    if *state_rx.borrow() == EngineState::ShuttingDown {
                        break;
                    }
                }

                Ok(()) = config_rx.changed() => {
                    let new_config = config_rx.borrow().clone();
                    info!(
                        sync_interval_ms = new_config.sync_interval_ms,
                        gc_interval_secs = new_config.gc_interval_secs,
                        "Config updated"
                    );
                    if new_config.sync_interval() != sync_period {
                        sync_period = new_config.sync_interval();
                        sync_interval = ticker(sync_period);
                    }
                    // A fresh interval fires at once, so only rebuild on change.
                    if new_config.gc_interval_secs != gc_secs {
                        gc_secs = new_config.gc_interval_secs;
                        gc_interval = gc_period(gc_secs).map(ticker);
                    }
                    self.clock.set_max_skew_ms(new_config.max_clock_skew_ms);
                    *self.config.write() = new_config;
                }

                _ = sync_interval.tick() => {
                    match self.sync_all().await {
                        Ok(results) => {
                            let failed = results.iter().filter(|(_, r)| r.is_err()).count();
                            debug!(backends = results.len(), failed, "Scheduled sync round finished");
                        }
                        Err(e) => debug!(error = %e, "Scheduled sync round skipped"),
                    }
                }

                _ = tick_optional(&mut gc_interval) => {
                    if let Err(e) = self.collect_garbage().await {
                        warn!(error = %e, "Tombstone collection failed; will retry next interval");
                    }
                }
            }
        }

        info!("Sync engine run loop stopped");
    }

    /// Initiate graceful shutdown.
    ///
    /// New writes and cycles are refused; cycles already running are allowed
    /// to finish (bounded by the cycle timeout).
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let shutdown_start = std::time::Instant::now();
        info!("Initiating sync engine shutdown...");
        self.set_state(EngineState::ShuttingDown);

        let slots: Vec<Arc<BackendSlot>> = self.backends.read().values().cloned().collect();
        for slot in slots {
            let _drained = slot.cycle_lock.lock().await;
        }

        info!(elapsed_ms = shutdown_start.elapsed().as_millis() as u64, "Sync engine shutdown complete");
    }
}
