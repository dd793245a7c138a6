//! The single background consumer of the sync queue.

use std::sync::Arc;

use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::error::SyncError;
use crate::pipeline::SyncPipeline;

/// Wakes the worker without waiting for the next poll tick.
pub type WakeSignal = Arc<Notify>;

pub struct SyncWorker {
    pipeline: Arc<SyncPipeline>,
    wake: WakeSignal,
}

impl SyncWorker {
    pub fn new(pipeline: Arc<SyncPipeline>, wake: WakeSignal) -> Self {
        Self { pipeline, wake }
    }

    /// Runs the orphan scan, then drains the queue on every tick or wake-up until `shutdown`
    /// flips to `true`. A job in flight is never interrupted; shutdown is observed between jobs.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), SyncError> {
        let orphans = self.pipeline.jobs().recover_orphans().await?;
        info!(orphans = orphans.len(), "sync worker started");

        let mut ticker = tokio::time::interval(self.pipeline.config().poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            self.drain(&shutdown).await;
            if *shutdown.borrow() {
                break;
            }
        }

        info!("sync worker stopped");
        Ok(())
    }

    async fn drain(&self, shutdown: &watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            match self.pipeline.run_pending_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(err) => {
                    error!(error = %err, "sync worker could not process the queue");
                    break;
                }
            }
        }
    }
}
