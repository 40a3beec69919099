//! Housekeeping: worker heartbeats and the stale-claim reaper
//!
//! One task per process. A reap runs immediately on startup to recover
//! claims held by a previously killed process; after that, every interval
//! the local workers' liveness rows are upserted and expired or orphaned
//! claims are released.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::model::WorkerInfo;
use crate::store::Store;

pub struct Housekeeping {
    store: Arc<dyn Store>,
    workers: Vec<WorkerInfo>,
    interval: Duration,
    claim_ttl: Duration,
}

impl Housekeeping {
    pub fn new(
        store: Arc<dyn Store>,
        workers: Vec<WorkerInfo>,
        interval: Duration,
        claim_ttl: Duration,
    ) -> Self {
        Self {
            store,
            workers,
            interval,
            claim_ttl,
        }
    }

    pub fn start(self, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::debug!(
                workers = self.workers.len(),
                interval_secs = self.interval.as_secs(),
                claim_ttl_secs = self.claim_ttl.as_secs(),
                "housekeeping started"
            );

            // Startup reap recovers claims from a killed predecessor
            self.run_once().await;

            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        self.run_once().await;
                    }
                }
            }
            tracing::debug!("housekeeping stopped");
        })
    }

    async fn run_once(&self) {
        if let Err(e) = self.store.record_worker_heartbeats(&self.workers).await {
            tracing::warn!(error = %e, "worker heartbeat failed");
        }

        match self.store.release_stale_claims(self.claim_ttl).await {
            Ok(0) => {}
            Ok(released) => tracing::info!(released, "released stale claims"),
            Err(e) => tracing::warn!(error = %e, "stale claim reap failed"),
        }
    }
}
