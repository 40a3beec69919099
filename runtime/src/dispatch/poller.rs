//! Catch-up poller
//!
//! Safety net against lost notifications (restart, LISTEN connection loss):
//! every tick it promotes due scheduled messages into the log, then
//! enqueues every registered reactor. Anything a signal missed is picked up
//! here within one interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::queue::WorkQueue;
use crate::reactor::ReactorRegistry;
use crate::store::Store;

pub struct CatchUpPoller {
    store: Arc<dyn Store>,
    queue: Arc<WorkQueue>,
    registry: Arc<ReactorRegistry>,
    interval: Duration,
}

impl CatchUpPoller {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<WorkQueue>,
        registry: Arc<ReactorRegistry>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            interval,
        }
    }

    pub fn start(self, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::debug!(interval_secs = self.interval.as_secs(), "catch-up poller started");
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Skip the immediate first tick; the dispatcher seeds the queue
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
                        self.tick().await;
                    }
                }
            }
            tracing::debug!("catch-up poller stopped");
        })
    }

    async fn tick(&self) {
        match self.store.promote_due_scheduled().await {
            Ok(0) => {}
            Ok(promoted) => tracing::debug!(promoted, "promoted scheduled messages"),
            Err(e) => tracing::warn!(error = %e, "scheduled message promotion failed"),
        }

        for group in self.registry.group_ids() {
            self.queue.push(&group);
        }
    }
}
