//! Notification queuer
//!
//! Subscribes to the notifier and turns signals into work: appended types
//! are resolved to the reactors that handle them, a resumed reactor is
//! enqueued directly. Lost signals are tolerated — the catch-up poller is
//! the safety net.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::queue::WorkQueue;
use crate::notify::{NotifyError, Signal, SignalSubscription};
use crate::reactor::ReactorRegistry;

pub struct NotificationQueuer {
    queue: Arc<WorkQueue>,
    registry: Arc<ReactorRegistry>,
}

impl NotificationQueuer {
    pub fn new(queue: Arc<WorkQueue>, registry: Arc<ReactorRegistry>) -> Self {
        Self { queue, registry }
    }

    pub fn start(
        self,
        mut subscription: SignalSubscription,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::debug!("notification queuer started");
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    signal = subscription.recv() => {
                        match signal {
                            Ok(signal) => self.enqueue_for(signal),
                            Err(NotifyError::Lagged(n)) => {
                                // Dropped signals resurface via the poller
                                tracing::warn!(lagged = n, "queuer lagged behind the notifier");
                            }
                            Err(NotifyError::Closed) => break,
                            Err(e) => {
                                tracing::warn!(error = %e, "queuer receive error");
                            }
                        }
                    }
                }
            }
            tracing::debug!("notification queuer stopped");
        })
    }

    fn enqueue_for(&self, signal: Signal) {
        match signal {
            Signal::MessagesAppended(types) => {
                let mut groups: Vec<String> = Vec::new();
                for message_type in &types {
                    for group in self.registry.groups_for_type(message_type) {
                        if !groups.contains(&group) {
                            groups.push(group);
                        }
                    }
                }
                for group in groups {
                    self.queue.push(&group);
                }
            }
            Signal::ReactorResumed(group) => {
                if self.registry.get(&group).is_some() {
                    self.queue.push(&group);
                } else {
                    tracing::debug!(group = %group, "resume signal for unknown reactor");
                }
            }
        }
    }
}
