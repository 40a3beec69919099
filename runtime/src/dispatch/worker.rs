//! Worker: drains the work queue through the router
//!
//! A worker pops one reactor group at a time and runs bounded drain rounds
//! against it. If every round was productive there is probably more work,
//! so the group is re-enqueued instead of drained to exhaustion; that keeps
//! scheduling fair across reactors under load while avoiding queue churn
//! when only one reactor is busy.

use std::sync::Arc;

use tokio::task::JoinHandle;
use uuid::Uuid;

use super::queue::WorkQueue;
use super::router::Router;
use crate::reactor::ReactorRegistry;

pub struct Worker {
    id: String,
    queue: Arc<WorkQueue>,
    router: Arc<Router>,
    registry: Arc<ReactorRegistry>,
    max_drain_rounds: u32,
}

impl Worker {
    /// `index` is the worker's slot within this process; it becomes the
    /// last segment of the `uuid:pid:n` identity
    pub fn new(
        index: usize,
        queue: Arc<WorkQueue>,
        router: Arc<Router>,
        registry: Arc<ReactorRegistry>,
        max_drain_rounds: u32,
    ) -> Self {
        Self {
            id: format!("{}:{}:{}", Uuid::new_v4(), std::process::id(), index),
            queue,
            router,
            registry,
            max_drain_rounds,
        }
    }

    /// Unique worker name; recorded in claims and heartbeats
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run until the queue delivers a shutdown sentinel
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::debug!(worker = %self.id, "worker started");
            while let Some(group_id) = self.queue.pop().await {
                self.drain(&group_id).await;
            }
            tracing::debug!(worker = %self.id, "worker stopped");
        })
    }

    async fn drain(&self, group_id: &str) {
        let Some(reactor) = self.registry.get(group_id) else {
            tracing::warn!(group = group_id, "no reactor registered for queued group");
            return;
        };

        for _ in 0..self.max_drain_rounds {
            match self.router.handle_next_for(reactor.as_ref(), &self.id).await {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    tracing::warn!(
                        worker = %self.id,
                        group = group_id,
                        error = %e,
                        "turn failed"
                    );
                    return;
                }
            }
        }

        // Every round was productive; there is probably more
        self.queue.push(group_id);
    }
}
