//! Dispatcher: composes the dispatch engine into a running process
//!
//! Wires together the work queue, N workers, the notification queuer, the
//! catch-up poller, the housekeeping loop, and (when the transport needs
//! one) the notifier listener. Shutdown is staged: the work producers
//! (listener, queuer, poller) are signalled and joined first so no new
//! work can arrive, then the queue closes with one sentinel per worker and
//! the workers drain out, and housekeeping stops last so heartbeats and
//! the reaper cover the whole drain.

use std::sync::Arc;

use super::housekeeping::Housekeeping;
use super::poller::CatchUpPoller;
use super::queue::WorkQueue;
use super::queuer::NotificationQueuer;
use super::router::Router;
use super::worker::Worker;
use crate::core::config::DispatchConfig;
use crate::core::shutdown::ShutdownSignal;
use crate::model::WorkerInfo;
use crate::notify::Notifier;
use crate::reactor::ReactorRegistry;
use crate::store::{Store, StoreError};

pub struct Dispatcher {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    registry: Arc<ReactorRegistry>,
    config: DispatchConfig,
    queue: Arc<WorkQueue>,
    /// Stage 1: notifier listener, queuer, and poller — everything that
    /// feeds the queue
    producers: ShutdownSignal,
    /// Stage 2: the workers; they carry no flag and exit on the queue
    /// sentinels, this signal only collects their handles
    workers: ShutdownSignal,
    /// Stage 3: heartbeats + reaper, stopped after the workers are gone
    housekeeping: ShutdownSignal,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        registry: Arc<ReactorRegistry>,
        config: DispatchConfig,
    ) -> Self {
        let queue = Arc::new(WorkQueue::new(
            config.queue_capacity,
            config.max_per_reactor,
            config.poll_interval(),
        ));
        Self {
            store,
            notifier,
            registry,
            config,
            queue,
            producers: ShutdownSignal::new(),
            workers: ShutdownSignal::new(),
            housekeeping: ShutdownSignal::new(),
        }
    }

    /// Register every reactor's group and spawn all subsystems.
    /// Call once per dispatcher.
    pub async fn start(&self) -> Result<(), StoreError> {
        if self.registry.is_empty() {
            tracing::warn!("dispatcher starting with no reactors registered");
        }
        for group_id in self.registry.group_ids() {
            self.store.register_group(&group_id).await?;
        }

        // Listener first so signals flow before anything produces them
        if let Some(handle) = self.notifier.start_listener(self.producers.subscribe()) {
            self.producers.register(handle).await;
        }

        let queuer = NotificationQueuer::new(Arc::clone(&self.queue), Arc::clone(&self.registry));
        self.producers
            .register(queuer.start(self.notifier.subscribe(), self.producers.subscribe()))
            .await;

        let router = Arc::new(Router::new(Arc::clone(&self.store)));
        let mut worker_infos = Vec::with_capacity(self.config.worker_count);
        for index in 0..self.config.worker_count {
            let worker = Worker::new(
                index,
                Arc::clone(&self.queue),
                Arc::clone(&router),
                Arc::clone(&self.registry),
                self.config.max_drain_rounds,
            );
            worker_infos.push(WorkerInfo::for_process(worker.id()));
            self.workers.register(worker.spawn()).await;
        }

        let housekeeping = Housekeeping::new(
            Arc::clone(&self.store),
            worker_infos,
            self.config.housekeeping_interval(),
            self.config.claim_ttl(),
        );
        self.housekeeping
            .register(housekeeping.start(self.housekeeping.subscribe()))
            .await;

        let poller = CatchUpPoller::new(
            Arc::clone(&self.store),
            Arc::clone(&self.queue),
            Arc::clone(&self.registry),
            self.config.catchup_interval(),
        );
        self.producers
            .register(poller.start(self.producers.subscribe()))
            .await;

        // Seed the queue so a cold start drains backlog without waiting for
        // a signal or a poll tick
        for group_id in self.registry.group_ids() {
            self.queue.push(&group_id);
        }

        tracing::debug!(
            workers = self.config.worker_count,
            reactors = self.registry.len(),
            "dispatcher started"
        );
        Ok(())
    }

    /// Graceful stop, staged so each step completes before the next starts:
    /// 1. stop and join the producers, so nothing can push after this
    /// 2. close the queue with one sentinel per worker; workers drain the
    ///    remaining items, hit a sentinel, and exit
    /// 3. stop housekeeping, which was alive for the whole drain
    pub async fn stop(&self) {
        tracing::debug!("dispatcher stopping");

        self.producers.trigger();
        self.producers.join_all().await;

        self.queue.close(self.config.worker_count);
        self.workers.join_all().await;

        self.housekeeping.trigger();
        self.housekeeping.join_all().await;

        tracing::debug!("dispatcher stopped");
    }

    /// Install OS signal handlers, block until one fires, then stop
    pub async fn run_until_shutdown(&self) {
        self.producers.install_signal_handlers();
        self.producers.wait().await;
        self.stop().await;
    }

    pub fn is_stopping(&self) -> bool {
        self.producers.is_triggered()
    }
}
