//! Shutdown coordination for dispatcher task groups

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use super::constants::SHUTDOWN_TIMEOUT_SECS;

/// Shutdown coordinator for one group of related tasks
///
/// Tasks subscribe to the watch channel and exit when it flips to `true`;
/// their join handles are registered here so shutdown can wait for them.
/// The dispatcher holds one signal per stop stage (work producers, then
/// workers, then housekeeping) and triggers and joins them in sequence, so
/// subsystems stop in order rather than all at the same instant.
#[derive(Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a task handle to be awaited during shutdown
    pub async fn register(&self, handle: JoinHandle<()>) {
        self.handles.lock().await.push(handle);
    }

    /// Subscribe to the shutdown flag
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }

    /// Flip the shutdown flag
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until shutdown is triggered
    pub fn wait(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.rx.clone();
        async move {
            let _ = rx.wait_for(|&v| v).await;
        }
    }

    /// Wait for all registered tasks to finish, bounded by a timeout
    pub async fn join_all(&self) {
        let handles = std::mem::take(&mut *self.handles.lock().await);
        let count = handles.len();
        tracing::debug!(count, "waiting for dispatcher tasks to finish");

        let timeout = Duration::from_secs(SHUTDOWN_TIMEOUT_SECS);
        if tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_err()
        {
            tracing::warn!(
                timeout_secs = timeout.as_secs(),
                "timeout waiting for dispatcher tasks"
            );
        }
    }

    /// Install OS signal handlers and auto-trigger on Ctrl+C/SIGTERM
    pub fn install_signal_handlers(&self) {
        let signal = self.clone();
        tokio::spawn(async move {
            let ctrl_c = async {
                tokio::signal::ctrl_c()
                    .await
                    .expect("Failed to install Ctrl+C handler");
            };

            #[cfg(unix)]
            let terminate = async {
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to install SIGTERM handler")
                    .recv()
                    .await;
            };

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                _ = ctrl_c => tracing::debug!("received Ctrl+C, shutting down"),
                _ = terminate => tracing::debug!("received SIGTERM, shutting down"),
            }

            signal.trigger();
        });
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_not_triggered_initially() {
        let shutdown = ShutdownSignal::new();
        assert!(!shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_trigger_flips_flag() {
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_wait_returns_after_trigger() {
        let shutdown = ShutdownSignal::new();
        let wait_future = shutdown.wait();
        let handle = tokio::spawn(wait_future);

        tokio::task::yield_now().await;
        shutdown.trigger();

        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_subscriber_observes_trigger() {
        let shutdown = ShutdownSignal::new();
        let rx = shutdown.subscribe();
        assert!(!*rx.borrow());
        shutdown.trigger();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_join_all_awaits_registered_tasks() {
        let shutdown = ShutdownSignal::new();
        let mut rx = shutdown.subscribe();
        shutdown
            .register(tokio::spawn(async move {
                let _ = rx.wait_for(|&v| v).await;
            }))
            .await;

        shutdown.trigger();
        shutdown.join_all().await;
    }
}
