//! Postgres LISTEN/NOTIFY transport
//!
//! Publishers call `pg_notify(channel, payload)` — when done inside the
//! append transaction (as the Postgres store does) delivery commits
//! atomically with the append. A dedicated listener connection blocks on
//! `LISTEN` with a periodic timeout so the stop flag stays observable, and
//! forwards decoded signals into a local broadcast hub.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::{Notifier, NotifyError, Signal, SignalSubscription};
use crate::core::constants::{
    LISTEN_RECV_TIMEOUT_MS, LISTENER_BASE_BACKOFF_MS, LISTENER_MAX_BACKOFF_MS,
    SIGNAL_HUB_CAPACITY,
};

/// Database-backed notifier for multi-process deployments
pub struct PostgresNotifier {
    pool: PgPool,
    channel: String,
    hub: broadcast::Sender<Signal>,
}

impl PostgresNotifier {
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        let (hub, _) = broadcast::channel(SIGNAL_HUB_CAPACITY);
        Self {
            pool,
            channel: channel.into(),
            hub,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl Notifier for PostgresNotifier {
    async fn publish(&self, signal: &Signal) -> Result<(), NotifyError> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(signal.encode())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn subscribe(&self) -> SignalSubscription {
        SignalSubscription::new(self.hub.subscribe())
    }

    fn start_listener(&self, mut shutdown_rx: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let pool = self.pool.clone();
        let channel = self.channel.clone();
        let hub = self.hub.clone();

        Some(tokio::spawn(async move {
            let mut backoff_ms = LISTENER_BASE_BACKOFF_MS;

            'reconnect: while !*shutdown_rx.borrow() {
                let mut listener = match PgListener::connect_with(&pool).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        tracing::warn!(error = %e, "notify listener connect failed");
                        if wait_backoff(&mut shutdown_rx, &mut backoff_ms).await {
                            break;
                        }
                        continue;
                    }
                };

                if let Err(e) = listener.listen(&channel).await {
                    tracing::warn!(channel = %channel, error = %e, "LISTEN failed");
                    if wait_backoff(&mut shutdown_rx, &mut backoff_ms).await {
                        break;
                    }
                    continue;
                }

                tracing::debug!(channel = %channel, "notify listener connected");
                backoff_ms = LISTENER_BASE_BACKOFF_MS;

                loop {
                    if *shutdown_rx.borrow() {
                        break 'reconnect;
                    }

                    let recv = tokio::time::timeout(
                        Duration::from_millis(LISTEN_RECV_TIMEOUT_MS),
                        listener.recv(),
                    );
                    match recv.await {
                        // Timeout: loop around to observe the stop flag
                        Err(_) => continue,
                        Ok(Ok(notification)) => match Signal::decode(notification.payload()) {
                            Ok(signal) => {
                                let _ = hub.send(signal);
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "dropping malformed notification");
                            }
                        },
                        Ok(Err(e)) => {
                            tracing::warn!(error = %e, "notify listener connection lost");
                            continue 'reconnect;
                        }
                    }
                }
            }

            tracing::debug!("notify listener stopped");
        }))
    }
}

/// Sleep for the current backoff, doubling it up to the cap.
/// Returns true when shutdown was triggered during the wait.
async fn wait_backoff(shutdown_rx: &mut watch::Receiver<bool>, backoff_ms: &mut u64) -> bool {
    let delay = Duration::from_millis(*backoff_ms);
    *backoff_ms = (*backoff_ms * 2).min(LISTENER_MAX_BACKOFF_MS);
    tracing::debug!(delay_ms = delay.as_millis() as u64, "notify listener backing off");

    tokio::select! {
        _ = shutdown_rx.changed() => *shutdown_rx.borrow(),
        _ = tokio::time::sleep(delay) => false,
    }
}
