//! In-process notifier backed by a broadcast hub

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{Notifier, NotifyError, Signal, SignalSubscription};
use crate::core::constants::SIGNAL_HUB_CAPACITY;

/// In-process pub/sub hub; deliveries are synchronous on the publisher's call
pub struct InProcessNotifier {
    tx: broadcast::Sender<Signal>,
}

impl InProcessNotifier {
    pub fn new() -> Self {
        Self::with_capacity(SIGNAL_HUB_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish without an await point; used by the in-memory store, which
    /// fires signals while unwinding its own lock
    pub fn publish_now(&self, signal: Signal) {
        // Send errors mean no active subscribers
        let _ = self.tx.send(signal);
    }
}

impl Default for InProcessNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for InProcessNotifier {
    async fn publish(&self, signal: &Signal) -> Result<(), NotifyError> {
        self.publish_now(signal.clone());
        Ok(())
    }

    fn subscribe(&self) -> SignalSubscription {
        SignalSubscription::new(self.tx.subscribe())
    }
}
