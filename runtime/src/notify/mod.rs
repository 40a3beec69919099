//! Notification transport
//!
//! Two signal kinds travel one channel: "messages of types T were appended"
//! and "reactor G resumed". Two implementations behind one trait:
//!
//! - [`InProcessNotifier`]: a broadcast hub, deliveries synchronous on the
//!   publisher's call. Used with the in-memory store and in tests.
//! - [`PostgresNotifier`]: publishers emit `pg_notify` inside the append
//!   transaction; a dedicated listener connection forwards notifications
//!   into a local broadcast hub.
//!
//! Wire format is `"<event>:<value>"`, split on the first `:`:
//! `messages_appended:Type1,Type2` (duplicate-free) or
//! `reactor_resumed:<group_id>`.

mod memory;
mod postgres;

pub use memory::InProcessNotifier;
pub use postgres::PostgresNotifier;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Wire event name for appended-messages signals
pub const EVENT_MESSAGES_APPENDED: &str = "messages_appended";

/// Wire event name for reactor-resumed signals
pub const EVENT_REACTOR_RESUMED: &str = "reactor_resumed";

/// A dispatch wake-up signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Messages of these types were appended to the log
    MessagesAppended(Vec<String>),
    /// A stopped consumer group was started again
    ReactorResumed(String),
}

impl Signal {
    /// Encode to the wire format, deduplicating type names
    pub fn encode(&self) -> String {
        match self {
            Signal::MessagesAppended(types) => {
                let mut seen: Vec<&str> = Vec::new();
                for t in types {
                    if !seen.contains(&t.as_str()) {
                        seen.push(t);
                    }
                }
                format!("{EVENT_MESSAGES_APPENDED}:{}", seen.join(","))
            }
            Signal::ReactorResumed(group_id) => {
                format!("{EVENT_REACTOR_RESUMED}:{group_id}")
            }
        }
    }

    /// Decode from the wire format
    pub fn decode(raw: &str) -> Result<Self, NotifyError> {
        let (event, value) = raw
            .split_once(':')
            .ok_or_else(|| NotifyError::Malformed(raw.to_string()))?;

        match event {
            EVENT_MESSAGES_APPENDED => {
                let mut types: Vec<String> = Vec::new();
                for t in value.split(',') {
                    if !t.is_empty() && !types.iter().any(|seen| seen == t) {
                        types.push(t.to_string());
                    }
                }
                if types.is_empty() {
                    return Err(NotifyError::Malformed(raw.to_string()));
                }
                Ok(Signal::MessagesAppended(types))
            }
            EVENT_REACTOR_RESUMED => {
                if value.is_empty() {
                    return Err(NotifyError::Malformed(raw.to_string()));
                }
                Ok(Signal::ReactorResumed(value.to_string()))
            }
            _ => Err(NotifyError::Malformed(raw.to_string())),
        }
    }
}

/// Error type for notifier operations
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification channel closed")]
    Closed,

    #[error("subscriber lagged by {0} signals")]
    Lagged(u64),

    #[error("malformed signal payload: {0}")]
    Malformed(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Notification transport trait
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Publish a signal to every subscriber
    async fn publish(&self, signal: &Signal) -> Result<(), NotifyError>;

    /// Subscribe to the signal feed
    fn subscribe(&self) -> SignalSubscription;

    /// Spawn the backing listener task, if this transport needs one
    ///
    /// The in-process hub delivers directly and returns `None`.
    fn start_listener(&self, _shutdown_rx: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        None
    }
}

/// Subscription to the signal feed
pub struct SignalSubscription {
    rx: broadcast::Receiver<Signal>,
}

impl SignalSubscription {
    pub(crate) fn new(rx: broadcast::Receiver<Signal>) -> Self {
        Self { rx }
    }

    /// Receive the next signal
    pub async fn recv(&mut self) -> Result<Signal, NotifyError> {
        match self.rx.recv().await {
            Ok(signal) => Ok(signal),
            Err(broadcast::error::RecvError::Closed) => Err(NotifyError::Closed),
            Err(broadcast::error::RecvError::Lagged(n)) => Err(NotifyError::Lagged(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_messages_appended() {
        let signal = Signal::MessagesAppended(vec!["A".into(), "B".into()]);
        assert_eq!(signal.encode(), "messages_appended:A,B");
    }

    #[test]
    fn test_encode_deduplicates_types() {
        let signal = Signal::MessagesAppended(vec!["A".into(), "B".into(), "A".into()]);
        assert_eq!(signal.encode(), "messages_appended:A,B");
    }

    #[test]
    fn test_encode_reactor_resumed() {
        let signal = Signal::ReactorResumed("carts".into());
        assert_eq!(signal.encode(), "reactor_resumed:carts");
    }

    #[test]
    fn test_decode_round_trip() {
        for signal in [
            Signal::MessagesAppended(vec!["ItemAdded".into(), "AdminEmailed".into()]),
            Signal::ReactorResumed("mailer".into()),
        ] {
            assert_eq!(Signal::decode(&signal.encode()).unwrap(), signal);
        }
    }

    #[test]
    fn test_decode_splits_on_first_colon() {
        // Group ids may themselves contain colons
        let signal = Signal::decode("reactor_resumed:app:carts").unwrap();
        assert_eq!(signal, Signal::ReactorResumed("app:carts".into()));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(
            Signal::decode("no-separator"),
            Err(NotifyError::Malformed(_))
        ));
        assert!(matches!(
            Signal::decode("unknown_event:x"),
            Err(NotifyError::Malformed(_))
        ));
        assert!(matches!(
            Signal::decode("messages_appended:"),
            Err(NotifyError::Malformed(_))
        ));
        assert!(matches!(
            Signal::decode("reactor_resumed:"),
            Err(NotifyError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_skips_empty_type_entries() {
        let signal = Signal::decode("messages_appended:A,,B,").unwrap();
        assert_eq!(
            signal,
            Signal::MessagesAppended(vec!["A".into(), "B".into()])
        );
    }
}
