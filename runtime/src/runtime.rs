//! Embeddable runtime facade
//!
//! The composition root a host application holds: a store, a notifier, and
//! the registered reactors. Producers append through it; the dispatch
//! engine is spawned from it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::core::config::Config;
use crate::dispatch::Dispatcher;
use crate::model::{Message, NewMessage};
use crate::notify::{InProcessNotifier, Notifier, NotifyError, PostgresNotifier};
use crate::reactor::{Reactor, ReactorRegistry};
use crate::store::postgres::PostgresStore;
use crate::store::{GroupStats, MemoryStore, Store, StoreError};

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("notifier error: {0}")]
    Notify(#[from] NotifyError),

    #[error("configuration error: {0}")]
    Config(String),
}

/// An embeddable event-sourcing runtime instance
pub struct Runtime {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    registry: ReactorRegistry,
    config: Config,
}

impl Runtime {
    /// In-process runtime: memory store + in-process notifier. No
    /// durability; suited to tests and single-process embedding.
    pub fn in_memory() -> Self {
        Self::in_memory_with(Config::default())
    }

    pub fn in_memory_with(config: Config) -> Self {
        let notifier = Arc::new(InProcessNotifier::new());
        let store = Arc::new(MemoryStore::with_batch_size(
            Arc::clone(&notifier),
            config.dispatch.batch_size,
        ));
        Self {
            store,
            notifier,
            registry: ReactorRegistry::new(),
            config,
        }
    }

    /// Postgres runtime: durable log, LISTEN/NOTIFY transport, migrations
    /// run on init. Multiple processes cooperate through the database.
    pub async fn postgres(config: Config) -> Result<Self, EngineError> {
        let store =
            PostgresStore::init(&config.store, &config.notifier, config.dispatch.batch_size)
                .await?;
        let notifier = Arc::new(PostgresNotifier::new(
            store.pool().clone(),
            config.notifier.channel.clone(),
        ));
        Ok(Self {
            store: Arc::new(store),
            notifier,
            registry: ReactorRegistry::new(),
            config,
        })
    }

    /// Register a reactor. Registrations after [`Runtime::dispatcher`] do
    /// not affect already-built dispatchers.
    pub fn register(&mut self, reactor: Arc<dyn Reactor>) {
        self.registry.register(reactor);
    }

    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build a dispatcher over a snapshot of the current registry
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            Arc::clone(&self.store),
            Arc::clone(&self.notifier),
            Arc::new(self.registry.clone()),
            self.config.dispatch.clone(),
        )
    }

    // =========================================================================
    // Producer surface
    // =========================================================================

    /// Append messages to a stream; unset seqs continue from the head
    pub async fn append(
        &self,
        stream_id: &str,
        messages: Vec<NewMessage>,
    ) -> Result<Vec<Message>, StoreError> {
        self.store.append(stream_id, messages).await
    }

    /// Current head seq of a stream, for optimistic producers
    pub async fn current_seq(&self, stream_id: &str) -> Result<i64, StoreError> {
        self.store.current_seq(stream_id).await
    }

    pub async fn read_stream(
        &self,
        stream_id: &str,
        after: Option<i64>,
        upto: Option<i64>,
    ) -> Result<Vec<Message>, StoreError> {
        self.store.read_stream(stream_id, after, upto).await
    }

    /// Full causal chain sharing a correlation id
    pub async fn read_correlation_batch(
        &self,
        correlation_id: Uuid,
    ) -> Result<Vec<Message>, StoreError> {
        self.store.read_correlation_batch(correlation_id).await
    }

    /// Park messages until `available_at`; the catch-up poller promotes
    /// them into the log once due
    pub async fn schedule(
        &self,
        messages: Vec<NewMessage>,
        available_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.store.schedule_messages(messages, available_at).await
    }

    // =========================================================================
    // Operator surface
    // =========================================================================

    pub async fn stop_consumer_group(
        &self,
        group_id: &str,
        reason: &str,
    ) -> Result<(), StoreError> {
        self.store.stop_group(group_id, reason).await
    }

    pub async fn start_consumer_group(&self, group_id: &str) -> Result<(), StoreError> {
        self.store.start_group(group_id).await
    }

    pub async fn reset_consumer_group(&self, group_id: &str) -> Result<(), StoreError> {
        self.store.reset_group(group_id).await
    }

    pub async fn stats(&self) -> Result<Vec<GroupStats>, StoreError> {
        self.store.group_stats().await
    }
}
