//! Runtime configuration
//!
//! Plain serde structs with defaults from `core::constants`, so a host
//! application can embed them in its own config file or build them from the
//! environment via [`Config::from_env`].

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use super::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_CATCHUP_INTERVAL_SECS, DEFAULT_CLAIM_TTL_SECS,
    DEFAULT_HOUSEKEEPING_INTERVAL_SECS, DEFAULT_MAX_DRAIN_ROUNDS, DEFAULT_MAX_PER_REACTOR,
    DEFAULT_NOTIFY_CHANNEL, DEFAULT_POLL_INTERVAL_MS, DEFAULT_QUEUE_CAPACITY,
    DEFAULT_TABLE_PREFIX, DEFAULT_WORKER_COUNT, ENV_DATABASE_URL, ENV_NOTIFY_CHANNEL,
    ENV_TABLE_PREFIX, ENV_WORKER_COUNT, PG_DEFAULT_ACQUIRE_TIMEOUT_SECS,
    PG_DEFAULT_IDLE_TIMEOUT_SECS, PG_DEFAULT_MAX_CONNECTIONS, PG_DEFAULT_MAX_LIFETIME_SECS,
    PG_DEFAULT_MIN_CONNECTIONS, PG_DEFAULT_STATEMENT_TIMEOUT_SECS,
};

/// Top-level runtime configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub notifier: NotifierConfig,
    pub dispatch: DispatchConfig,
}

impl Config {
    /// Build a configuration from the environment, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        if let Ok(url) = std::env::var(ENV_DATABASE_URL) {
            config.store.url = url;
        }
        if let Ok(prefix) = std::env::var(ENV_TABLE_PREFIX) {
            config.store.table_prefix = prefix;
        }
        if let Ok(channel) = std::env::var(ENV_NOTIFY_CHANNEL) {
            config.notifier.channel = channel;
        }
        if let Ok(raw) = std::env::var(ENV_WORKER_COUNT) {
            config.dispatch.worker_count = raw
                .parse()
                .with_context(|| format!("invalid {ENV_WORKER_COUNT}: {raw}"))?;
        }
        Ok(config)
    }
}

/// Postgres log store configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Connection URL; required for the Postgres backend
    pub url: String,
    /// Prefix applied to every runtime table
    pub table_prefix: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
    pub statement_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            table_prefix: DEFAULT_TABLE_PREFIX.to_string(),
            max_connections: PG_DEFAULT_MAX_CONNECTIONS,
            min_connections: PG_DEFAULT_MIN_CONNECTIONS,
            acquire_timeout_secs: PG_DEFAULT_ACQUIRE_TIMEOUT_SECS,
            idle_timeout_secs: PG_DEFAULT_IDLE_TIMEOUT_SECS,
            max_lifetime_secs: PG_DEFAULT_MAX_LIFETIME_SECS,
            statement_timeout_secs: PG_DEFAULT_STATEMENT_TIMEOUT_SECS,
        }
    }
}

/// Notification transport configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Channel name carrying both signal kinds
    pub channel: String,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            channel: DEFAULT_NOTIFY_CHANNEL.to_string(),
        }
    }
}

/// Dispatch engine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Parallel workers per process
    pub worker_count: usize,
    /// Bounded scan limit for the claim query
    pub batch_size: i64,
    /// Fairness bound per worker pickup
    pub max_drain_rounds: u32,
    /// Catch-up poller period (seconds)
    pub catchup_interval_secs: u64,
    /// Heartbeat + reaper period (seconds)
    pub housekeeping_interval_secs: u64,
    /// Age threshold for reaping stale claims (seconds)
    pub claim_ttl_secs: u64,
    /// Fallback sleep between polls when signalling is unavailable (milliseconds)
    pub poll_interval_ms: u64,
    /// Work queue capacity
    pub queue_capacity: usize,
    /// Copies of one reactor allowed in the queue at once
    pub max_per_reactor: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            batch_size: DEFAULT_BATCH_SIZE,
            max_drain_rounds: DEFAULT_MAX_DRAIN_ROUNDS,
            catchup_interval_secs: DEFAULT_CATCHUP_INTERVAL_SECS,
            housekeeping_interval_secs: DEFAULT_HOUSEKEEPING_INTERVAL_SECS,
            claim_ttl_secs: DEFAULT_CLAIM_TTL_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_per_reactor: DEFAULT_MAX_PER_REACTOR,
        }
    }
}

impl DispatchConfig {
    pub fn catchup_interval(&self) -> Duration {
        Duration::from_secs(self.catchup_interval_secs)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_secs(self.housekeeping_interval_secs)
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
