// =============================================================================
// Runtime Identity
// =============================================================================

/// Runtime name used in worker identity records and log fields
pub const RUNTIME_NAME: &str = "millrace";

// =============================================================================
// Environment Variables
// =============================================================================

/// Environment variable for the Postgres connection URL
pub const ENV_DATABASE_URL: &str = "MILLRACE_DATABASE_URL";

/// Environment variable overriding the storage table prefix
pub const ENV_TABLE_PREFIX: &str = "MILLRACE_TABLE_PREFIX";

/// Environment variable overriding the notification channel name
pub const ENV_NOTIFY_CHANNEL: &str = "MILLRACE_NOTIFY_CHANNEL";

/// Environment variable overriding the worker count
pub const ENV_WORKER_COUNT: &str = "MILLRACE_WORKER_COUNT";

// =============================================================================
// Storage Defaults
// =============================================================================

/// Default prefix for all runtime tables
pub const DEFAULT_TABLE_PREFIX: &str = "mr_";

/// Default maximum pool connections
pub const PG_DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Default minimum pool connections kept warm
pub const PG_DEFAULT_MIN_CONNECTIONS: u32 = 1;

/// Default pool acquire timeout (seconds)
pub const PG_DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 10;

/// Default idle connection timeout (seconds)
pub const PG_DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;

/// Default connection max lifetime (seconds)
pub const PG_DEFAULT_MAX_LIFETIME_SECS: u64 = 1800;

/// Default statement timeout (seconds)
pub const PG_DEFAULT_STATEMENT_TIMEOUT_SECS: u64 = 30;

/// Maximum scheduled messages promoted per tick
pub const SCHEDULED_PROMOTION_BATCH: i64 = 100;

// =============================================================================
// Notifier Defaults
// =============================================================================

/// Default LISTEN/NOTIFY channel carrying both signal kinds
pub const DEFAULT_NOTIFY_CHANNEL: &str = "mr_signals";

/// Capacity of the local signal broadcast hub
pub const SIGNAL_HUB_CAPACITY: usize = 1024;

/// Listener recv timeout so the stop flag stays observable (milliseconds)
pub const LISTEN_RECV_TIMEOUT_MS: u64 = 1_000;

/// Base delay for listener reconnect backoff (milliseconds)
pub const LISTENER_BASE_BACKOFF_MS: u64 = 100;

/// Cap for listener reconnect backoff (milliseconds)
pub const LISTENER_MAX_BACKOFF_MS: u64 = 5_000;

// =============================================================================
// Dispatch Defaults
// =============================================================================

/// Default parallel workers per process
pub const DEFAULT_WORKER_COUNT: usize = 2;

/// Default scan bound for the claim query
pub const DEFAULT_BATCH_SIZE: i64 = 50;

/// Default drain rounds per worker pickup (fairness bound)
pub const DEFAULT_MAX_DRAIN_ROUNDS: u32 = 10;

/// Default catch-up poll interval (seconds)
pub const DEFAULT_CATCHUP_INTERVAL_SECS: u64 = 5;

/// Default housekeeping interval (seconds)
pub const DEFAULT_HOUSEKEEPING_INTERVAL_SECS: u64 = 30;

/// Default age threshold for reaping stale claims (seconds)
pub const DEFAULT_CLAIM_TTL_SECS: u64 = 120;

/// Default fallback sleep between queue polls (milliseconds)
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

/// Default work queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 1_024;

/// Default copies of one reactor allowed in the queue at once
pub const DEFAULT_MAX_PER_REACTOR: usize = 2;

// =============================================================================
// Shutdown
// =============================================================================

/// Timeout for dispatcher tasks to finish during shutdown (seconds)
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 10;
