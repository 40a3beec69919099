//! Postgres schema definitions
//!
//! All tables share a configurable prefix so several runtimes can coexist
//! in one database.

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Complete schema SQL, parameterized by table prefix
pub fn schema_sql(prefix: &str) -> String {
    format!(
        r#"
-- =============================================================================
-- Infrastructure: schema version tracking
-- =============================================================================
CREATE TABLE IF NOT EXISTS {p}schema_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL,
    applied_at BIGINT NOT NULL,
    description TEXT
);

-- =============================================================================
-- 1. Streams
-- =============================================================================
CREATE TABLE IF NOT EXISTS {p}streams (
    stream_id TEXT PRIMARY KEY,
    seq BIGINT NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_{p}streams_updated ON {p}streams(updated_at);

-- =============================================================================
-- 2. Messages
-- =============================================================================
CREATE TABLE IF NOT EXISTS {p}messages (
    global_seq BIGSERIAL PRIMARY KEY,
    id UUID NOT NULL UNIQUE,
    stream_id TEXT NOT NULL,
    seq BIGINT NOT NULL,
    type TEXT NOT NULL,
    payload JSONB NOT NULL,
    metadata JSONB NOT NULL DEFAULT '{{}}'::jsonb,
    causation_id UUID,
    correlation_id UUID,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (stream_id, seq)
);

CREATE INDEX IF NOT EXISTS idx_{p}messages_type_global ON {p}messages(type, global_seq);
CREATE INDEX IF NOT EXISTS idx_{p}messages_stream_global ON {p}messages(stream_id, global_seq);
CREATE INDEX IF NOT EXISTS idx_{p}messages_correlation ON {p}messages(correlation_id)
    WHERE correlation_id IS NOT NULL;

-- =============================================================================
-- 3. Consumer groups
-- =============================================================================
CREATE TABLE IF NOT EXISTS {p}consumer_groups (
    group_id TEXT PRIMARY KEY,
    status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'stopped')),
    highest_global_seq BIGINT NOT NULL DEFAULT 0,
    error_context JSONB,
    retry_at TIMESTAMPTZ
);

-- =============================================================================
-- 4. Offsets
-- =============================================================================
CREATE TABLE IF NOT EXISTS {p}offsets (
    group_id TEXT NOT NULL REFERENCES {p}consumer_groups(group_id) ON DELETE CASCADE,
    stream_id TEXT NOT NULL,
    global_seq BIGINT NOT NULL DEFAULT 0,
    claimed BOOLEAN NOT NULL DEFAULT FALSE,
    claimed_at TIMESTAMPTZ,
    claimed_by TEXT,
    PRIMARY KEY (group_id, stream_id)
);

CREATE INDEX IF NOT EXISTS idx_{p}offsets_unclaimed ON {p}offsets(group_id, stream_id)
    WHERE claimed = FALSE;
CREATE INDEX IF NOT EXISTS idx_{p}offsets_claimed ON {p}offsets(group_id, claimed_at)
    WHERE claimed = TRUE;

-- =============================================================================
-- 5. Scheduled messages
-- =============================================================================
CREATE TABLE IF NOT EXISTS {p}scheduled_messages (
    id UUID PRIMARY KEY,
    available_at TIMESTAMPTZ NOT NULL,
    message JSONB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_{p}scheduled_available ON {p}scheduled_messages(available_at);

-- =============================================================================
-- 6. Workers
-- =============================================================================
CREATE TABLE IF NOT EXISTS {p}workers (
    id TEXT PRIMARY KEY,
    last_seen TIMESTAMPTZ NOT NULL,
    pid INTEGER,
    host TEXT,
    info JSONB
);
"#,
        p = prefix
    )
}
