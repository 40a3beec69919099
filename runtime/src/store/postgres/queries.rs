//! Postgres log store queries
//!
//! Free async functions over `PgExecutor` so the same query runs against
//! the pool or inside a transaction. Table names carry the configured
//! prefix, so every statement is built at runtime.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::model::{Message, NewMessage, WorkerInfo};
use crate::notify::Signal;
use crate::store::{ConsumerGroupState, GroupStats, GroupStatus, StoreError, StreamHead};

const MESSAGE_COLUMNS: &str =
    "global_seq, id, stream_id, seq, type, payload, metadata, causation_id, correlation_id, created_at";

fn parse_status(raw: &str) -> Result<GroupStatus, StoreError> {
    GroupStatus::parse(raw).ok_or_else(|| {
        StoreError::Database(sqlx::Error::Decode(
            format!("unknown consumer group status: {raw}").into(),
        ))
    })
}

// =============================================================================
// Streams and messages
// =============================================================================

/// Current stream head, taking a row lock so concurrent appends to the same
/// stream serialize inside their transactions. 0 when the stream is new (in
/// which case the messages unique index is the cross-process backstop).
pub async fn stream_head_for_update(
    executor: impl PgExecutor<'_>,
    prefix: &str,
    stream_id: &str,
) -> Result<i64, StoreError> {
    let head: Option<(i64,)> =
        sqlx::query_as(&format!("SELECT seq FROM {prefix}streams WHERE stream_id = $1 FOR UPDATE"))
            .bind(stream_id)
            .fetch_optional(executor)
            .await?;
    Ok(head.map(|(seq,)| seq).unwrap_or(0))
}

pub async fn stream_head(
    executor: impl PgExecutor<'_>,
    prefix: &str,
    stream_id: &str,
) -> Result<i64, StoreError> {
    let head: Option<(i64,)> =
        sqlx::query_as(&format!("SELECT seq FROM {prefix}streams WHERE stream_id = $1"))
            .bind(stream_id)
            .fetch_optional(executor)
            .await?;
    Ok(head.map(|(seq,)| seq).unwrap_or(0))
}

/// Insert one message at an explicit seq; unique violations on
/// `(stream_id, seq)` surface as the typed conflict
pub async fn insert_message(
    executor: impl PgExecutor<'_>,
    prefix: &str,
    stream_id: &str,
    seq: i64,
    message: NewMessage,
) -> Result<Message, StoreError> {
    let correlation_id = message.correlation_id.or(Some(message.id));
    let sql = format!(
        "INSERT INTO {prefix}messages \
         (id, stream_id, seq, type, payload, metadata, causation_id, correlation_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING {MESSAGE_COLUMNS}"
    );
    sqlx::query_as::<_, Message>(&sql)
        .bind(message.id)
        .bind(stream_id)
        .bind(seq)
        .bind(&message.message_type)
        .bind(&message.payload)
        .bind(&message.metadata)
        .bind(message.causation_id)
        .bind(correlation_id)
        .fetch_one(executor)
        .await
        .map_err(|e| StoreError::from_insert(e, stream_id, seq))
}

pub async fn upsert_stream_head(
    executor: impl PgExecutor<'_>,
    prefix: &str,
    stream_id: &str,
    seq: i64,
) -> Result<(), StoreError> {
    sqlx::query(&format!(
        "INSERT INTO {prefix}streams (stream_id, seq, updated_at) VALUES ($1, $2, now()) \
         ON CONFLICT (stream_id) DO UPDATE \
         SET seq = GREATEST({prefix}streams.seq, EXCLUDED.seq), updated_at = EXCLUDED.updated_at"
    ))
    .bind(stream_id)
    .bind(seq)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn read_stream(
    executor: impl PgExecutor<'_>,
    prefix: &str,
    stream_id: &str,
    after: Option<i64>,
    upto: Option<i64>,
) -> Result<Vec<Message>, StoreError> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM {prefix}messages \
         WHERE stream_id = $1 AND seq > $2 AND ($3::bigint IS NULL OR seq <= $3) \
         ORDER BY seq"
    );
    let messages = sqlx::query_as::<_, Message>(&sql)
        .bind(stream_id)
        .bind(after.unwrap_or(0))
        .bind(upto)
        .fetch_all(executor)
        .await?;
    Ok(messages)
}

pub async fn read_correlation_batch(
    executor: impl PgExecutor<'_>,
    prefix: &str,
    correlation_id: Uuid,
) -> Result<Vec<Message>, StoreError> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM {prefix}messages \
         WHERE correlation_id = $1 ORDER BY global_seq"
    );
    let messages = sqlx::query_as::<_, Message>(&sql)
        .bind(correlation_id)
        .fetch_all(executor)
        .await?;
    Ok(messages)
}

pub async fn read_recent_streams(
    executor: impl PgExecutor<'_>,
    prefix: &str,
    limit: i64,
) -> Result<Vec<StreamHead>, StoreError> {
    let heads = sqlx::query_as::<_, StreamHead>(&format!(
        "SELECT stream_id, seq, updated_at FROM {prefix}streams \
         ORDER BY updated_at DESC LIMIT $1"
    ))
    .bind(limit)
    .fetch_all(executor)
    .await?;
    Ok(heads)
}

// =============================================================================
// Claim protocol
// =============================================================================

/// Candidate streams for a group, ordered by smallest deliverable global
/// seq, bounded by the scan limit
pub async fn claim_candidates(
    executor: impl PgExecutor<'_>,
    prefix: &str,
    group_id: &str,
    handled_types: &[String],
    batch_size: i64,
) -> Result<Vec<String>, StoreError> {
    let sql = format!(
        "SELECT m.stream_id \
         FROM {prefix}messages m \
         LEFT JOIN {prefix}offsets o ON o.group_id = $1 AND o.stream_id = m.stream_id \
         WHERE m.type = ANY($2) \
           AND COALESCE(o.claimed, FALSE) = FALSE \
           AND m.global_seq > COALESCE(o.global_seq, 0) \
         ORDER BY m.global_seq \
         LIMIT $3"
    );
    let rows: Vec<(String,)> = sqlx::query_as(&sql)
        .bind(group_id)
        .bind(handled_types.to_vec())
        .bind(batch_size)
        .fetch_all(executor)
        .await?;

    let mut streams: Vec<String> = Vec::new();
    for (stream_id,) in rows {
        if !streams.contains(&stream_id) {
            streams.push(stream_id);
        }
    }
    Ok(streams)
}

/// Conditional-update claim: wins only when the offset row is unclaimed.
/// Returns the group's acked global seq for the stream when the claim
/// succeeded, `None` when another worker holds it.
pub async fn try_claim(
    executor: impl PgExecutor<'_>,
    prefix: &str,
    group_id: &str,
    stream_id: &str,
    worker_id: &str,
) -> Result<Option<i64>, StoreError> {
    let sql = format!(
        "INSERT INTO {prefix}offsets (group_id, stream_id, global_seq, claimed, claimed_at, claimed_by) \
         VALUES ($1, $2, 0, TRUE, now(), $3) \
         ON CONFLICT (group_id, stream_id) DO UPDATE \
         SET claimed = TRUE, claimed_at = now(), claimed_by = $3 \
         WHERE {prefix}offsets.claimed = FALSE \
         RETURNING global_seq"
    );
    let row: Option<(i64,)> = sqlx::query_as(&sql)
        .bind(group_id)
        .bind(stream_id)
        .bind(worker_id)
        .fetch_optional(executor)
        .await?;
    Ok(row.map(|(global_seq,)| global_seq))
}

/// First handled message on a stream past the group's offset
pub async fn next_unacked(
    executor: impl PgExecutor<'_>,
    prefix: &str,
    stream_id: &str,
    handled_types: &[String],
    after_global_seq: i64,
) -> Result<Option<Message>, StoreError> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM {prefix}messages \
         WHERE stream_id = $1 AND type = ANY($2) AND global_seq > $3 \
         ORDER BY global_seq LIMIT 1"
    );
    let message = sqlx::query_as::<_, Message>(&sql)
        .bind(stream_id)
        .bind(handled_types.to_vec())
        .bind(after_global_seq)
        .fetch_optional(executor)
        .await?;
    Ok(message)
}

/// Select the claim row for update, verifying it is still held by the
/// worker. Used inside the commit transaction.
pub async fn lock_held_claim(
    executor: impl PgExecutor<'_>,
    prefix: &str,
    group_id: &str,
    stream_id: &str,
    worker_id: &str,
) -> Result<bool, StoreError> {
    let row: Option<(bool,)> = sqlx::query_as(&format!(
        "SELECT claimed FROM {prefix}offsets \
         WHERE group_id = $1 AND stream_id = $2 AND claimed_by = $3 FOR UPDATE"
    ))
    .bind(group_id)
    .bind(stream_id)
    .bind(worker_id)
    .fetch_optional(executor)
    .await?;
    Ok(matches!(row, Some((true,))))
}

/// Advance the offset and clear the claim
pub async fn advance_offset(
    executor: impl PgExecutor<'_>,
    prefix: &str,
    group_id: &str,
    stream_id: &str,
    global_seq: i64,
) -> Result<(), StoreError> {
    sqlx::query(&format!(
        "INSERT INTO {prefix}offsets (group_id, stream_id, global_seq, claimed) \
         VALUES ($1, $2, $3, FALSE) \
         ON CONFLICT (group_id, stream_id) DO UPDATE \
         SET global_seq = GREATEST({prefix}offsets.global_seq, EXCLUDED.global_seq), \
             claimed = FALSE, claimed_at = NULL, claimed_by = NULL"
    ))
    .bind(group_id)
    .bind(stream_id)
    .bind(global_seq)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn release_claim(
    executor: impl PgExecutor<'_>,
    prefix: &str,
    group_id: &str,
    stream_id: &str,
    worker_id: &str,
) -> Result<(), StoreError> {
    sqlx::query(&format!(
        "UPDATE {prefix}offsets \
         SET claimed = FALSE, claimed_at = NULL, claimed_by = NULL \
         WHERE group_id = $1 AND stream_id = $2 AND claimed_by = $3"
    ))
    .bind(group_id)
    .bind(stream_id)
    .bind(worker_id)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn raise_group_watermark(
    executor: impl PgExecutor<'_>,
    prefix: &str,
    group_id: &str,
    global_seq: i64,
) -> Result<(), StoreError> {
    sqlx::query(&format!(
        "UPDATE {prefix}consumer_groups \
         SET highest_global_seq = GREATEST(highest_global_seq, $2) \
         WHERE group_id = $1"
    ))
    .bind(group_id)
    .bind(global_seq)
    .execute(executor)
    .await?;
    Ok(())
}

// =============================================================================
// Housekeeping
// =============================================================================

pub async fn prune_dead_workers(
    executor: impl PgExecutor<'_>,
    prefix: &str,
    cutoff: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let result = sqlx::query(&format!("DELETE FROM {prefix}workers WHERE last_seen < $1"))
        .bind(cutoff)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

pub async fn release_stale_claims(
    executor: impl PgExecutor<'_>,
    prefix: &str,
    cutoff: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let result = sqlx::query(&format!(
        "UPDATE {prefix}offsets \
         SET claimed = FALSE, claimed_at = NULL, claimed_by = NULL \
         WHERE claimed = TRUE \
           AND (claimed_at IS NULL OR claimed_at < $1 \
                OR claimed_by IS NULL \
                OR claimed_by NOT IN (SELECT id FROM {prefix}workers))"
    ))
    .bind(cutoff)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

pub async fn upsert_worker(
    executor: impl PgExecutor<'_>,
    prefix: &str,
    worker: &WorkerInfo,
) -> Result<(), StoreError> {
    sqlx::query(&format!(
        "INSERT INTO {prefix}workers (id, last_seen, pid, host, info) \
         VALUES ($1, now(), $2, $3, $4) \
         ON CONFLICT (id) DO UPDATE SET last_seen = now()"
    ))
    .bind(&worker.id)
    .bind(worker.pid)
    .bind(&worker.host)
    .bind(&worker.info)
    .execute(executor)
    .await?;
    Ok(())
}

// =============================================================================
// Scheduled messages
// =============================================================================

pub async fn insert_scheduled(
    executor: impl PgExecutor<'_>,
    prefix: &str,
    message: &NewMessage,
    available_at: DateTime<Utc>,
) -> Result<(), StoreError> {
    let body = serde_json::to_value(message)?;
    sqlx::query(&format!(
        "INSERT INTO {prefix}scheduled_messages (id, available_at, message) VALUES ($1, $2, $3)"
    ))
    .bind(message.id)
    .bind(available_at)
    .bind(body)
    .execute(executor)
    .await?;
    Ok(())
}

/// Due scheduled rows, locked so concurrent promoters skip each other
pub async fn due_scheduled(
    executor: impl PgExecutor<'_>,
    prefix: &str,
    limit: i64,
) -> Result<Vec<(Uuid, Value)>, StoreError> {
    let rows: Vec<(Uuid, Value)> = sqlx::query_as(&format!(
        "SELECT id, message FROM {prefix}scheduled_messages \
         WHERE available_at <= now() \
         ORDER BY available_at LIMIT $1 \
         FOR UPDATE SKIP LOCKED"
    ))
    .bind(limit)
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

pub async fn delete_scheduled(
    executor: impl PgExecutor<'_>,
    prefix: &str,
    id: Uuid,
) -> Result<(), StoreError> {
    sqlx::query(&format!("DELETE FROM {prefix}scheduled_messages WHERE id = $1"))
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

// =============================================================================
// Consumer group lifecycle
// =============================================================================

pub async fn register_group(
    executor: impl PgExecutor<'_>,
    prefix: &str,
    group_id: &str,
) -> Result<(), StoreError> {
    sqlx::query(&format!(
        "INSERT INTO {prefix}consumer_groups (group_id) VALUES ($1) \
         ON CONFLICT (group_id) DO NOTHING"
    ))
    .bind(group_id)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn stop_group(
    executor: impl PgExecutor<'_>,
    prefix: &str,
    group_id: &str,
    error_context: &Value,
) -> Result<(), StoreError> {
    sqlx::query(&format!(
        "INSERT INTO {prefix}consumer_groups (group_id, status, error_context) \
         VALUES ($1, 'stopped', $2) \
         ON CONFLICT (group_id) DO UPDATE SET status = 'stopped', error_context = $2"
    ))
    .bind(group_id)
    .bind(error_context)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn start_group(
    executor: impl PgExecutor<'_>,
    prefix: &str,
    group_id: &str,
) -> Result<(), StoreError> {
    sqlx::query(&format!(
        "INSERT INTO {prefix}consumer_groups (group_id) VALUES ($1) \
         ON CONFLICT (group_id) DO UPDATE \
         SET status = 'active', error_context = NULL, retry_at = NULL"
    ))
    .bind(group_id)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn reset_group(
    executor: impl PgExecutor<'_>,
    prefix: &str,
    group_id: &str,
) -> Result<(), StoreError> {
    sqlx::query(&format!("DELETE FROM {prefix}offsets WHERE group_id = $1"))
        .bind(group_id)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn set_group_retry(
    executor: impl PgExecutor<'_>,
    prefix: &str,
    group_id: &str,
    retry_at: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(&format!(
        "UPDATE {prefix}consumer_groups SET retry_at = $2 WHERE group_id = $1"
    ))
    .bind(group_id)
    .bind(retry_at)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn fetch_group(
    executor: impl PgExecutor<'_>,
    prefix: &str,
    group_id: &str,
) -> Result<Option<ConsumerGroupState>, StoreError> {
    let row: Option<(String, i64, Option<Value>, Option<DateTime<Utc>>)> = sqlx::query_as(&format!(
        "SELECT status, highest_global_seq, error_context, retry_at \
         FROM {prefix}consumer_groups WHERE group_id = $1"
    ))
    .bind(group_id)
    .fetch_optional(executor)
    .await?;

    match row {
        None => Ok(None),
        Some((status, highest_global_seq, error_context, retry_at)) => {
            Ok(Some(ConsumerGroupState {
                group_id: group_id.to_string(),
                status: parse_status(&status)?,
                highest_global_seq,
                error_context,
                retry_at,
            }))
        }
    }
}

pub async fn group_stats(
    executor: impl PgExecutor<'_>,
    prefix: &str,
) -> Result<Vec<GroupStats>, StoreError> {
    let rows: Vec<(String, String, i64, Option<i64>, Option<i64>, i64)> =
        sqlx::query_as(&format!(
            "SELECT g.group_id, g.status, g.highest_global_seq, \
                    MIN(o.global_seq) FILTER (WHERE o.global_seq > 0), \
                    MAX(o.global_seq) FILTER (WHERE o.global_seq > 0), \
                    COUNT(o.stream_id) \
             FROM {prefix}consumer_groups g \
             LEFT JOIN {prefix}offsets o ON o.group_id = g.group_id \
             GROUP BY g.group_id, g.status, g.highest_global_seq \
             ORDER BY g.group_id"
        ))
        .fetch_all(executor)
        .await?;

    rows.into_iter()
        .map(
            |(group_id, status, highest_global_seq, oldest, newest, stream_count)| {
                Ok(GroupStats {
                    group_id,
                    status: parse_status(&status)?,
                    highest_global_seq,
                    oldest_processed: oldest,
                    newest_processed: newest,
                    stream_count,
                })
            },
        )
        .collect()
}

// =============================================================================
// Notification
// =============================================================================

/// Emit a signal; inside a transaction the delivery commits atomically with
/// the surrounding writes
pub async fn notify(
    executor: impl PgExecutor<'_>,
    channel: &str,
    signal: &Signal,
) -> Result<(), StoreError> {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(channel)
        .bind(signal.encode())
        .execute(executor)
        .await?;
    Ok(())
}
