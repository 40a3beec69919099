//! Durable message log with consumer-group claims
//!
//! The [`Store`] trait is the seam between the dispatch engine and
//! persistence. Two backends implement it:
//! - [`MemoryStore`]: in-process, for embedding without a database and for
//!   tests
//! - [`postgres::PostgresStore`]: the production backend; claims are a
//!   `claimed` flag advanced with conditional updates, appends are guarded
//!   by `UNIQUE(stream_id, seq)`
//!
//! The claim protocol partitions work by `(group_id, stream_id)`: a reserved
//! stream is exclusively leased to one worker until acked or released, which
//! is what gives per-stream in-order delivery under a concurrent worker
//! pool.

pub mod error;
pub mod memory;
pub mod postgres;

pub use error::StoreError;
pub use memory::MemoryStore;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::model::{Message, NewMessage, WorkerInfo};

/// Distinct message types of a batch, insertion-ordered, for the
/// `MessagesAppended` signal
pub(crate) fn distinct_types(messages: &[Message]) -> Vec<String> {
    let mut types: Vec<String> = Vec::new();
    for m in messages {
        if !types.iter().any(|t| t == &m.message_type) {
            types.push(m.message_type.clone());
        }
    }
    types
}

/// Exclusive lease of `(group_id, stream_id)` for the duration of a turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub group_id: String,
    pub stream_id: String,
    pub worker_id: String,
}

/// A reserved message together with its claim
#[derive(Debug)]
pub struct Delivery {
    pub claim: Claim,
    pub message: Message,
    /// The group has seen this position before (`global_seq ≤ high-water
    /// mark`); reactors use it to suppress side effects when rebuilding
    pub replaying: bool,
}

/// Everything a turn commits atomically: produced messages, scheduled
/// messages, and the ack of the triggering message
#[derive(Debug, Default)]
pub struct TurnCommit {
    pub appends: Vec<StreamAppend>,
    pub scheduled: Vec<ScheduledAppend>,
    /// Global seq of the triggering message; the group offset for the
    /// claimed stream advances here
    pub ack: i64,
}

/// Messages bound for one stream, seqs pre-assigned by the router
#[derive(Debug)]
pub struct StreamAppend {
    pub stream_id: String,
    pub messages: Vec<NewMessage>,
}

/// A message to park until `available_at`
#[derive(Debug)]
pub struct ScheduledAppend {
    pub message: NewMessage,
    pub available_at: DateTime<Utc>,
}

/// Consumer group status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    Active,
    Stopped,
}

impl GroupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::Active => "active",
            GroupStatus::Stopped => "stopped",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(GroupStatus::Active),
            "stopped" => Some(GroupStatus::Stopped),
            _ => None,
        }
    }
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-reactor bookkeeping row
#[derive(Debug, Clone)]
pub struct ConsumerGroupState {
    pub group_id: String,
    pub status: GroupStatus,
    /// Replay watermark; never decreases
    pub highest_global_seq: i64,
    pub error_context: Option<Value>,
    pub retry_at: Option<DateTime<Utc>>,
}

/// Operator-facing per-group statistics
#[derive(Debug, Clone, Serialize)]
pub struct GroupStats {
    pub group_id: String,
    pub status: GroupStatus,
    pub highest_global_seq: i64,
    pub oldest_processed: Option<i64>,
    pub newest_processed: Option<i64>,
    pub stream_count: i64,
}

/// Stream head row for recent-stream queries
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StreamHead {
    pub stream_id: String,
    pub seq: i64,
    pub updated_at: DateTime<Utc>,
}

/// Durable append-only message log with per-group claim bookkeeping
#[async_trait]
pub trait Store: Send + Sync {
    /// Append messages to one stream transactionally
    ///
    /// Unset seqs are assigned from the current stream head; explicit seqs
    /// that collide return [`StoreError::ConcurrentAppend`]. A message with
    /// no correlation id is self-correlated so reaction chains share one
    /// correlation set. Fires `MessagesAppended` with the distinct types.
    async fn append(
        &self,
        stream_id: &str,
        messages: Vec<NewMessage>,
    ) -> Result<Vec<Message>, StoreError>;

    /// Current head seq of a stream; 0 when the stream does not exist
    async fn current_seq(&self, stream_id: &str) -> Result<i64, StoreError>;

    /// Read a stream ordered by seq, optionally bounded to `(after, upto]`
    async fn read_stream(
        &self,
        stream_id: &str,
        after: Option<i64>,
        upto: Option<i64>,
    ) -> Result<Vec<Message>, StoreError>;

    /// All messages sharing a correlation, ordered by global seq
    async fn read_correlation_batch(
        &self,
        correlation_id: Uuid,
    ) -> Result<Vec<Message>, StoreError>;

    /// Most recently updated stream heads
    async fn read_recent_streams(&self, limit: i64) -> Result<Vec<StreamHead>, StoreError>;

    /// Atomically find the next deliverable message for a group and claim
    /// its stream
    ///
    /// The candidate is the smallest `global_seq` whose type is handled,
    /// whose stream has no outstanding claim for this group, and which the
    /// group has not acked. When two workers race for one stream exactly
    /// one wins; the loser scans on. Returns `None` when nothing is
    /// deliverable within the scan bound.
    async fn reserve_next_for(
        &self,
        group_id: &str,
        handled_types: &[String],
        worker_id: &str,
    ) -> Result<Option<Delivery>, StoreError>;

    /// Execute a turn's effects and ack its trigger in one transaction
    ///
    /// Fails with [`StoreError::ConcurrentAppend`] on a seq collision and
    /// [`StoreError::ClaimLost`] when the claim is no longer held; either
    /// way nothing is committed and the caller releases.
    async fn commit_turn(
        &self,
        claim: &Claim,
        turn: TurnCommit,
    ) -> Result<Vec<Message>, StoreError>;

    /// Advance the group offset for the claimed stream and clear the claim.
    /// Idempotent against a missing claim row.
    async fn ack(&self, claim: &Claim, global_seq: i64) -> Result<(), StoreError>;

    /// Clear the claim without advancing the offset, so the same message is
    /// redelivered. Idempotent against a missing claim row.
    async fn release(&self, claim: &Claim) -> Result<(), StoreError>;

    /// Release claims whose `claimed_at` exceeded the TTL or whose holder is
    /// gone from the live workers table; returns the count released
    async fn release_stale_claims(&self, ttl: Duration) -> Result<u64, StoreError>;

    /// Upsert `last_seen = now` for each worker; returns the count touched
    async fn record_worker_heartbeats(&self, workers: &[WorkerInfo]) -> Result<u64, StoreError>;

    /// Park messages until `available_at`
    async fn schedule_messages(
        &self,
        messages: Vec<NewMessage>,
        available_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Move due scheduled messages into the log transactionally; returns the
    /// count promoted
    async fn promote_due_scheduled(&self) -> Result<u64, StoreError>;

    /// Ensure a consumer group row exists (idempotent)
    async fn register_group(&self, group_id: &str) -> Result<(), StoreError>;

    /// Stop dispatching to a group, recording why
    async fn stop_group(&self, group_id: &str, reason: &str) -> Result<(), StoreError>;

    /// Resume a stopped group and fire `ReactorResumed`
    async fn start_group(&self, group_id: &str) -> Result<(), StoreError>;

    /// Delete all offsets for a group; the high-water mark is kept so the
    /// subsequent re-delivery is flagged as replaying
    async fn reset_group(&self, group_id: &str) -> Result<(), StoreError>;

    /// Defer dispatch to a group until `retry_at`
    async fn set_group_retry(&self, group_id: &str, retry_at: DateTime<Utc>)
    -> Result<(), StoreError>;

    /// Fetch one group's bookkeeping row
    async fn group(&self, group_id: &str) -> Result<Option<ConsumerGroupState>, StoreError>;

    /// Operator stats: oldest/newest processed global seq and stream count
    /// per group
    async fn group_stats(&self) -> Result<Vec<GroupStats>, StoreError>;
}
