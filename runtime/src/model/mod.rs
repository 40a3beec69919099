//! Log record types shared across the runtime
//!
//! A [`Message`] generalizes commands (intent) and events (fact); both live
//! in the same durable log. [`NewMessage`] is the producer-side builder: the
//! store assigns `global_seq` at insert and, when the seq is left unset, the
//! next per-stream seq as well.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::constants::RUNTIME_NAME;

/// A message persisted in the log
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    /// Process-wide monotone id assigned at insert
    pub global_seq: i64,
    pub id: Uuid,
    pub stream_id: String,
    /// Per-stream sequence; `UNIQUE(stream_id, seq)`
    pub seq: i64,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub message_type: String,
    pub payload: Value,
    pub metadata: Value,
    /// The message that directly caused this one
    pub causation_id: Option<Uuid>,
    /// Stable across a whole cause-and-effect chain
    pub correlation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A message not yet persisted
///
/// `stream_id` and `seq` may be left unset: the router defaults the stream to
/// the triggering message's stream, and an unset seq is assigned from the
/// current stream head at append time. An explicitly set seq is
/// conflict-checked against `UNIQUE(stream_id, seq)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub id: Uuid,
    pub stream_id: Option<String>,
    pub seq: Option<i64>,
    #[serde(rename = "type")]
    pub message_type: String,
    pub payload: Value,
    pub metadata: Value,
    pub causation_id: Option<Uuid>,
    pub correlation_id: Option<Uuid>,
}

impl NewMessage {
    pub fn new(message_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            stream_id: None,
            seq: None,
            message_type: message_type.into(),
            payload,
            metadata: Value::Object(serde_json::Map::new()),
            causation_id: None,
            correlation_id: None,
        }
    }

    /// Target a specific stream instead of the default
    pub fn on_stream(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }

    /// Pin the per-stream seq for optimistic concurrency
    pub fn at_seq(mut self, seq: i64) -> Self {
        self.seq = Some(seq);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn caused_by(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    pub fn correlated_to(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// Liveness record for one worker task
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub id: String,
    pub pid: i32,
    pub host: String,
    pub info: Value,
}

impl WorkerInfo {
    /// Identity record for a worker running in this process
    pub fn for_process(id: impl Into<String>) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Self {
            id: id.into(),
            pid: std::process::id() as i32,
            host,
            info: serde_json::json!({ "runtime": RUNTIME_NAME }),
        }
    }
}
