//! Log store error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Duplicate `(stream_id, seq)`; retriable by reloading state and
    /// re-deciding against the updated stream head
    #[error("concurrent append on stream {stream_id} at seq {seq}")]
    ConcurrentAppend { stream_id: String, seq: i64 },

    /// The claim backing an in-flight turn was released underneath it;
    /// retriable, the message will be redelivered
    #[error("claim lost for group {group_id} on stream {stream_id}")]
    ClaimLost { group_id: String, stream_id: String },

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("migration {version} failed: {error}")]
    Migration { version: i32, error: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// Errors that resolve themselves through redelivery
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            StoreError::ConcurrentAppend { .. } | StoreError::ClaimLost { .. }
        )
    }

    /// Map a message-insert failure, converting unique violations on
    /// `(stream_id, seq)` into the typed conflict
    pub(crate) fn from_insert(err: sqlx::Error, stream_id: &str, seq: i64) -> Self {
        if let sqlx::Error::Database(ref db) = err
            && db.code().as_deref() == Some("23505")
        {
            return StoreError::ConcurrentAppend {
                stream_id: stream_id.to_string(),
                seq,
            };
        }
        StoreError::Database(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrent_append_display() {
        let err = StoreError::ConcurrentAppend {
            stream_id: "s1".into(),
            seq: 6,
        };
        assert_eq!(err.to_string(), "concurrent append on stream s1 at seq 6");
        assert!(err.is_retriable());
    }

    #[test]
    fn test_claim_lost_is_retriable() {
        let err = StoreError::ClaimLost {
            group_id: "g".into(),
            stream_id: "s1".into(),
        };
        assert!(err.is_retriable());
    }

    #[test]
    fn test_config_error_not_retriable() {
        assert!(!StoreError::Config("missing URL".into()).is_retriable());
    }
}
