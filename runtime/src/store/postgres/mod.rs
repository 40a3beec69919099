//! Postgres log store
//!
//! Production backend. Claims are a `claimed` flag advanced with
//! conditional updates (exactly one winner per `(group, stream)`); appends
//! are serialized per stream by a row lock on the stream head with the
//! `UNIQUE(stream_id, seq)` index as the cross-process backstop; signals
//! ride `pg_notify` inside the same transaction as the writes they
//! announce.

mod migrations;
pub mod queries;
pub mod schema;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use uuid::Uuid;

use super::{
    Claim, ConsumerGroupState, Delivery, GroupStats, GroupStatus, Store, StoreError, StreamHead,
    TurnCommit, distinct_types,
};
use crate::core::config::{NotifierConfig, StoreConfig};
use crate::core::constants::SCHEDULED_PROMOTION_BATCH;
use crate::model::{Message, NewMessage, WorkerInfo};
use crate::notify::Signal;

/// Postgres-backed [`Store`]
pub struct PostgresStore {
    pool: PgPool,
    prefix: String,
    channel: String,
    batch_size: i64,
}

impl PostgresStore {
    /// Initialize the store: build the pool and run migrations
    pub async fn init(
        store: &StoreConfig,
        notifier: &NotifierConfig,
        batch_size: i64,
    ) -> Result<Self, StoreError> {
        if store.url.is_empty() {
            return Err(StoreError::Config("Postgres URL is required".into()));
        }

        let mut options: PgConnectOptions = store
            .url
            .parse()
            .map_err(|e| StoreError::Config(format!("invalid Postgres URL: {e}")))?;

        if store.statement_timeout_secs > 0 {
            options = options.options([(
                "statement_timeout",
                format!("{}s", store.statement_timeout_secs),
            )]);
        }

        let pool = PgPoolOptions::new()
            .max_connections(store.max_connections)
            .min_connections(store.min_connections)
            .acquire_timeout(Duration::from_secs(store.acquire_timeout_secs))
            .idle_timeout(Duration::from_secs(store.idle_timeout_secs))
            .max_lifetime(Duration::from_secs(store.max_lifetime_secs))
            .connect_with(options)
            .await?;

        migrations::run_migrations(&pool, &store.table_prefix).await?;

        tracing::debug!(
            max_connections = store.max_connections,
            min_connections = store.min_connections,
            table_prefix = %store.table_prefix,
            channel = %notifier.channel,
            "PostgresStore initialized"
        );

        Ok(Self {
            pool,
            prefix: store.table_prefix.clone(),
            channel: notifier.channel.clone(),
            batch_size,
        })
    }

    /// Shared pool, for wiring a [`crate::notify::PostgresNotifier`] to the
    /// same database
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close the connection pool gracefully
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::debug!("Postgres pool closed");
    }

    fn validate_batch(stream_id: &str, messages: &[NewMessage]) -> Result<(), StoreError> {
        if messages.is_empty() {
            return Err(StoreError::InvalidAppend("empty message batch".into()));
        }
        for m in messages {
            if let Some(target) = &m.stream_id
                && target != stream_id
            {
                return Err(StoreError::InvalidAppend(format!(
                    "message targets stream {target}, append is for {stream_id}"
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn append(
        &self,
        stream_id: &str,
        messages: Vec<NewMessage>,
    ) -> Result<Vec<Message>, StoreError> {
        Self::validate_batch(stream_id, &messages)?;

        let mut tx = self.pool.begin().await?;
        let mut head = queries::stream_head_for_update(&mut *tx, &self.prefix, stream_id).await?;

        let mut appended = Vec::with_capacity(messages.len());
        for m in messages {
            let seq = m.seq.unwrap_or(head + 1);
            if seq <= head {
                return Err(StoreError::ConcurrentAppend {
                    stream_id: stream_id.to_string(),
                    seq,
                });
            }
            head = seq;
            appended.push(queries::insert_message(&mut *tx, &self.prefix, stream_id, seq, m).await?);
        }

        queries::upsert_stream_head(&mut *tx, &self.prefix, stream_id, head).await?;
        queries::notify(
            &mut *tx,
            &self.channel,
            &Signal::MessagesAppended(distinct_types(&appended)),
        )
        .await?;
        tx.commit().await?;

        Ok(appended)
    }

    async fn current_seq(&self, stream_id: &str) -> Result<i64, StoreError> {
        queries::stream_head(&self.pool, &self.prefix, stream_id).await
    }

    async fn read_stream(
        &self,
        stream_id: &str,
        after: Option<i64>,
        upto: Option<i64>,
    ) -> Result<Vec<Message>, StoreError> {
        queries::read_stream(&self.pool, &self.prefix, stream_id, after, upto).await
    }

    async fn read_correlation_batch(
        &self,
        correlation_id: Uuid,
    ) -> Result<Vec<Message>, StoreError> {
        queries::read_correlation_batch(&self.pool, &self.prefix, correlation_id).await
    }

    async fn read_recent_streams(&self, limit: i64) -> Result<Vec<StreamHead>, StoreError> {
        queries::read_recent_streams(&self.pool, &self.prefix, limit).await
    }

    async fn reserve_next_for(
        &self,
        group_id: &str,
        handled_types: &[String],
        worker_id: &str,
    ) -> Result<Option<Delivery>, StoreError> {
        let Some(group) = queries::fetch_group(&self.pool, &self.prefix, group_id).await? else {
            return Ok(None);
        };
        if group.status != GroupStatus::Active {
            return Ok(None);
        }
        if let Some(retry_at) = group.retry_at
            && retry_at > Utc::now()
        {
            return Ok(None);
        }

        let candidates = queries::claim_candidates(
            &self.pool,
            &self.prefix,
            group_id,
            handled_types,
            self.batch_size,
        )
        .await?;

        for stream_id in candidates {
            let Some(offset_seq) =
                queries::try_claim(&self.pool, &self.prefix, group_id, &stream_id, worker_id)
                    .await?
            else {
                // Another worker won this stream; scan on
                continue;
            };

            match queries::next_unacked(
                &self.pool,
                &self.prefix,
                &stream_id,
                handled_types,
                offset_seq,
            )
            .await?
            {
                Some(message) => {
                    let replaying = message.global_seq <= group.highest_global_seq;
                    return Ok(Some(Delivery {
                        claim: Claim {
                            group_id: group_id.to_string(),
                            stream_id,
                            worker_id: worker_id.to_string(),
                        },
                        message,
                        replaying,
                    }));
                }
                None => {
                    // The candidate was acked between scan and claim
                    queries::release_claim(
                        &self.pool,
                        &self.prefix,
                        group_id,
                        &stream_id,
                        worker_id,
                    )
                    .await?;
                }
            }
        }

        Ok(None)
    }

    async fn commit_turn(
        &self,
        claim: &Claim,
        turn: TurnCommit,
    ) -> Result<Vec<Message>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let held = queries::lock_held_claim(
            &mut *tx,
            &self.prefix,
            &claim.group_id,
            &claim.stream_id,
            &claim.worker_id,
        )
        .await?;
        if !held {
            return Err(StoreError::ClaimLost {
                group_id: claim.group_id.clone(),
                stream_id: claim.stream_id.clone(),
            });
        }

        let mut committed: Vec<Message> = Vec::new();
        for batch in turn.appends {
            let mut head =
                queries::stream_head_for_update(&mut *tx, &self.prefix, &batch.stream_id).await?;
            for m in batch.messages {
                let seq = m.seq.unwrap_or(head + 1);
                if seq <= head {
                    return Err(StoreError::ConcurrentAppend {
                        stream_id: batch.stream_id.clone(),
                        seq,
                    });
                }
                head = seq;
                committed.push(
                    queries::insert_message(&mut *tx, &self.prefix, &batch.stream_id, seq, m)
                        .await?,
                );
            }
            queries::upsert_stream_head(&mut *tx, &self.prefix, &batch.stream_id, head).await?;
        }

        for item in turn.scheduled {
            queries::insert_scheduled(&mut *tx, &self.prefix, &item.message, item.available_at)
                .await?;
        }

        queries::advance_offset(
            &mut *tx,
            &self.prefix,
            &claim.group_id,
            &claim.stream_id,
            turn.ack,
        )
        .await?;
        queries::raise_group_watermark(&mut *tx, &self.prefix, &claim.group_id, turn.ack).await?;

        if !committed.is_empty() {
            queries::notify(
                &mut *tx,
                &self.channel,
                &Signal::MessagesAppended(distinct_types(&committed)),
            )
            .await?;
        }
        tx.commit().await?;

        Ok(committed)
    }

    async fn ack(&self, claim: &Claim, global_seq: i64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        queries::advance_offset(
            &mut *tx,
            &self.prefix,
            &claim.group_id,
            &claim.stream_id,
            global_seq,
        )
        .await?;
        queries::raise_group_watermark(&mut *tx, &self.prefix, &claim.group_id, global_seq).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn release(&self, claim: &Claim) -> Result<(), StoreError> {
        queries::release_claim(
            &self.pool,
            &self.prefix,
            &claim.group_id,
            &claim.stream_id,
            &claim.worker_id,
        )
        .await
    }

    async fn release_stale_claims(&self, ttl: Duration) -> Result<u64, StoreError> {
        let cutoff: DateTime<Utc> = Utc::now()
            - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());

        let mut tx = self.pool.begin().await?;
        let pruned = queries::prune_dead_workers(&mut *tx, &self.prefix, cutoff).await?;
        let released = queries::release_stale_claims(&mut *tx, &self.prefix, cutoff).await?;
        tx.commit().await?;

        if pruned > 0 {
            tracing::debug!(pruned, "pruned dead worker rows");
        }
        Ok(released)
    }

    async fn record_worker_heartbeats(&self, workers: &[WorkerInfo]) -> Result<u64, StoreError> {
        for worker in workers {
            queries::upsert_worker(&self.pool, &self.prefix, worker).await?;
        }
        Ok(workers.len() as u64)
    }

    async fn schedule_messages(
        &self,
        messages: Vec<NewMessage>,
        available_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for message in &messages {
            if message.stream_id.is_none() {
                return Err(StoreError::InvalidAppend(
                    "scheduled message needs a target stream".into(),
                ));
            }
            queries::insert_scheduled(&mut *tx, &self.prefix, message, available_at).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn promote_due_scheduled(&self) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let due = queries::due_scheduled(&mut *tx, &self.prefix, SCHEDULED_PROMOTION_BATCH).await?;

        let mut promoted: Vec<Message> = Vec::new();
        for (id, body) in due {
            let mut message: NewMessage = match serde_json::from_value(body) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "dropping undecodable scheduled message");
                    queries::delete_scheduled(&mut *tx, &self.prefix, id).await?;
                    continue;
                }
            };
            let Some(stream_id) = message.stream_id.clone() else {
                tracing::warn!(id = %id, "dropping scheduled message without a stream");
                queries::delete_scheduled(&mut *tx, &self.prefix, id).await?;
                continue;
            };

            // Seq is assigned at promotion time, not at schedule time
            message.seq = None;
            let head = queries::stream_head_for_update(&mut *tx, &self.prefix, &stream_id).await?;
            promoted.push(
                queries::insert_message(&mut *tx, &self.prefix, &stream_id, head + 1, message)
                    .await?,
            );
            queries::upsert_stream_head(&mut *tx, &self.prefix, &stream_id, head + 1).await?;
            queries::delete_scheduled(&mut *tx, &self.prefix, id).await?;
        }

        if !promoted.is_empty() {
            queries::notify(
                &mut *tx,
                &self.channel,
                &Signal::MessagesAppended(distinct_types(&promoted)),
            )
            .await?;
        }
        tx.commit().await?;

        Ok(promoted.len() as u64)
    }

    async fn register_group(&self, group_id: &str) -> Result<(), StoreError> {
        queries::register_group(&self.pool, &self.prefix, group_id).await
    }

    async fn stop_group(&self, group_id: &str, reason: &str) -> Result<(), StoreError> {
        let context = serde_json::json!({
            "reason": reason,
            "stopped_at": Utc::now(),
        });
        queries::stop_group(&self.pool, &self.prefix, group_id, &context).await
    }

    async fn start_group(&self, group_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        queries::start_group(&mut *tx, &self.prefix, group_id).await?;
        queries::notify(
            &mut *tx,
            &self.channel,
            &Signal::ReactorResumed(group_id.to_string()),
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn reset_group(&self, group_id: &str) -> Result<(), StoreError> {
        queries::reset_group(&self.pool, &self.prefix, group_id).await
    }

    async fn set_group_retry(
        &self,
        group_id: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        queries::set_group_retry(&self.pool, &self.prefix, group_id, retry_at).await
    }

    async fn group(&self, group_id: &str) -> Result<Option<ConsumerGroupState>, StoreError> {
        queries::fetch_group(&self.pool, &self.prefix, group_id).await
    }

    async fn group_stats(&self) -> Result<Vec<GroupStats>, StoreError> {
        queries::group_stats(&self.pool, &self.prefix).await
    }
}

#[cfg(test)]
mod tests {
    // Postgres store tests require a running PostgreSQL instance
    // and are typically run as integration tests
}
