//! In-memory log store
//!
//! Single-process backend for embedding without a database and for tests.
//! All tables live behind one mutex; every operation locks, mutates, and
//! publishes signals only after the lock is released, so the claim CAS and
//! the append conflict check are as exclusive as their Postgres
//! counterparts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::{
    Claim, ConsumerGroupState, Delivery, GroupStats, GroupStatus, Store, StoreError, StreamHead,
    TurnCommit, distinct_types,
};
use crate::core::constants::{DEFAULT_BATCH_SIZE, SCHEDULED_PROMOTION_BATCH};
use crate::model::{Message, NewMessage, WorkerInfo};
use crate::notify::{InProcessNotifier, Signal};

#[derive(Clone)]
struct StreamRow {
    seq: i64,
    updated_at: DateTime<Utc>,
}

#[derive(Clone)]
struct GroupRow {
    status: GroupStatus,
    highest_global_seq: i64,
    error_context: Option<serde_json::Value>,
    retry_at: Option<DateTime<Utc>>,
}

impl Default for GroupRow {
    fn default() -> Self {
        Self {
            status: GroupStatus::Active,
            highest_global_seq: 0,
            error_context: None,
            retry_at: None,
        }
    }
}

#[derive(Clone, Default)]
struct OffsetRow {
    global_seq: i64,
    claimed: bool,
    claimed_at: Option<DateTime<Utc>>,
    claimed_by: Option<String>,
}

struct ScheduledRow {
    id: Uuid,
    available_at: DateTime<Utc>,
    message: NewMessage,
}

struct WorkerRow {
    last_seen: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, StreamRow>,
    /// Ascending by global_seq
    messages: Vec<Message>,
    groups: HashMap<String, GroupRow>,
    offsets: HashMap<(String, String), OffsetRow>,
    scheduled: Vec<ScheduledRow>,
    workers: HashMap<String, WorkerRow>,
    next_global_seq: i64,
}

/// In-memory [`Store`] implementation
pub struct MemoryStore {
    inner: Mutex<Inner>,
    notifier: Arc<InProcessNotifier>,
    batch_size: i64,
}

impl MemoryStore {
    pub fn new(notifier: Arc<InProcessNotifier>) -> Self {
        Self::with_batch_size(notifier, DEFAULT_BATCH_SIZE)
    }

    pub fn with_batch_size(notifier: Arc<InProcessNotifier>, batch_size: i64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_global_seq: 1,
                ..Inner::default()
            }),
            notifier,
            batch_size,
        }
    }
}

/// Assign seqs and global seqs for one batch against a running head.
/// Pure with respect to the store; conflicts surface before anything is
/// applied.
fn stage_batch(
    next_global_seq: &mut i64,
    mut head: i64,
    stream_id: &str,
    messages: Vec<NewMessage>,
    now: DateTime<Utc>,
) -> Result<(Vec<Message>, i64), StoreError> {
    let mut staged = Vec::with_capacity(messages.len());
    for m in messages {
        let seq = m.seq.unwrap_or(head + 1);
        if seq <= head {
            return Err(StoreError::ConcurrentAppend {
                stream_id: stream_id.to_string(),
                seq,
            });
        }
        head = seq;
        let global_seq = *next_global_seq;
        *next_global_seq += 1;
        staged.push(Message {
            global_seq,
            id: m.id,
            stream_id: stream_id.to_string(),
            seq,
            message_type: m.message_type,
            payload: m.payload,
            metadata: m.metadata,
            causation_id: m.causation_id,
            // Roots are self-correlated so reaction chains share one set
            correlation_id: m.correlation_id.or(Some(m.id)),
            created_at: now,
        });
    }
    Ok((staged, head))
}

#[async_trait]
impl Store for MemoryStore {
    async fn append(
        &self,
        stream_id: &str,
        messages: Vec<NewMessage>,
    ) -> Result<Vec<Message>, StoreError> {
        if messages.is_empty() {
            return Err(StoreError::InvalidAppend("empty message batch".into()));
        }
        for m in &messages {
            if let Some(target) = &m.stream_id
                && target != stream_id
            {
                return Err(StoreError::InvalidAppend(format!(
                    "message targets stream {target}, append is for {stream_id}"
                )));
            }
        }

        let now = Utc::now();
        let (staged, types) = {
            let mut inner = self.inner.lock();
            let head = inner.streams.get(stream_id).map(|s| s.seq).unwrap_or(0);
            let mut next_global_seq = inner.next_global_seq;
            let (staged, new_head) =
                stage_batch(&mut next_global_seq, head, stream_id, messages, now)?;
            inner.next_global_seq = next_global_seq;
            inner.messages.extend(staged.iter().cloned());
            inner.streams.insert(
                stream_id.to_string(),
                StreamRow {
                    seq: new_head,
                    updated_at: now,
                },
            );
            let types = distinct_types(&staged);
            (staged, types)
        };

        self.notifier.publish_now(Signal::MessagesAppended(types));
        Ok(staged)
    }

    async fn current_seq(&self, stream_id: &str) -> Result<i64, StoreError> {
        let inner = self.inner.lock();
        Ok(inner.streams.get(stream_id).map(|s| s.seq).unwrap_or(0))
    }

    async fn read_stream(
        &self,
        stream_id: &str,
        after: Option<i64>,
        upto: Option<i64>,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.lock();
        let mut messages: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| m.stream_id == stream_id)
            .filter(|m| after.is_none_or(|a| m.seq > a))
            .filter(|m| upto.is_none_or(|u| m.seq <= u))
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.seq);
        Ok(messages)
    }

    async fn read_correlation_batch(
        &self,
        correlation_id: Uuid,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .messages
            .iter()
            .filter(|m| m.correlation_id == Some(correlation_id))
            .cloned()
            .collect())
    }

    async fn read_recent_streams(&self, limit: i64) -> Result<Vec<StreamHead>, StoreError> {
        let inner = self.inner.lock();
        let mut heads: Vec<StreamHead> = inner
            .streams
            .iter()
            .map(|(stream_id, row)| StreamHead {
                stream_id: stream_id.clone(),
                seq: row.seq,
                updated_at: row.updated_at,
            })
            .collect();
        heads.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        heads.truncate(limit.max(0) as usize);
        Ok(heads)
    }

    async fn reserve_next_for(
        &self,
        group_id: &str,
        handled_types: &[String],
        worker_id: &str,
    ) -> Result<Option<Delivery>, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        let Some(group) = inner.groups.get(group_id) else {
            return Ok(None);
        };
        if group.status != GroupStatus::Active {
            return Ok(None);
        }
        if let Some(retry_at) = group.retry_at
            && retry_at > now
        {
            return Ok(None);
        }
        let highest_global_seq = group.highest_global_seq;

        let mut skipped: HashSet<String> = HashSet::new();
        let mut examined = 0i64;
        let mut found: Option<Message> = None;
        for m in &inner.messages {
            if !handled_types.iter().any(|t| t == &m.message_type) {
                continue;
            }
            examined += 1;
            if examined > self.batch_size {
                break;
            }
            if skipped.contains(&m.stream_id) {
                continue;
            }
            if let Some(offset) = inner
                .offsets
                .get(&(group_id.to_string(), m.stream_id.clone()))
            {
                if offset.claimed {
                    skipped.insert(m.stream_id.clone());
                    continue;
                }
                if m.global_seq <= offset.global_seq {
                    continue;
                }
            }
            found = Some(m.clone());
            break;
        }

        let Some(message) = found else {
            return Ok(None);
        };

        let key = (group_id.to_string(), message.stream_id.clone());
        let offset = inner.offsets.entry(key).or_default();
        offset.claimed = true;
        offset.claimed_at = Some(now);
        offset.claimed_by = Some(worker_id.to_string());

        let replaying = message.global_seq <= highest_global_seq;
        Ok(Some(Delivery {
            claim: Claim {
                group_id: group_id.to_string(),
                stream_id: message.stream_id.clone(),
                worker_id: worker_id.to_string(),
            },
            message,
            replaying,
        }))
    }

    async fn commit_turn(
        &self,
        claim: &Claim,
        turn: TurnCommit,
    ) -> Result<Vec<Message>, StoreError> {
        let now = Utc::now();
        let (committed, types) = {
            let mut inner = self.inner.lock();

            let key = (claim.group_id.clone(), claim.stream_id.clone());
            let held = inner
                .offsets
                .get(&key)
                .map(|o| o.claimed && o.claimed_by.as_deref() == Some(claim.worker_id.as_str()))
                .unwrap_or(false);
            if !held {
                return Err(StoreError::ClaimLost {
                    group_id: claim.group_id.clone(),
                    stream_id: claim.stream_id.clone(),
                });
            }

            // Validate every batch before mutating anything
            let mut staged: Vec<Message> = Vec::new();
            let mut heads: HashMap<String, i64> = HashMap::new();
            let mut next_global_seq = inner.next_global_seq;
            for batch in turn.appends {
                let head = *heads.entry(batch.stream_id.clone()).or_insert_with(|| {
                    inner
                        .streams
                        .get(&batch.stream_id)
                        .map(|s| s.seq)
                        .unwrap_or(0)
                });
                let (batch_staged, new_head) = stage_batch(
                    &mut next_global_seq,
                    head,
                    &batch.stream_id,
                    batch.messages,
                    now,
                )?;
                staged.extend(batch_staged);
                heads.insert(batch.stream_id, new_head);
            }

            inner.next_global_seq = next_global_seq;
            inner.messages.extend(staged.iter().cloned());
            for (stream_id, head) in heads {
                let row = inner.streams.entry(stream_id).or_insert(StreamRow {
                    seq: 0,
                    updated_at: now,
                });
                row.seq = head;
                row.updated_at = now;
            }
            for item in turn.scheduled {
                let id = item.message.id;
                inner.scheduled.push(ScheduledRow {
                    id,
                    available_at: item.available_at,
                    message: item.message,
                });
            }

            if let Some(offset) = inner.offsets.get_mut(&key) {
                offset.global_seq = offset.global_seq.max(turn.ack);
                offset.claimed = false;
                offset.claimed_at = None;
                offset.claimed_by = None;
            }
            if let Some(group) = inner.groups.get_mut(&claim.group_id) {
                group.highest_global_seq = group.highest_global_seq.max(turn.ack);
            }

            let types = distinct_types(&staged);
            (staged, types)
        };

        if !types.is_empty() {
            self.notifier.publish_now(Signal::MessagesAppended(types));
        }
        Ok(committed)
    }

    async fn ack(&self, claim: &Claim, global_seq: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let key = (claim.group_id.clone(), claim.stream_id.clone());
        let offset = inner.offsets.entry(key).or_default();
        offset.global_seq = offset.global_seq.max(global_seq);
        offset.claimed = false;
        offset.claimed_at = None;
        offset.claimed_by = None;
        if let Some(group) = inner.groups.get_mut(&claim.group_id) {
            group.highest_global_seq = group.highest_global_seq.max(global_seq);
        }
        Ok(())
    }

    async fn release(&self, claim: &Claim) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let key = (claim.group_id.clone(), claim.stream_id.clone());
        if let Some(offset) = inner.offsets.get_mut(&key)
            && offset.claimed_by.as_deref() == Some(claim.worker_id.as_str())
        {
            offset.claimed = false;
            offset.claimed_at = None;
            offset.claimed_by = None;
        }
        Ok(())
    }

    async fn release_stale_claims(&self, ttl: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());

        let mut inner = self.inner.lock();
        inner.workers.retain(|_, w| w.last_seen >= cutoff);
        let live: HashSet<String> = inner.workers.keys().cloned().collect();

        let mut released = 0u64;
        for offset in inner.offsets.values_mut() {
            if !offset.claimed {
                continue;
            }
            let expired = offset.claimed_at.map(|at| at < cutoff).unwrap_or(true);
            let orphaned = offset
                .claimed_by
                .as_ref()
                .map(|w| !live.contains(w))
                .unwrap_or(true);
            if expired || orphaned {
                offset.claimed = false;
                offset.claimed_at = None;
                offset.claimed_by = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn record_worker_heartbeats(&self, workers: &[WorkerInfo]) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        for worker in workers {
            inner
                .workers
                .insert(worker.id.clone(), WorkerRow { last_seen: now });
        }
        Ok(workers.len() as u64)
    }

    async fn schedule_messages(
        &self,
        messages: Vec<NewMessage>,
        available_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        for message in messages {
            if message.stream_id.is_none() {
                return Err(StoreError::InvalidAppend(
                    "scheduled message needs a target stream".into(),
                ));
            }
            let id = message.id;
            inner.scheduled.push(ScheduledRow {
                id,
                available_at,
                message,
            });
        }
        Ok(())
    }

    async fn promote_due_scheduled(&self) -> Result<u64, StoreError> {
        let now = Utc::now();
        let (promoted, types) = {
            let mut inner = self.inner.lock();

            let mut due = Vec::new();
            let mut remaining = Vec::new();
            for row in inner.scheduled.drain(..) {
                if row.available_at <= now && (due.len() as i64) < SCHEDULED_PROMOTION_BATCH {
                    due.push(row);
                } else {
                    remaining.push(row);
                }
            }
            inner.scheduled = remaining;

            let mut promoted: Vec<Message> = Vec::new();
            for row in due {
                let Some(stream_id) = row.message.stream_id.clone() else {
                    tracing::warn!(id = %row.id, "dropping scheduled message without a stream");
                    continue;
                };
                let head = inner.streams.get(&stream_id).map(|s| s.seq).unwrap_or(0);
                let mut next_global_seq = inner.next_global_seq;
                // Seq is assigned at promotion time, not at schedule time
                let mut message = row.message;
                message.seq = None;
                let (staged, new_head) =
                    stage_batch(&mut next_global_seq, head, &stream_id, vec![message], now)?;
                inner.next_global_seq = next_global_seq;
                inner.messages.extend(staged.iter().cloned());
                inner.streams.insert(
                    stream_id,
                    StreamRow {
                        seq: new_head,
                        updated_at: now,
                    },
                );
                promoted.extend(staged);
            }

            let types = distinct_types(&promoted);
            (promoted.len() as u64, types)
        };

        if !types.is_empty() {
            self.notifier.publish_now(Signal::MessagesAppended(types));
        }
        Ok(promoted)
    }

    async fn register_group(&self, group_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.groups.entry(group_id.to_string()).or_default();
        Ok(())
    }

    async fn stop_group(&self, group_id: &str, reason: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let group = inner.groups.entry(group_id.to_string()).or_default();
        group.status = GroupStatus::Stopped;
        group.error_context = Some(serde_json::json!({
            "reason": reason,
            "stopped_at": Utc::now(),
        }));
        Ok(())
    }

    async fn start_group(&self, group_id: &str) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock();
            let group = inner.groups.entry(group_id.to_string()).or_default();
            group.status = GroupStatus::Active;
            group.error_context = None;
            group.retry_at = None;
        }
        self.notifier
            .publish_now(Signal::ReactorResumed(group_id.to_string()));
        Ok(())
    }

    async fn reset_group(&self, group_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.offsets.retain(|(group, _), _| group != group_id);
        Ok(())
    }

    async fn set_group_retry(
        &self,
        group_id: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let group = inner.groups.entry(group_id.to_string()).or_default();
        group.retry_at = Some(retry_at);
        Ok(())
    }

    async fn group(&self, group_id: &str) -> Result<Option<ConsumerGroupState>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner.groups.get(group_id).map(|g| ConsumerGroupState {
            group_id: group_id.to_string(),
            status: g.status,
            highest_global_seq: g.highest_global_seq,
            error_context: g.error_context.clone(),
            retry_at: g.retry_at,
        }))
    }

    async fn group_stats(&self) -> Result<Vec<GroupStats>, StoreError> {
        let inner = self.inner.lock();
        let mut stats: Vec<GroupStats> = inner
            .groups
            .iter()
            .map(|(group_id, group)| {
                let processed: Vec<i64> = inner
                    .offsets
                    .iter()
                    .filter(|((g, _), _)| g == group_id)
                    .map(|(_, o)| o.global_seq)
                    .collect();
                GroupStats {
                    group_id: group_id.clone(),
                    status: group.status,
                    highest_global_seq: group.highest_global_seq,
                    oldest_processed: processed.iter().filter(|&&s| s > 0).min().copied(),
                    newest_processed: processed.iter().filter(|&&s| s > 0).max().copied(),
                    stream_count: processed.len() as i64,
                }
            })
            .collect();
        stats.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> MemoryStore {
        MemoryStore::new(Arc::new(InProcessNotifier::new()))
    }

    fn event(message_type: &str) -> NewMessage {
        NewMessage::new(message_type, json!({}))
    }

    fn types(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_append_assigns_seqs_and_self_correlates() {
        let store = store();
        let appended = store
            .append("s1", vec![event("A"), event("B")])
            .await
            .unwrap();

        assert_eq!(appended.len(), 2);
        assert_eq!(appended[0].seq, 1);
        assert_eq!(appended[1].seq, 2);
        assert_eq!(appended[0].global_seq, 1);
        assert_eq!(appended[1].global_seq, 2);
        assert_eq!(appended[0].correlation_id, Some(appended[0].id));
        assert_eq!(store.current_seq("s1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_append_explicit_seq_conflict() {
        let store = store();
        store.append("s1", vec![event("A")]).await.unwrap();

        let err = store
            .append("s1", vec![event("A").at_seq(1)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::ConcurrentAppend { seq: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_append_rejects_foreign_stream_target() {
        let store = store();
        let err = store
            .append("s1", vec![event("A").on_stream("s2")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidAppend(_)));
    }

    #[tokio::test]
    async fn test_reserve_requires_registered_active_group() {
        let store = store();
        store.append("s1", vec![event("A")]).await.unwrap();

        // Unregistered group sees nothing
        let reserved = store
            .reserve_next_for("g", &types(&["A"]), "w1")
            .await
            .unwrap();
        assert!(reserved.is_none());

        store.register_group("g").await.unwrap();
        let reserved = store
            .reserve_next_for("g", &types(&["A"]), "w1")
            .await
            .unwrap();
        assert!(reserved.is_some());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_per_stream() {
        let store = store();
        store.register_group("g").await.unwrap();
        store
            .append("s1", vec![event("A"), event("A")])
            .await
            .unwrap();

        let first = store
            .reserve_next_for("g", &types(&["A"]), "w1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.message.seq, 1);

        // Same stream is claimed; the second worker finds nothing
        let second = store
            .reserve_next_for("g", &types(&["A"]), "w2")
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_reserve_skips_claimed_stream_and_delivers_other() {
        let store = store();
        store.register_group("g").await.unwrap();
        store.append("s1", vec![event("A")]).await.unwrap();
        store.append("s2", vec![event("A")]).await.unwrap();

        let first = store
            .reserve_next_for("g", &types(&["A"]), "w1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.message.stream_id, "s1");

        let second = store
            .reserve_next_for("g", &types(&["A"]), "w2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.message.stream_id, "s2");
    }

    #[tokio::test]
    async fn test_ack_advances_offset_and_watermark() {
        let store = store();
        store.register_group("g").await.unwrap();
        store
            .append("s1", vec![event("A"), event("A")])
            .await
            .unwrap();

        let delivery = store
            .reserve_next_for("g", &types(&["A"]), "w1")
            .await
            .unwrap()
            .unwrap();
        store
            .ack(&delivery.claim, delivery.message.global_seq)
            .await
            .unwrap();

        let group = store.group("g").await.unwrap().unwrap();
        assert_eq!(group.highest_global_seq, 1);

        let next = store
            .reserve_next_for("g", &types(&["A"]), "w1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.message.seq, 2);
        assert!(!next.replaying);
    }

    #[tokio::test]
    async fn test_ack_idempotent_without_claim() {
        let store = store();
        store.register_group("g").await.unwrap();
        let claim = Claim {
            group_id: "g".into(),
            stream_id: "s1".into(),
            worker_id: "w1".into(),
        };
        store.ack(&claim, 7).await.unwrap();
        store.ack(&claim, 7).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_redelivers_same_message() {
        let store = store();
        store.register_group("g").await.unwrap();
        store.append("s1", vec![event("A")]).await.unwrap();

        let first = store
            .reserve_next_for("g", &types(&["A"]), "w1")
            .await
            .unwrap()
            .unwrap();
        store.release(&first.claim).await.unwrap();

        let again = store
            .reserve_next_for("g", &types(&["A"]), "w2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.message.id, first.message.id);
    }

    #[tokio::test]
    async fn test_stale_claim_reaped_when_worker_is_gone() {
        let store = store();
        store.register_group("g").await.unwrap();
        store.append("s1", vec![event("A")]).await.unwrap();

        let abandoned = store
            .reserve_next_for("g", &types(&["A"]), "w-dead")
            .await
            .unwrap()
            .unwrap();

        // w-dead never heartbeated, so its claim is orphaned regardless of age
        let released = store
            .release_stale_claims(Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(released, 1);

        let recovered = store
            .reserve_next_for("g", &types(&["A"]), "w-live")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recovered.message.id, abandoned.message.id);
    }

    #[tokio::test]
    async fn test_heartbeat_protects_fresh_claim() {
        let store = store();
        store.register_group("g").await.unwrap();
        store.append("s1", vec![event("A")]).await.unwrap();

        store
            .record_worker_heartbeats(&[WorkerInfo::for_process("w1")])
            .await
            .unwrap();
        store
            .reserve_next_for("g", &types(&["A"]), "w1")
            .await
            .unwrap()
            .unwrap();

        let released = store
            .release_stale_claims(Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(released, 0);
    }

    #[tokio::test]
    async fn test_commit_turn_appends_acks_and_clears_claim() {
        let store = store();
        store.register_group("g").await.unwrap();
        store.append("cart", vec![event("AddItem")]).await.unwrap();

        let delivery = store
            .reserve_next_for("g", &types(&["AddItem"]), "w1")
            .await
            .unwrap()
            .unwrap();

        let committed = store
            .commit_turn(
                &delivery.claim,
                TurnCommit {
                    appends: vec![super::super::StreamAppend {
                        stream_id: "cart".into(),
                        messages: vec![event("ItemAdded").at_seq(2)],
                    }],
                    scheduled: vec![],
                    ack: delivery.message.global_seq,
                },
            )
            .await
            .unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].seq, 2);

        let group = store.group("g").await.unwrap().unwrap();
        assert_eq!(group.highest_global_seq, delivery.message.global_seq);

        // The claim is gone; the produced event is not handled, so the
        // stream is idle for this group
        let next = store
            .reserve_next_for("g", &types(&["AddItem"]), "w1")
            .await
            .unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_commit_turn_without_claim_is_claim_lost() {
        let store = store();
        store.register_group("g").await.unwrap();
        let claim = Claim {
            group_id: "g".into(),
            stream_id: "s1".into(),
            worker_id: "w1".into(),
        };
        let err = store
            .commit_turn(&claim, TurnCommit::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ClaimLost { .. }));
    }

    #[tokio::test]
    async fn test_reset_keeps_watermark_and_flags_replay() {
        let store = store();
        store.register_group("g").await.unwrap();
        store.append("s1", vec![event("A")]).await.unwrap();

        let delivery = store
            .reserve_next_for("g", &types(&["A"]), "w1")
            .await
            .unwrap()
            .unwrap();
        store
            .ack(&delivery.claim, delivery.message.global_seq)
            .await
            .unwrap();

        store.reset_group("g").await.unwrap();

        let replay = store
            .reserve_next_for("g", &types(&["A"]), "w1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replay.message.id, delivery.message.id);
        assert!(replay.replaying);
    }

    #[tokio::test]
    async fn test_stopped_group_reserves_nothing() {
        let store = store();
        store.register_group("g").await.unwrap();
        store.append("s1", vec![event("A")]).await.unwrap();
        store.stop_group("g", "boom").await.unwrap();

        let reserved = store
            .reserve_next_for("g", &types(&["A"]), "w1")
            .await
            .unwrap();
        assert!(reserved.is_none());

        let group = store.group("g").await.unwrap().unwrap();
        assert_eq!(group.status, GroupStatus::Stopped);
        assert_eq!(group.error_context.unwrap()["reason"], "boom");

        store.start_group("g").await.unwrap();
        assert!(
            store
                .reserve_next_for("g", &types(&["A"]), "w1")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_retry_at_defers_dispatch() {
        let store = store();
        store.register_group("g").await.unwrap();
        store.append("s1", vec![event("A")]).await.unwrap();

        store
            .set_group_retry("g", Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(
            store
                .reserve_next_for("g", &types(&["A"]), "w1")
                .await
                .unwrap()
                .is_none()
        );

        store
            .set_group_retry("g", Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert!(
            store
                .reserve_next_for("g", &types(&["A"]), "w1")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_promote_due_scheduled_messages() {
        let store = store();
        store
            .schedule_messages(
                vec![event("Ping").on_stream("s1")],
                Utc::now() - chrono::Duration::seconds(1),
            )
            .await
            .unwrap();
        store
            .schedule_messages(
                vec![event("Ping").on_stream("s1")],
                Utc::now() + chrono::Duration::hours(1),
            )
            .await
            .unwrap();

        assert_eq!(store.promote_due_scheduled().await.unwrap(), 1);
        assert_eq!(store.promote_due_scheduled().await.unwrap(), 0);

        let stream = store.read_stream("s1", None, None).await.unwrap();
        assert_eq!(stream.len(), 1);
        assert_eq!(stream[0].message_type, "Ping");
        assert_eq!(stream[0].seq, 1);
    }

    #[tokio::test]
    async fn test_group_stats() {
        let store = store();
        store.register_group("g").await.unwrap();
        store.append("s1", vec![event("A")]).await.unwrap();
        store.append("s2", vec![event("A")]).await.unwrap();

        for _ in 0..2 {
            let delivery = store
                .reserve_next_for("g", &types(&["A"]), "w1")
                .await
                .unwrap()
                .unwrap();
            store
                .ack(&delivery.claim, delivery.message.global_seq)
                .await
                .unwrap();
        }

        let stats = store.group_stats().await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].group_id, "g");
        assert_eq!(stats[0].stream_count, 2);
        assert_eq!(stats[0].oldest_processed, Some(1));
        assert_eq!(stats[0].newest_processed, Some(2));
    }

    #[tokio::test]
    async fn test_read_correlation_batch() {
        let store = store();
        let root = store.append("s1", vec![event("A")]).await.unwrap();
        let correlation = root[0].correlation_id.unwrap();
        store
            .append(
                "s1",
                vec![event("B").correlated_to(correlation)],
            )
            .await
            .unwrap();
        store.append("s2", vec![event("C")]).await.unwrap();

        let batch = store.read_correlation_batch(correlation).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|m| m.correlation_id == Some(correlation)));
    }

    #[tokio::test]
    async fn test_read_recent_streams() {
        let store = store();
        store.append("s1", vec![event("A")]).await.unwrap();
        store.append("s2", vec![event("A")]).await.unwrap();

        let heads = store.read_recent_streams(10).await.unwrap();
        assert_eq!(heads.len(), 2);
        assert_eq!(store.read_recent_streams(1).await.unwrap().len(), 1);
    }
}
