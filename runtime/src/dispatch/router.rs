//! Router: the single-turn contract
//!
//! One call = one turn: reserve the next message for a reactor (claiming
//! its stream), load history, invoke the handler, execute the returned
//! actions inside the store transaction, and ack — or release and route the
//! failure through the reactor's error strategy.
//!
//! Produced messages are auto-addressed: the stream defaults to the
//! trigger's stream, the seq continues from the observed head (optimistic —
//! a concurrent writer surfaces as a commit conflict and the turn is
//! redelivered), the correlation id is stable across the whole chain, and
//! causation points at the trigger (`AppendNext`) or the last produced
//! message (`AppendAfter`).

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::model::{Message, NewMessage};
use crate::reactor::{Action, ErrorDirective, HandlerError, Reactor, Turn};
use crate::store::{Claim, Delivery, ScheduledAppend, Store, StoreError, StreamAppend, TurnCommit};

pub struct Router {
    store: Arc<dyn Store>,
}

impl Router {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Reserve, handle, and commit one turn for a reactor
    ///
    /// Returns `Ok(true)` when a turn was consumed (including failed turns
    /// routed through the error strategy), `Ok(false)` when nothing was
    /// deliverable.
    pub async fn handle_next_for(
        &self,
        reactor: &dyn Reactor,
        worker_id: &str,
    ) -> Result<bool, StoreError> {
        let group_id = reactor.group_id();
        let handled_types = reactor.handled_types();

        let Some(delivery) = self
            .store
            .reserve_next_for(group_id, &handled_types, worker_id)
            .await?
        else {
            return Ok(false);
        };
        let Delivery {
            claim,
            message,
            replaying,
        } = delivery;

        let history = if reactor.requires_history() && message.seq > 1 {
            match self
                .store
                .read_stream(&message.stream_id, None, Some(message.seq - 1))
                .await
            {
                Ok(history) => history,
                Err(e) => {
                    self.store.release(&claim).await?;
                    return Err(e);
                }
            }
        } else {
            Vec::new()
        };

        tracing::trace!(
            group = group_id,
            stream = %message.stream_id,
            global_seq = message.global_seq,
            replaying,
            "turn started"
        );

        let turn = Turn {
            message: &message,
            history: &history,
            replaying,
        };
        match reactor.handle(turn).await {
            Ok(actions) => {
                self.execute(reactor, &claim, &message, replaying, actions)
                    .await
            }
            Err(error) => {
                self.apply_directive(reactor, &claim, &message, error).await?;
                Ok(true)
            }
        }
    }

    async fn execute(
        &self,
        reactor: &dyn Reactor,
        claim: &Claim,
        message: &Message,
        replaying: bool,
        actions: Vec<Action>,
    ) -> Result<bool, StoreError> {
        let correlation_id = message.correlation_id.unwrap_or(message.id);
        // Observed stream heads for seq assignment; the trigger's stream
        // head is its own seq (history was loaded up to there)
        let mut heads: HashMap<String, i64> = HashMap::new();
        heads.insert(message.stream_id.clone(), message.seq);

        let mut commit = TurnCommit {
            appends: Vec::new(),
            scheduled: Vec::new(),
            ack: message.global_seq,
        };
        let mut last_produced: Option<Uuid> = None;

        for action in actions {
            match action {
                Action::AppendNext(messages) => {
                    for m in messages {
                        let prepared = self
                            .prepare(m, message, correlation_id, message.id, &mut heads)
                            .await?;
                        last_produced = Some(prepared.id);
                        push_append(&mut commit.appends, prepared);
                    }
                }
                Action::AppendAfter(messages) => {
                    for m in messages {
                        let causation_id = last_produced.unwrap_or(message.id);
                        let prepared = self
                            .prepare(m, message, correlation_id, causation_id, &mut heads)
                            .await?;
                        last_produced = Some(prepared.id);
                        push_append(&mut commit.appends, prepared);
                    }
                }
                Action::Sync(effect) => {
                    if replaying {
                        continue;
                    }
                    if let Err(error) = effect.await {
                        self.apply_directive(reactor, claim, message, error).await?;
                        return Ok(true);
                    }
                }
                Action::Schedule { messages, at } => {
                    for mut m in messages {
                        m.stream_id = m
                            .stream_id
                            .or_else(|| Some(message.stream_id.clone()));
                        m.causation_id = m.causation_id.or(Some(message.id));
                        m.correlation_id = m.correlation_id.or(Some(correlation_id));
                        commit.scheduled.push(ScheduledAppend {
                            message: m,
                            available_at: at,
                        });
                    }
                }
            }
        }

        match self.store.commit_turn(claim, commit).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_retriable() => {
                // Release and let redelivery re-decide against fresh state
                tracing::warn!(
                    group = reactor.group_id(),
                    stream = %claim.stream_id,
                    error = %e,
                    "turn commit conflicted, releasing for redelivery"
                );
                self.store.release(claim).await?;
                Ok(true)
            }
            Err(e) => {
                self.store.release(claim).await?;
                Err(e)
            }
        }
    }

    /// Default the stream, assign the next seq, and stamp lineage
    async fn prepare(
        &self,
        mut m: NewMessage,
        source: &Message,
        correlation_id: Uuid,
        causation_id: Uuid,
        heads: &mut HashMap<String, i64>,
    ) -> Result<NewMessage, StoreError> {
        let stream_id = m
            .stream_id
            .clone()
            .unwrap_or_else(|| source.stream_id.clone());
        let head = match heads.get(&stream_id) {
            Some(&head) => head,
            None => {
                let head = self.store.current_seq(&stream_id).await?;
                heads.insert(stream_id.clone(), head);
                head
            }
        };
        let seq = m.seq.unwrap_or(head + 1);
        heads.insert(stream_id.clone(), seq.max(head));

        m.stream_id = Some(stream_id);
        m.seq = Some(seq);
        m.causation_id = m.causation_id.or(Some(causation_id));
        m.correlation_id = m.correlation_id.or(Some(correlation_id));
        Ok(m)
    }

    /// Route a handler error through the reactor's strategy
    async fn apply_directive(
        &self,
        reactor: &dyn Reactor,
        claim: &Claim,
        message: &Message,
        error: HandlerError,
    ) -> Result<(), StoreError> {
        let group_id = reactor.group_id();
        tracing::warn!(
            group = group_id,
            stream = %message.stream_id,
            global_seq = message.global_seq,
            error = %error,
            "handler failed"
        );

        match reactor.on_exception(&error, message) {
            ErrorDirective::Continue => {
                tracing::warn!(
                    group = group_id,
                    global_seq = message.global_seq,
                    "acking failed message and continuing"
                );
                self.store.ack(claim, message.global_seq).await
            }
            ErrorDirective::Retry { at } => {
                self.store.release(claim).await?;
                tracing::info!(group = group_id, retry_at = %at, "deferring group for retry");
                self.store.set_group_retry(group_id, at).await
            }
            ErrorDirective::Stop { reason } => {
                self.store.release(claim).await?;
                tracing::error!(group = group_id, reason = %reason, "stopping group");
                self.store.stop_group(group_id, &reason).await
            }
        }
    }
}

fn push_append(appends: &mut Vec<StreamAppend>, message: NewMessage) {
    // prepare() always sets the stream
    let stream_id = message.stream_id.clone().unwrap_or_default();
    if let Some(batch) = appends.iter_mut().find(|b| b.stream_id == stream_id) {
        batch.messages.push(message);
    } else {
        appends.push(StreamAppend {
            stream_id,
            messages: vec![message],
        });
    }
}
