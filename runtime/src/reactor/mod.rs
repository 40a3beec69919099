//! Reactor contract consumed by the dispatch engine
//!
//! A reactor is any subscriber: an *actor* handles commands, folds its
//! stream history into state, and emits events; a *projector* folds events
//! into derived state. Handlers never perform side effects directly — they
//! return [`Action`] values that the router executes inside the turn's
//! transaction, which is what makes replay suppression and at-least-once
//! redelivery safe.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::model::{Message, NewMessage};

/// Boxed error from reactor code
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// In-turn side effect; runs before the commit and only when not replaying
pub type SyncEffect = BoxFuture<'static, Result<(), HandlerError>>;

/// What a handler wants done with its turn
pub enum Action {
    /// Append now, caused by the triggering message
    AppendNext(Vec<NewMessage>),
    /// Append, caused by the last produced message (for reactions that
    /// follow an emitted event)
    AppendAfter(Vec<NewMessage>),
    /// Side effect executed in the turn, skipped on replay
    Sync(SyncEffect),
    /// Park messages until `at`
    Schedule {
        messages: Vec<NewMessage>,
        at: DateTime<Utc>,
    },
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::AppendNext(messages) => {
                f.debug_tuple("AppendNext").field(messages).finish()
            }
            Action::AppendAfter(messages) => {
                f.debug_tuple("AppendAfter").field(messages).finish()
            }
            Action::Sync(_) => f.write_str("Sync(..)"),
            Action::Schedule { messages, at } => f
                .debug_struct("Schedule")
                .field("messages", messages)
                .field("at", at)
                .finish(),
        }
    }
}

/// One delivery as seen by a handler
#[derive(Debug, Clone, Copy)]
pub struct Turn<'a> {
    pub message: &'a Message,
    /// Stream history up to (excluding) the triggering message; empty when
    /// the reactor opts out via [`Reactor::requires_history`]
    pub history: &'a [Message],
    /// The group has processed this position before; suppress side effects
    pub replaying: bool,
}

/// What to do after a handler error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorDirective {
    /// Defer the whole group until `at`, then redeliver
    Retry { at: DateTime<Utc> },
    /// Stop the group until an explicit start
    Stop { reason: String },
    /// Ack the failing message and move on. Dangerous, opt-in only.
    Continue,
}

impl ErrorDirective {
    pub fn stop(reason: impl Into<String>) -> Self {
        ErrorDirective::Stop {
            reason: reason.into(),
        }
    }

    pub fn retry_at(at: DateTime<Utc>) -> Self {
        ErrorDirective::Retry { at }
    }

    pub fn retry_in(delay: chrono::Duration) -> Self {
        ErrorDirective::Retry {
            at: Utc::now() + delay,
        }
    }
}

/// A subscriber of the dispatch engine
#[async_trait]
pub trait Reactor: Send + Sync {
    /// Consumer group identity; one group per reactor class
    fn group_id(&self) -> &str;

    /// Message types this reactor consumes
    fn handled_types(&self) -> Vec<String>;

    /// Whether the router should load stream history before each turn.
    /// Projectors that keep their own state can opt out.
    fn requires_history(&self) -> bool {
        true
    }

    /// Handle one message; returns the actions to execute transactionally
    async fn handle(&self, turn: Turn<'_>) -> Result<Vec<Action>, HandlerError>;

    /// Error strategy. The default stops the group, which keeps a failing
    /// reactor from spinning on the same message.
    fn on_exception(&self, error: &HandlerError, message: &Message) -> ErrorDirective {
        let _ = message;
        ErrorDirective::stop(error.to_string())
    }
}

/// Reactor lookup by group and by handled type
#[derive(Clone, Default)]
pub struct ReactorRegistry {
    by_group: HashMap<String, Arc<dyn Reactor>>,
    by_type: HashMap<String, Vec<String>>,
}

impl ReactorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reactor; a duplicate group id replaces the previous entry
    pub fn register(&mut self, reactor: Arc<dyn Reactor>) {
        let group_id = reactor.group_id().to_string();
        if self.by_group.contains_key(&group_id) {
            tracing::warn!(group = %group_id, "replacing reactor registered for group");
            for groups in self.by_type.values_mut() {
                groups.retain(|g| g != &group_id);
            }
        }
        for message_type in reactor.handled_types() {
            let groups = self.by_type.entry(message_type).or_default();
            if !groups.contains(&group_id) {
                groups.push(group_id.clone());
            }
        }
        self.by_group.insert(group_id, reactor);
    }

    pub fn get(&self, group_id: &str) -> Option<Arc<dyn Reactor>> {
        self.by_group.get(group_id).cloned()
    }

    /// Groups whose reactors handle the given type
    pub fn groups_for_type(&self, message_type: &str) -> Vec<String> {
        self.by_type
            .get(message_type)
            .cloned()
            .unwrap_or_default()
    }

    pub fn group_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.by_group.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.by_group.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_group.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubReactor {
        group: &'static str,
        types: Vec<String>,
    }

    #[async_trait]
    impl Reactor for StubReactor {
        fn group_id(&self) -> &str {
            self.group
        }

        fn handled_types(&self) -> Vec<String> {
            self.types.clone()
        }

        async fn handle(&self, _turn: Turn<'_>) -> Result<Vec<Action>, HandlerError> {
            Ok(vec![])
        }
    }

    fn reactor(group: &'static str, types: &[&str]) -> Arc<dyn Reactor> {
        Arc::new(StubReactor {
            group,
            types: types.iter().map(|t| t.to_string()).collect(),
        })
    }

    #[test]
    fn test_registry_maps_types_to_groups() {
        let mut registry = ReactorRegistry::new();
        registry.register(reactor("carts", &["AddItem", "RemoveItem"]));
        registry.register(reactor("mailer", &["AddItem"]));

        let mut groups = registry.groups_for_type("AddItem");
        groups.sort();
        assert_eq!(groups, vec!["carts".to_string(), "mailer".to_string()]);
        assert_eq!(registry.groups_for_type("RemoveItem"), vec!["carts"]);
        assert!(registry.groups_for_type("Unknown").is_empty());
    }

    #[test]
    fn test_registry_replaces_duplicate_group() {
        let mut registry = ReactorRegistry::new();
        registry.register(reactor("carts", &["AddItem"]));
        registry.register(reactor("carts", &["RemoveItem"]));

        assert_eq!(registry.len(), 1);
        assert!(registry.groups_for_type("AddItem").is_empty());
        assert_eq!(registry.groups_for_type("RemoveItem"), vec!["carts"]);
    }

    #[test]
    fn test_group_ids_sorted() {
        let mut registry = ReactorRegistry::new();
        registry.register(reactor("b", &["X"]));
        registry.register(reactor("a", &["Y"]));
        assert_eq!(registry.group_ids(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_default_error_directive_stops() {
        let r = StubReactor {
            group: "g",
            types: vec![],
        };
        let err: HandlerError = "boom".into();
        let message = crate::model::Message {
            global_seq: 1,
            id: uuid::Uuid::new_v4(),
            stream_id: "s1".into(),
            seq: 1,
            message_type: "A".into(),
            payload: serde_json::json!({}),
            metadata: serde_json::json!({}),
            causation_id: None,
            correlation_id: None,
            created_at: Utc::now(),
        };
        assert_eq!(
            r.on_exception(&err, &message),
            ErrorDirective::stop("boom")
        );
    }
}
