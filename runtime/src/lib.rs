//! # millrace
//!
//! An embeddable event-sourcing runtime. Applications define **reactors**
//! (command-handling actors and event projectors); the runtime persists
//! every command and event in a durable log and dispatches messages to
//! reactors with per-stream ordering, claim-based isolation, and
//! at-least-once delivery.
//!
//! ```text
//! producer ──append──► log store ──signal──► queuer ──► work queue
//!                         ▲                                  │
//!                         │                               worker
//!                         └──── commit (events + ack) ◄── router ──► reactor
//! ```
//!
//! The hard guarantees come from two places: the `UNIQUE(stream_id, seq)`
//! index on the log (optimistic concurrency for writers) and the
//! `(group_id, stream_id)` claim (exclusive leasing for consumers). The
//! catch-up poller and the stale-claim reaper make the loop self-healing
//! across lost signals and crashed workers.

pub mod core;
pub mod dispatch;
pub mod model;
pub mod notify;
pub mod reactor;
pub mod runtime;
pub mod store;

pub use crate::core::config::{Config, DispatchConfig, NotifierConfig, StoreConfig};
pub use dispatch::Dispatcher;
pub use model::{Message, NewMessage, WorkerInfo};
pub use notify::{InProcessNotifier, Notifier, NotifyError, PostgresNotifier, Signal};
pub use reactor::{Action, ErrorDirective, HandlerError, Reactor, ReactorRegistry, Turn};
pub use runtime::{EngineError, Runtime};
pub use store::postgres::PostgresStore;
pub use store::{
    Claim, ConsumerGroupState, Delivery, GroupStats, GroupStatus, MemoryStore, Store, StoreError,
    StreamHead, TurnCommit,
};
