//! The dispatch engine
//!
//! Data flow: producer append → notifier signal → queuer maps types to
//! reactors → work queue → worker → router reserves a stream claim, runs
//! the handler, commits its actions and the ack in one transaction → the
//! commit's own signal fans the chain out again. The catch-up poller and
//! the housekeeping reaper keep the loop live across lost signals and
//! crashed workers.

pub mod housekeeping;
pub mod poller;
pub mod queue;
pub mod queuer;
pub mod router;
pub mod supervisor;
pub mod worker;

pub use queue::WorkQueue;
pub use router::Router;
pub use supervisor::Dispatcher;
pub use worker::Worker;
