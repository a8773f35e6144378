// Outbox: durable at-least-once delivery of outbound messages.
//
// Producers enqueue into the `outbox` collection; only the lease holder's
// worker drains it.

pub mod queue;
pub mod worker;

pub use queue::{FailOutcome, OutboxPolicy, OutboxQueue, OutboxStats, ACK_TIMEOUT_ERROR};
pub use worker::{CycleReport, CycleSkip, OutboxWorker};
