//! # Chainmail Queue
//!
//! In-process delay queue: accepts a payload, an execute-after delay, and an
//! idempotency key, then invokes a handler at-least-once after the delay.
//! Failed handler calls are retried on a fixed backoff until the attempt
//! budget is spent. A key stays "live" from enqueue until its entry
//! completes, is abandoned, or is cancelled; re-submitting a live key is a
//! no-op, which is what makes chain materialization safe to retry.

pub mod queue;
pub mod worker;

pub use queue::{DelayQueue, DelayedEntry, EnqueueOptions};
pub use worker::{process_due, spawn_queue_worker};
