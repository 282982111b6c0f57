//! # Chainmail Scheduler
//!
//! The chain-merge core. [`scheduler::ChainScheduler`] turns trigger events
//! into chains of delayed email jobs, folding concurrent triggers from the
//! same user into one combined sequence; [`processor::DeliveryProcessor`]
//! consumes the queued jobs and drives the mail transport.

pub mod processor;
pub mod scheduler;

pub use processor::DeliveryProcessor;
pub use scheduler::{ChainScheduler, FOLLOWUP_TOPIC, FollowupJob};
