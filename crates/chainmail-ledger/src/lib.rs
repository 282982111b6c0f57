//! # Chainmail Ledger
//!
//! Durable record of every scheduled chain email, backed by SQLite.
//! The scheduler writes rows and rewrites chain metadata inside explicit
//! transactions; the delivery processor flips rows into their terminal
//! states. Terminal rows are immutable.

pub mod model;
pub mod store;

pub use model::{EmailJob, JobStatus, NewJob};
pub use store::{JobLedger, LedgerTx};
