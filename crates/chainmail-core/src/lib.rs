//! # Chainmail Core
//!
//! Shared foundation for the Chainmail workspace: configuration loading,
//! the error taxonomy, domain types for trigger events, and the trait seams
//! behind which external collaborators (the mail transport) live.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::ChainmailConfig;
pub use error::{ChainmailError, Result};
pub use types::{ChainType, TriggerEvent, TriggerOutcome};
