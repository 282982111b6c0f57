//! Error types for Chainmail.

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Error, Debug)]
pub enum ChainmailError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Template catalog error: {0}")]
    Catalog(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Mail transport error: {0}")]
    Mail(String),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ChainmailError>;
