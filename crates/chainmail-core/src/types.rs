//! Shared domain types.

use serde::{Deserialize, Serialize};

/// Which template family a chain draws from.
///
/// PERSONAL chains are built from templates tied to one trigger identifier;
/// GENERAL chains use the geo-wide templates shared across triggers and are
/// what a user's chain becomes once several triggers merge into one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainType {
    Personal,
    General,
}

impl ChainType {
    /// Canonical storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainType::Personal => "PERSONAL",
            ChainType::General => "GENERAL",
        }
    }

    /// Short prefix used in delay-queue idempotency keys.
    pub fn key_prefix(&self) -> &'static str {
        match self {
            ChainType::Personal => "p",
            ChainType::General => "g",
        }
    }

    /// Parse the storage representation back into the enum.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PERSONAL" => Some(ChainType::Personal),
            "GENERAL" => Some(ChainType::General),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChainType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One trigger event, as validated by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Stable identity of the user the chain belongs to.
    pub user_uuid: String,
    /// Destination address for every email of the chain.
    pub email: String,
    /// Identifier of the event that fired (anchors a merge window).
    pub trigger_id: i64,
    /// Geography key used for template lookup.
    pub geo: String,
}

/// What the scheduler decided to do with a trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A fresh chain was started, anchored at this trigger.
    New { trigger_id: i64 },
    /// The trigger folded into an existing merge window; `count` is the
    /// number of triggers the combined chain now represents.
    Merged { count: i64 },
}
