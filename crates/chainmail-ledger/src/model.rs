//! Ledger row definitions.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use chainmail_core::types::ChainType;

/// Delivery status of one ledger row.
///
/// Rows only ever move pending → sent or pending → failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobStatus {
    Pending,
    Sent,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Sent => "sent",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "sent" => Some(JobStatus::Sent),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// One scheduled chain email.
#[derive(Debug, Clone, Serialize)]
pub struct EmailJob {
    pub id: i64,
    pub user_uuid: String,
    /// Template this step renders.
    pub template_id: i64,
    /// Logical root shared by every row of the chain.
    pub quiz_id: i64,
    /// Set only on the anchor row of a merge window.
    pub root_quiz_id: Option<i64>,
    pub chain_type: ChainType,
    /// How many triggers the chain represented when it was last (re)built.
    pub quiz_count_at_start: i64,
    /// Per-user monotonic counter stamped at materialization; feeds the
    /// delay-queue idempotency keys.
    pub chain_generation: i64,
    pub step: i64,
    pub status: JobStatus,
    pub scheduled_at: DateTime<Utc>,
    /// Set only on the anchor row; strictly-future values mark an active window.
    pub merge_window_expires_at: Option<DateTime<Utc>>,
    pub attempts: i64,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Fields required to insert a new pending row.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub user_uuid: String,
    pub template_id: i64,
    pub quiz_id: i64,
    pub root_quiz_id: Option<i64>,
    pub chain_type: ChainType,
    pub quiz_count_at_start: i64,
    pub chain_generation: i64,
    pub step: i64,
    pub scheduled_at: DateTime<Utc>,
    pub merge_window_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Encode a timestamp for storage. Fixed-width micros keep TEXT comparison
/// in SQL consistent with chronological order.
pub(crate) fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
