//! Delivery processor — consumes due queue entries and drives the mail
//! transport.
//!
//! The processor reconciles every fire against the ledger before sending: a
//! row that vanished (its chain was promoted away) or already reached a
//! terminal state is a no-op, and a missing template is a data error that
//! gets dropped rather than retried. Only transport failures propagate, so
//! the queue's retry policy applies exactly where retrying can help.

use std::sync::Arc;

use chainmail_catalog::TemplateCatalog;
use chainmail_core::traits::Mailer;
use chainmail_ledger::{JobLedger, JobStatus};
use chainmail_queue::DelayedEntry;

use crate::scheduler::FollowupJob;

/// Executes queued follow-up emails.
pub struct DeliveryProcessor {
    ledger: Arc<JobLedger>,
    catalog: Arc<TemplateCatalog>,
    mailer: Arc<dyn Mailer>,
}

impl DeliveryProcessor {
    pub fn new(
        ledger: Arc<JobLedger>,
        catalog: Arc<TemplateCatalog>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        Self {
            ledger,
            catalog,
            mailer,
        }
    }

    /// Queue handler for one due entry.
    pub async fn handle(&self, entry: DelayedEntry) -> Result<(), String> {
        let job: FollowupJob = match serde_json::from_value(entry.payload.clone()) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!("Malformed follow-up payload, dropping: {e}");
                return Ok(());
            }
        };

        let row = match self.ledger.get_job(job.ledger_job_id) {
            Ok(Some(row)) => row,
            Ok(None) => {
                // The chain was superseded after this entry was queued.
                tracing::debug!(
                    job_id = job.ledger_job_id,
                    user = %job.user_uuid,
                    "ledger row gone, skipping fire"
                );
                return Ok(());
            }
            Err(e) => return Err(format!("ledger read: {e}")),
        };
        if row.status != JobStatus::Pending {
            tracing::debug!(
                job_id = row.id,
                status = row.status.as_str(),
                "row already terminal, skipping fire"
            );
            return Ok(());
        }

        let template = match self.catalog.find_by_id(job.template_id) {
            Ok(Some(template)) => template,
            Ok(None) => {
                // Data error, not transient: retrying cannot make the
                // template appear. The row stays pending and visible.
                tracing::error!(
                    "Template {} not found (user={} chain={} step={}), dropping job {}",
                    job.template_id,
                    job.user_uuid,
                    job.chain_type,
                    job.step,
                    row.id
                );
                return Ok(());
            }
            Err(e) => return Err(format!("catalog read: {e}")),
        };

        match self
            .mailer
            .send(&job.email, &template.subject, &template.html)
            .await
        {
            Ok(()) => {
                self.ledger
                    .mark_sent(row.id, entry.attempts_made)
                    .map_err(|e| format!("mark sent: {e}"))?;
                tracing::info!(
                    "✅ Sent: {} | step {} (user={} chain={})",
                    job.email,
                    job.step,
                    job.user_uuid,
                    job.chain_type
                );
                Ok(())
            }
            Err(e) => {
                self.ledger.record_attempt(row.id).ok();
                tracing::warn!(
                    "⚠️ Send failed: {} | step {} (user={} chain={}): {e}",
                    job.email,
                    job.step,
                    job.user_uuid,
                    job.chain_type
                );
                Err(format!("send: {e}"))
            }
        }
    }
}
