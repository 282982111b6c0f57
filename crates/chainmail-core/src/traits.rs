//! Trait seams for external collaborators.

use crate::error::Result;

/// Outbound mail transport.
///
/// The delivery processor only ever talks to this trait; the SMTP
/// implementation lives in `chainmail-mailer` and tests substitute their own.
#[async_trait::async_trait]
pub trait Mailer: Send + Sync {
    /// Send one HTML email.
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<()>;
}
