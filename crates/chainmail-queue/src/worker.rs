//! Queue worker — the loop that fires due entries into a handler.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::queue::{DelayQueue, DelayedEntry};

/// Handle every entry due at `now`. Returns how many entries were invoked.
///
/// A handler error re-queues the entry after its fixed backoff until the
/// attempt budget is spent, then the entry is abandoned with an error log.
/// At-least-once, never silent.
pub async fn process_due<F, Fut>(queue: &DelayQueue, handler: &F, now: DateTime<Utc>) -> usize
where
    F: Fn(DelayedEntry) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), String>> + Send,
{
    let due = queue.take_due(now).await;
    let fired = due.len();

    for mut entry in due {
        entry.attempts_made += 1;
        match handler(entry.clone()).await {
            Ok(()) => {
                queue.retire_key(&entry.idempotency_key).await;
                tracing::debug!(
                    topic = %entry.topic,
                    key = %entry.idempotency_key,
                    attempt = entry.attempts_made,
                    "entry handled"
                );
            }
            Err(e) => {
                if entry.attempts_made < entry.max_attempts {
                    let backoff_secs = entry.backoff.as_secs() as i64;
                    tracing::warn!(
                        "⚠️ Handler failed for {} (attempt {}/{}), retrying in {}s: {e}",
                        entry.idempotency_key,
                        entry.attempts_made,
                        entry.max_attempts,
                        backoff_secs
                    );
                    let retry_at = Utc::now() + chrono::Duration::seconds(backoff_secs);
                    queue.requeue(entry, retry_at).await;
                } else {
                    tracing::error!(
                        "Entry {} abandoned after {} attempts: {e}",
                        entry.idempotency_key,
                        entry.attempts_made
                    );
                    queue.retire_key(&entry.idempotency_key).await;
                }
            }
        }
    }

    fired
}

/// Run the queue worker loop. Spawn this as a background tokio task.
pub async fn spawn_queue_worker<F, Fut>(queue: Arc<DelayQueue>, handler: F, poll_interval_secs: u64)
where
    F: Fn(DelayedEntry) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send,
{
    tracing::info!(
        "⏰ Delay-queue worker started (poll every {}s)",
        poll_interval_secs.max(1)
    );

    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(poll_interval_secs.max(1)));

    loop {
        interval.tick().await;
        process_due(queue.as_ref(), &handler, Utc::now()).await;
    }
}
