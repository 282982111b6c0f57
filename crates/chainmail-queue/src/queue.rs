//! Queue state: delayed entries plus the live idempotency-key set.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

/// Options accepted alongside every enqueue.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// How long to wait before the first handler invocation.
    pub delay: Duration,
    /// Handler attempt budget, including the first invocation.
    pub max_attempts: u32,
    /// Fixed pause between retries.
    pub backoff: Duration,
    /// Deduplication key; a live key rejects re-submission.
    pub idempotency_key: String,
}

/// One queued delayed job.
#[derive(Debug, Clone)]
pub struct DelayedEntry {
    pub id: String,
    pub topic: String,
    pub payload: serde_json::Value,
    pub fire_at: DateTime<Utc>,
    /// Attempts already made; the worker bumps this before each invocation.
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: Duration,
    pub idempotency_key: String,
}

#[derive(Default)]
struct QueueState {
    entries: Vec<DelayedEntry>,
    live_keys: HashSet<String>,
}

/// The delay queue.
pub struct DelayQueue {
    state: Mutex<QueueState>,
}

impl DelayQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Enqueue a payload for delayed handling. Returns false (and leaves the
    /// queue untouched) when the idempotency key is already live.
    pub async fn enqueue(
        &self,
        topic: &str,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> bool {
        let mut state = self.state.lock().await;
        if state.live_keys.contains(&opts.idempotency_key) {
            tracing::debug!(
                key = %opts.idempotency_key,
                "duplicate enqueue suppressed"
            );
            return false;
        }
        let fire_at = Utc::now() + chrono::Duration::seconds(opts.delay.as_secs() as i64);
        state.live_keys.insert(opts.idempotency_key.clone());
        state.entries.push(DelayedEntry {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            payload,
            fire_at,
            attempts_made: 0,
            max_attempts: opts.max_attempts.max(1),
            backoff: opts.backoff,
            idempotency_key: opts.idempotency_key,
        });
        true
    }

    /// Drop queued entries whose idempotency key starts with `prefix` and
    /// retire their keys. Returns how many entries were cancelled.
    pub async fn cancel_matching(&self, prefix: &str) -> usize {
        let mut state = self.state.lock().await;
        let before = state.entries.len();
        let mut cancelled_keys = Vec::new();
        state.entries.retain(|entry| {
            if entry.idempotency_key.starts_with(prefix) {
                cancelled_keys.push(entry.idempotency_key.clone());
                false
            } else {
                true
            }
        });
        for key in &cancelled_keys {
            state.live_keys.remove(key);
        }
        before - state.entries.len()
    }

    /// Remove and return every entry due at `now`, soonest first.
    pub async fn take_due(&self, now: DateTime<Utc>) -> Vec<DelayedEntry> {
        let mut state = self.state.lock().await;
        let mut due: Vec<DelayedEntry> = Vec::new();
        state.entries.retain(|entry| {
            if entry.fire_at <= now {
                due.push(entry.clone());
                false
            } else {
                true
            }
        });
        due.sort_by_key(|entry| entry.fire_at);
        due
    }

    /// Put a failed entry back for another attempt. Its key stays live.
    pub async fn requeue(&self, mut entry: DelayedEntry, fire_at: DateTime<Utc>) {
        entry.fire_at = fire_at;
        self.state.lock().await.entries.push(entry);
    }

    /// Retire a key once its entry completed, was abandoned, or cancelled.
    pub async fn retire_key(&self, key: &str) {
        self.state.lock().await.live_keys.remove(key);
    }

    /// Number of queued (not yet due-taken) entries.
    pub async fn pending(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// Whether a key currently blocks re-submission.
    pub async fn is_key_live(&self, key: &str) -> bool {
        self.state.lock().await.live_keys.contains(key)
    }
}

impl Default for DelayQueue {
    fn default() -> Self {
        Self::new()
    }
}
