//! Chain-merge scheduler.
//!
//! Every trigger lands in one of three branches: start a fresh PERSONAL
//! chain, fold into the user's active merge window, or promote the pending
//! PERSONAL chain into a GENERAL one. The whole decision, including every
//! ledger write, runs inside one transaction; queue work (cancelling
//! superseded entries, enqueueing the new steps) only happens after commit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use chainmail_catalog::{Template, TemplateCatalog};
use chainmail_core::config::SchedulerConfig;
use chainmail_core::error::{ChainmailError, Result};
use chainmail_core::types::{ChainType, TriggerEvent, TriggerOutcome};
use chainmail_ledger::{JobLedger, LedgerTx, NewJob};
use chainmail_queue::{DelayQueue, EnqueueOptions};

/// Queue topic carrying follow-up email payloads.
pub const FOLLOWUP_TOPIC: &str = "send-followup";

/// Payload of one queued follow-up step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowupJob {
    pub email: String,
    pub template_id: i64,
    pub user_uuid: String,
    pub step: i64,
    pub chain_type: ChainType,
    pub quiz_count_at_start: i64,
    pub geo: String,
    pub quiz_id: i64,
    /// Row this step must reconcile against before sending.
    pub ledger_job_id: i64,
}

/// Everything a committed decision still owes the queue.
struct ChainPlan {
    outcome: TriggerOutcome,
    enqueues: Vec<PlannedEnqueue>,
    cancel_prefixes: Vec<String>,
}

impl ChainPlan {
    fn new(outcome: TriggerOutcome) -> Self {
        Self {
            outcome,
            enqueues: Vec::new(),
            cancel_prefixes: Vec::new(),
        }
    }
}

struct PlannedEnqueue {
    payload: FollowupJob,
    delay: Duration,
    key: String,
}

/// Shape of the chain a materialization builds.
struct Blueprint {
    chain_type: ChainType,
    root: i64,
    quiz_count: i64,
    window_expires_at: DateTime<Utc>,
}

/// The chain-merge scheduler.
pub struct ChainScheduler {
    ledger: Arc<JobLedger>,
    catalog: Arc<TemplateCatalog>,
    queue: Arc<DelayQueue>,
    config: SchedulerConfig,
    /// Per-user locks serializing the window-lookup-then-write sequence.
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ChainScheduler {
    pub fn new(
        ledger: Arc<JobLedger>,
        catalog: Arc<TemplateCatalog>,
        queue: Arc<DelayQueue>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            ledger,
            catalog,
            queue,
            config,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn user_lock(&self, user_uuid: &str) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().await;
        locks.entry(user_uuid.to_string()).or_default().clone()
    }

    /// Handle one trigger event.
    pub async fn trigger_chain(&self, event: TriggerEvent) -> Result<TriggerOutcome> {
        let lock = self.user_lock(&event.user_uuid).await;
        let _guard = lock.lock().await;

        let now = Utc::now();
        let window_expires_at =
            now + chrono::Duration::seconds(self.config.merge_window_secs as i64);

        let plan = self
            .ledger
            .transaction(|tx| self.decide(tx, &event, now, window_expires_at))?;

        for prefix in &plan.cancel_prefixes {
            let cancelled = self.queue.cancel_matching(prefix).await;
            if cancelled > 0 {
                tracing::debug!(%prefix, cancelled, "cancelled superseded queue entries");
            }
        }
        for planned in plan.enqueues {
            let payload = serde_json::to_value(&planned.payload)
                .map_err(|e| ChainmailError::Queue(format!("encode payload: {e}")))?;
            self.queue
                .enqueue(
                    FOLLOWUP_TOPIC,
                    payload,
                    EnqueueOptions {
                        delay: planned.delay,
                        max_attempts: self.config.max_attempts,
                        backoff: Duration::from_secs(self.config.retry_backoff_secs),
                        idempotency_key: planned.key,
                    },
                )
                .await;
        }

        Ok(plan.outcome)
    }

    /// The merge decision. Runs entirely inside one ledger transaction.
    fn decide(
        &self,
        tx: &LedgerTx<'_>,
        event: &TriggerEvent,
        now: DateTime<Utc>,
        window_expires_at: DateTime<Utc>,
    ) -> Result<ChainPlan> {
        if let Some(anchor) = tx.find_active_window(&event.user_uuid, now)? {
            let root = anchor.root_quiz_id.unwrap_or(anchor.quiz_id);
            let window_start =
                now - chrono::Duration::seconds(self.config.merge_window_secs as i64);
            // The incoming trigger counts toward the total alongside every
            // anchor still reaching into the trailing window.
            let count = tx.count_window_triggers(&event.user_uuid, window_start)? + 1;

            let mut plan = ChainPlan::new(TriggerOutcome::Merged { count });

            if tx.has_pending_general(&event.user_uuid, root)? {
                // Chain is already GENERAL: refresh the count and slide the
                // window forward so the burst keeps folding in.
                tx.bulk_update_pending_chain(&event.user_uuid, root, count, window_expires_at)?;
            } else {
                let templates = self.catalog.find_general(&event.geo)?;
                if templates.is_empty() {
                    tracing::warn!(
                        "⚠️ No GENERAL templates for geo={} | user={} root={}, trigger dropped",
                        event.geo,
                        event.user_uuid,
                        root
                    );
                    return Ok(plan);
                }
                // Promotion is exclusive: the pending PERSONAL chain goes
                // away entirely, in the ledger and in the queue.
                let removed = tx.delete_pending_personal(&event.user_uuid, root)?;
                tx.clear_merge_window(&event.user_uuid, root)?;
                plan.cancel_prefixes.push(format!(
                    "{}-{}-{}-",
                    ChainType::Personal.key_prefix(),
                    event.user_uuid,
                    root
                ));
                tracing::debug!(
                    user = %event.user_uuid,
                    root,
                    removed,
                    "promoting PERSONAL chain to GENERAL"
                );
                let blueprint = Blueprint {
                    chain_type: ChainType::General,
                    root,
                    quiz_count: count,
                    window_expires_at,
                };
                self.materialize(tx, &mut plan, event, now, &blueprint, &templates)?;
            }

            tracing::info!(
                "🔀 Merged into GENERAL | user={} count={} root={}",
                event.user_uuid,
                count,
                root
            );
            Ok(plan)
        } else {
            let mut plan = ChainPlan::new(TriggerOutcome::New {
                trigger_id: event.trigger_id,
            });

            let templates = self.catalog.find_personal(event.trigger_id, &event.geo)?;
            if templates.is_empty() {
                // A personal chain with no personal content degrades to
                // general content rather than sending nothing.
                let general = self.catalog.find_general(&event.geo)?;
                if general.is_empty() {
                    tracing::warn!(
                        "⚠️ No templates for geo={} | user={} trigger={}, nothing scheduled",
                        event.geo,
                        event.user_uuid,
                        event.trigger_id
                    );
                    return Ok(plan);
                }
                let blueprint = Blueprint {
                    chain_type: ChainType::General,
                    root: event.trigger_id,
                    quiz_count: 1,
                    window_expires_at,
                };
                self.materialize(tx, &mut plan, event, now, &blueprint, &general)?;
                tracing::info!(
                    "📬 New GENERAL chain (personal fallback) | user={} trigger={}",
                    event.user_uuid,
                    event.trigger_id
                );
            } else {
                let blueprint = Blueprint {
                    chain_type: ChainType::Personal,
                    root: event.trigger_id,
                    quiz_count: 1,
                    window_expires_at,
                };
                self.materialize(tx, &mut plan, event, now, &blueprint, &templates)?;
                tracing::info!(
                    "📬 New PERSONAL chain | user={} trigger={} steps={}",
                    event.user_uuid,
                    event.trigger_id,
                    templates.len()
                );
            }
            Ok(plan)
        }
    }

    /// Insert one pending row per template and plan the matching enqueues.
    ///
    /// The first step fires one interval after `now`; each later step fires
    /// exactly one interval after the previous one. Only the first row
    /// anchors the window.
    fn materialize(
        &self,
        tx: &LedgerTx<'_>,
        plan: &mut ChainPlan,
        event: &TriggerEvent,
        now: DateTime<Utc>,
        blueprint: &Blueprint,
        templates: &[Template],
    ) -> Result<()> {
        // Stable across retries of the same logical operation: the counter
        // comes from the ledger, never from the clock.
        let generation = tx.next_chain_generation(&event.user_uuid)?;

        for (index, template) in templates.iter().enumerate() {
            let offset_secs = self.config.step_interval_secs * (index as u64 + 1);
            let scheduled_at = now + chrono::Duration::seconds(offset_secs as i64);
            let is_anchor = index == 0;

            let job_id = tx.insert_job(&NewJob {
                user_uuid: event.user_uuid.clone(),
                template_id: template.id,
                quiz_id: blueprint.root,
                root_quiz_id: is_anchor.then_some(blueprint.root),
                chain_type: blueprint.chain_type,
                quiz_count_at_start: blueprint.quiz_count,
                chain_generation: generation,
                step: template.step,
                scheduled_at,
                merge_window_expires_at: is_anchor.then_some(blueprint.window_expires_at),
                created_at: now,
            })?;

            let key = format!(
                "{}-{}-{}-{}-{}",
                blueprint.chain_type.key_prefix(),
                event.user_uuid,
                blueprint.root,
                template.step,
                generation
            );
            plan.enqueues.push(PlannedEnqueue {
                payload: FollowupJob {
                    email: event.email.clone(),
                    template_id: template.id,
                    user_uuid: event.user_uuid.clone(),
                    step: template.step,
                    chain_type: blueprint.chain_type,
                    quiz_count_at_start: blueprint.quiz_count,
                    geo: event.geo.clone(),
                    quiz_id: blueprint.root,
                    ledger_job_id: job_id,
                },
                delay: Duration::from_secs(offset_secs),
                key,
            });

            tracing::debug!(
                "{} step {} -> job {} | '{}' fires in {}s",
                blueprint.chain_type,
                template.step,
                job_id,
                template.subject,
                offset_secs
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainmail_catalog::NewTemplate;
    use chainmail_ledger::JobStatus;

    fn setup(tag: &str) -> (ChainScheduler, Arc<JobLedger>, Arc<TemplateCatalog>, Arc<DelayQueue>, std::path::PathBuf)
    {
        let dir = std::env::temp_dir().join(format!("chainmail-scheduler-{tag}"));
        std::fs::remove_dir_all(&dir).ok();
        let ledger = Arc::new(JobLedger::open(&dir.join("ledger.db")).unwrap());
        let catalog = Arc::new(TemplateCatalog::open(&dir.join("catalog.db")).unwrap());
        let queue = Arc::new(DelayQueue::new());
        let scheduler = ChainScheduler::new(
            ledger.clone(),
            catalog.clone(),
            queue.clone(),
            SchedulerConfig::default(),
        );
        (scheduler, ledger, catalog, queue, dir)
    }

    fn seed_templates(catalog: &TemplateCatalog) {
        for step in 1..=2 {
            catalog
                .insert(&NewTemplate {
                    quiz_id: Some(1),
                    geo: "VN".into(),
                    step,
                    subject: format!("Personal step {step}"),
                    html: format!("<p>personal {step}</p>"),
                })
                .unwrap();
        }
        for step in 1..=3 {
            catalog
                .insert(&NewTemplate {
                    quiz_id: None,
                    geo: "VN".into(),
                    step,
                    subject: format!("General step {step}"),
                    html: format!("<p>general {step}</p>"),
                })
                .unwrap();
        }
    }

    fn event(user: &str, trigger_id: i64) -> TriggerEvent {
        TriggerEvent {
            user_uuid: user.into(),
            email: format!("{user}@example.com"),
            trigger_id,
            geo: "VN".into(),
        }
    }

    #[tokio::test]
    async fn test_new_trigger_starts_personal_chain() {
        let (scheduler, ledger, catalog, queue, dir) = setup("new-personal");
        seed_templates(&catalog);

        let outcome = scheduler.trigger_chain(event("u1", 1)).await.unwrap();
        assert_eq!(outcome, TriggerOutcome::New { trigger_id: 1 });

        let rows = ledger.jobs_for_user("u1").unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.status == JobStatus::Pending));
        assert!(rows.iter().all(|r| r.chain_type == ChainType::Personal));
        assert!(rows.iter().all(|r| r.quiz_id == 1));

        // Only the anchor row carries root and window.
        assert_eq!(rows[0].root_quiz_id, Some(1));
        assert!(rows[0].merge_window_expires_at.is_some());
        assert_eq!(rows[1].root_quiz_id, None);
        assert!(rows[1].merge_window_expires_at.is_none());

        // First step one interval out, then fixed spacing.
        assert_eq!(
            (rows[0].scheduled_at - rows[0].created_at).num_seconds(),
            60
        );
        assert_eq!(
            (rows[1].scheduled_at - rows[0].scheduled_at).num_seconds(),
            60
        );

        assert_eq!(queue.pending().await, 2);
        let generation = rows[0].chain_generation;
        assert!(queue.is_key_live(&format!("p-u1-1-1-{generation}")).await);
        assert!(queue.is_key_live(&format!("p-u1-1-2-{generation}")).await);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_missing_personal_templates_fall_back_to_general() {
        let (scheduler, ledger, catalog, queue, dir) = setup("fallback");
        seed_templates(&catalog);

        // No personal templates exist for trigger 99.
        let outcome = scheduler.trigger_chain(event("u1", 99)).await.unwrap();
        assert_eq!(outcome, TriggerOutcome::New { trigger_id: 99 });

        let rows = ledger.jobs_for_user("u1").unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.chain_type == ChainType::General));
        assert!(rows.iter().all(|r| r.quiz_count_at_start == 1));
        assert_eq!(rows[0].root_quiz_id, Some(99));
        assert_eq!(queue.pending().await, 3);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_no_templates_at_all_schedules_nothing() {
        let (scheduler, ledger, _catalog, queue, dir) = setup("empty-geo");

        let outcome = scheduler.trigger_chain(event("u1", 1)).await.unwrap();
        assert_eq!(outcome, TriggerOutcome::New { trigger_id: 1 });
        assert!(ledger.jobs_for_user("u1").unwrap().is_empty());
        assert_eq!(queue.pending().await, 0);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_second_trigger_merges_and_promotes() {
        let (scheduler, ledger, catalog, queue, dir) = setup("merge");
        seed_templates(&catalog);

        scheduler.trigger_chain(event("u1", 1)).await.unwrap();
        let outcome = scheduler.trigger_chain(event("u1", 2)).await.unwrap();
        assert_eq!(outcome, TriggerOutcome::Merged { count: 2 });

        let pending: Vec<_> = ledger
            .jobs_for_user("u1")
            .unwrap()
            .into_iter()
            .filter(|r| r.status == JobStatus::Pending)
            .collect();

        // Promotion is exclusive: the GENERAL chain fully replaced the
        // PERSONAL one, reusing the first trigger as root.
        assert_eq!(pending.len(), 3);
        assert!(pending.iter().all(|r| r.chain_type == ChainType::General));
        assert!(pending.iter().all(|r| r.quiz_id == 1));
        assert!(pending.iter().all(|r| r.quiz_count_at_start == 2));

        let anchors: Vec<_> = pending
            .iter()
            .filter(|r| r.root_quiz_id.is_some())
            .collect();
        assert_eq!(anchors.len(), 1);
        assert_eq!(anchors[0].root_quiz_id, Some(1));
        assert!(anchors[0].merge_window_expires_at.is_some());

        // Queue: personal entries cancelled, general entries live.
        assert_eq!(queue.pending().await, 3);
        let generation = pending[0].chain_generation;
        assert!(!queue.is_key_live("p-u1-1-1-1").await);
        assert!(!queue.is_key_live("p-u1-1-2-1").await);
        assert!(queue.is_key_live(&format!("g-u1-1-1-{generation}")).await);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_third_trigger_slides_window_without_new_chain() {
        let (scheduler, ledger, catalog, queue, dir) = setup("slide");
        seed_templates(&catalog);

        scheduler.trigger_chain(event("u1", 1)).await.unwrap();
        scheduler.trigger_chain(event("u1", 2)).await.unwrap();

        let before = ledger
            .jobs_for_user("u1")
            .unwrap()
            .into_iter()
            .find(|r| r.root_quiz_id.is_some() && r.status == JobStatus::Pending)
            .unwrap();

        let outcome = scheduler.trigger_chain(event("u1", 3)).await.unwrap();
        assert!(matches!(outcome, TriggerOutcome::Merged { .. }));

        let pending: Vec<_> = ledger
            .jobs_for_user("u1")
            .unwrap()
            .into_iter()
            .filter(|r| r.status == JobStatus::Pending)
            .collect();
        // Still one GENERAL chain, no extra rows.
        assert_eq!(pending.len(), 3);
        let anchors: Vec<_> = pending
            .iter()
            .filter(|r| r.root_quiz_id.is_some())
            .collect();
        assert_eq!(anchors.len(), 1);
        assert!(
            anchors[0].merge_window_expires_at.unwrap()
                >= before.merge_window_expires_at.unwrap()
        );
        assert_eq!(queue.pending().await, 3);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_expired_window_starts_fresh_chain() {
        let (scheduler, ledger, catalog, queue, dir) = setup("expired");
        seed_templates(&catalog);

        // Anchor whose window expired exactly at insertion time: the next
        // trigger must not see it (expiry comparison is strict).
        let now = Utc::now();
        ledger
            .transaction(|tx| {
                tx.insert_job(&NewJob {
                    user_uuid: "u1".into(),
                    template_id: 1,
                    quiz_id: 7,
                    root_quiz_id: Some(7),
                    chain_type: ChainType::Personal,
                    quiz_count_at_start: 1,
                    chain_generation: 1,
                    step: 1,
                    scheduled_at: now,
                    merge_window_expires_at: Some(now),
                    created_at: now,
                })
            })
            .unwrap();

        let outcome = scheduler.trigger_chain(event("u1", 1)).await.unwrap();
        assert_eq!(outcome, TriggerOutcome::New { trigger_id: 1 });
        assert_eq!(queue.pending().await, 2);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_merge_without_general_templates_drops_trigger() {
        let (scheduler, ledger, catalog, queue, dir) = setup("no-general");
        // Personal templates only; promotion will find nothing to build from.
        for step in 1..=2 {
            catalog
                .insert(&NewTemplate {
                    quiz_id: Some(1),
                    geo: "VN".into(),
                    step,
                    subject: format!("Personal step {step}"),
                    html: "<p>x</p>".into(),
                })
                .unwrap();
        }

        scheduler.trigger_chain(event("u1", 1)).await.unwrap();
        let outcome = scheduler.trigger_chain(event("u1", 2)).await.unwrap();
        assert_eq!(outcome, TriggerOutcome::Merged { count: 2 });

        // The personal chain survives untouched; nothing new was queued.
        let rows = ledger.jobs_for_user("u1").unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.chain_type == ChainType::Personal));
        assert!(rows.iter().all(|r| r.status == JobStatus::Pending));
        assert_eq!(queue.pending().await, 2);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_idempotency_keys_unique_within_batch() {
        let (scheduler, ledger, catalog, queue, dir) = setup("keys");
        for step in 1..=4 {
            catalog
                .insert(&NewTemplate {
                    quiz_id: Some(1),
                    geo: "VN".into(),
                    step,
                    subject: format!("s{step}"),
                    html: "<p>x</p>".into(),
                })
                .unwrap();
        }

        scheduler.trigger_chain(event("u1", 1)).await.unwrap();
        // Four steps, four distinct keys, four queued entries.
        assert_eq!(queue.pending().await, 4);
        let generation = ledger.jobs_for_user("u1").unwrap()[0].chain_generation;
        for step in 1..=4 {
            assert!(queue.is_key_live(&format!("p-u1-1-{step}-{generation}")).await);
        }
        std::fs::remove_dir_all(&dir).ok();
    }
}
