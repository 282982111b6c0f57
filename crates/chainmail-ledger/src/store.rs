//! SQLite-backed job ledger.
//!
//! One `Mutex<Connection>` guards the database; the scheduler's compound
//! reads and writes run through [`JobLedger::transaction`] so a failed merge
//! or materialization rolls back to a clean ledger. Status updates from the
//! delivery processor guard on `status = 'pending'`, which is what makes
//! terminal states immutable.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};

use chainmail_core::error::{ChainmailError, Result};
use chainmail_core::types::ChainType;

use crate::model::{EmailJob, JobStatus, NewJob, decode_ts, encode_ts};

const JOB_COLUMNS: &str = "id, user_uuid, template_id, quiz_id, root_quiz_id, chain_type, \
     quiz_count_at_start, chain_generation, step, status, scheduled_at, \
     merge_window_expires_at, attempts, sent_at, created_at";

/// Durable job ledger.
pub struct JobLedger {
    conn: Mutex<Connection>,
}

impl JobLedger {
    /// Open or create the ledger database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| ChainmailError::Ledger(format!("open: {e}")))?;

        // WAL keeps processor reads from blocking scheduler transactions
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();

        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.migrate()?;
        tracing::debug!("💾 Ledger opened at {}", path.display());
        Ok(ledger)
    }

    /// Run schema migrations.
    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS email_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_uuid TEXT NOT NULL,
                template_id INTEGER NOT NULL,
                quiz_id INTEGER NOT NULL,
                root_quiz_id INTEGER,            -- anchor rows only
                chain_type TEXT NOT NULL,        -- 'PERSONAL' | 'GENERAL'
                quiz_count_at_start INTEGER NOT NULL DEFAULT 1,
                chain_generation INTEGER NOT NULL DEFAULT 1,
                step INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                scheduled_at TEXT NOT NULL,
                merge_window_expires_at TEXT,    -- anchor rows only
                attempts INTEGER NOT NULL DEFAULT 0,
                sent_at TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_email_jobs_user_window
                ON email_jobs(user_uuid, merge_window_expires_at);
            CREATE INDEX IF NOT EXISTS idx_email_jobs_chain
                ON email_jobs(user_uuid, quiz_id, status);
            ",
        )
        .map_err(|e| ChainmailError::Ledger(format!("migration: {e}")))?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ChainmailError::Ledger(format!("lock poisoned: {e}")))
    }

    /// Run `f` inside one SQLite transaction. Commit on `Ok`, roll back on
    /// `Err` so no partial chain ever persists.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&LedgerTx<'_>) -> Result<T>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| ChainmailError::Ledger(format!("begin: {e}")))?;
        let scope = LedgerTx { tx };
        match f(&scope) {
            Ok(value) => {
                scope
                    .tx
                    .commit()
                    .map_err(|e| ChainmailError::Ledger(format!("commit: {e}")))?;
                Ok(value)
            }
            // Dropping the transaction rolls it back.
            Err(e) => Err(e),
        }
    }

    /// Fetch one row by id.
    pub fn get_job(&self, id: i64) -> Result<Option<EmailJob>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM email_jobs WHERE id = ?1"),
            params![id],
            job_from_row,
        )
        .optional()
        .map_err(|e| ChainmailError::Ledger(format!("get job: {e}")))
    }

    /// All rows for a user, oldest first.
    pub fn jobs_for_user(&self, user_uuid: &str) -> Result<Vec<EmailJob>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM email_jobs WHERE user_uuid = ?1 ORDER BY id"
            ))
            .map_err(|e| ChainmailError::Ledger(format!("jobs for user: {e}")))?;
        let rows = stmt
            .query_map(params![user_uuid], job_from_row)
            .map_err(|e| ChainmailError::Ledger(format!("jobs for user: {e}")))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| ChainmailError::Ledger(format!("jobs for user: {e}")))
    }

    /// Flip a pending row to sent. Returns false when the row is missing or
    /// already terminal.
    pub fn mark_sent(&self, id: i64, attempts: u32) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE email_jobs SET status = 'sent', sent_at = ?1, attempts = ?2
                 WHERE id = ?3 AND status = 'pending'",
                params![encode_ts(&Utc::now()), attempts, id],
            )
            .map_err(|e| ChainmailError::Ledger(format!("mark sent: {e}")))?;
        Ok(changed > 0)
    }

    /// Flip a pending row to failed. Returns false when the row is missing or
    /// already terminal.
    pub fn mark_failed(&self, id: i64) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE email_jobs SET status = 'failed' WHERE id = ?1 AND status = 'pending'",
                params![id],
            )
            .map_err(|e| ChainmailError::Ledger(format!("mark failed: {e}")))?;
        Ok(changed > 0)
    }

    /// Count one delivery attempt against a still-pending row.
    pub fn record_attempt(&self, id: i64) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE email_jobs SET attempts = attempts + 1
                 WHERE id = ?1 AND status = 'pending'",
                params![id],
            )
            .map_err(|e| ChainmailError::Ledger(format!("record attempt: {e}")))?;
        Ok(changed > 0)
    }
}

/// Transaction scope handed to [`JobLedger::transaction`] callbacks.
pub struct LedgerTx<'conn> {
    tx: Transaction<'conn>,
}

impl LedgerTx<'_> {
    /// The user's active merge window, if any: the most recent anchor row
    /// whose expiry lies strictly in the future. A window expiring exactly
    /// now is already closed.
    pub fn find_active_window(
        &self,
        user_uuid: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<EmailJob>> {
        self.tx
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM email_jobs
                     WHERE user_uuid = ?1
                       AND root_quiz_id IS NOT NULL
                       AND merge_window_expires_at > ?2
                     ORDER BY id DESC LIMIT 1"
                ),
                params![user_uuid, encode_ts(&now)],
                job_from_row,
            )
            .optional()
            .map_err(|e| ChainmailError::Ledger(format!("find active window: {e}")))
    }

    /// Anchor rows for the user whose window still reaches into the trailing
    /// interval starting at `window_start`.
    pub fn count_window_triggers(
        &self,
        user_uuid: &str,
        window_start: DateTime<Utc>,
    ) -> Result<i64> {
        self.tx
            .query_row(
                "SELECT COUNT(*) FROM email_jobs
                 WHERE user_uuid = ?1
                   AND root_quiz_id IS NOT NULL
                   AND merge_window_expires_at >= ?2",
                params![user_uuid, encode_ts(&window_start)],
                |row| row.get(0),
            )
            .map_err(|e| ChainmailError::Ledger(format!("count window triggers: {e}")))
    }

    /// Rewrite the pending rows of a chain to GENERAL with a refreshed
    /// trigger count, and slide the window expiry forward on the anchor row.
    /// Returns how many rows the chain rewrite touched.
    pub fn bulk_update_pending_chain(
        &self,
        user_uuid: &str,
        root_quiz_id: i64,
        quiz_count: i64,
        new_expiry: DateTime<Utc>,
    ) -> Result<usize> {
        let changed = self
            .tx
            .execute(
                "UPDATE email_jobs SET chain_type = 'GENERAL', quiz_count_at_start = ?3
                 WHERE user_uuid = ?1 AND quiz_id = ?2 AND status = 'pending'",
                params![user_uuid, root_quiz_id, quiz_count],
            )
            .map_err(|e| ChainmailError::Ledger(format!("bulk update chain: {e}")))?;
        // Only the anchor row carries the window, per the single-window invariant.
        self.tx
            .execute(
                "UPDATE email_jobs SET merge_window_expires_at = ?3
                 WHERE user_uuid = ?1 AND quiz_id = ?2
                   AND root_quiz_id IS NOT NULL AND status = 'pending'",
                params![user_uuid, root_quiz_id, encode_ts(&new_expiry)],
            )
            .map_err(|e| ChainmailError::Ledger(format!("slide window: {e}")))?;
        Ok(changed)
    }

    /// Does a pending GENERAL anchor row already exist for this pair?
    pub fn has_pending_general(&self, user_uuid: &str, root_quiz_id: i64) -> Result<bool> {
        let count: i64 = self
            .tx
            .query_row(
                "SELECT COUNT(*) FROM email_jobs
                 WHERE user_uuid = ?1 AND root_quiz_id = ?2
                   AND chain_type = 'GENERAL' AND status = 'pending'",
                params![user_uuid, root_quiz_id],
                |row| row.get(0),
            )
            .map_err(|e| ChainmailError::Ledger(format!("has pending general: {e}")))?;
        Ok(count > 0)
    }

    /// Remove the pending PERSONAL rows a promotion supersedes.
    pub fn delete_pending_personal(&self, user_uuid: &str, root_quiz_id: i64) -> Result<usize> {
        self.tx
            .execute(
                "DELETE FROM email_jobs
                 WHERE user_uuid = ?1 AND quiz_id = ?2
                   AND chain_type = 'PERSONAL' AND status = 'pending'",
                params![user_uuid, root_quiz_id],
            )
            .map_err(|e| ChainmailError::Ledger(format!("delete pending personal: {e}")))
    }

    /// Null out window expiries left on superseded rows of the chain, so a
    /// promotion's fresh anchor is the user's only live window.
    pub fn clear_merge_window(&self, user_uuid: &str, root_quiz_id: i64) -> Result<usize> {
        self.tx
            .execute(
                "UPDATE email_jobs SET merge_window_expires_at = NULL
                 WHERE user_uuid = ?1 AND quiz_id = ?2
                   AND merge_window_expires_at IS NOT NULL",
                params![user_uuid, root_quiz_id],
            )
            .map_err(|e| ChainmailError::Ledger(format!("clear merge window: {e}")))
    }

    /// Next value of the per-user materialization counter.
    pub fn next_chain_generation(&self, user_uuid: &str) -> Result<i64> {
        self.tx
            .query_row(
                "SELECT COALESCE(MAX(chain_generation), 0) + 1 FROM email_jobs
                 WHERE user_uuid = ?1",
                params![user_uuid],
                |row| row.get(0),
            )
            .map_err(|e| ChainmailError::Ledger(format!("next generation: {e}")))
    }

    /// Insert one pending row and return its id.
    pub fn insert_job(&self, job: &NewJob) -> Result<i64> {
        self.tx
            .execute(
                "INSERT INTO email_jobs
                 (user_uuid, template_id, quiz_id, root_quiz_id, chain_type,
                  quiz_count_at_start, chain_generation, step, status,
                  scheduled_at, merge_window_expires_at, attempts, sent_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9, ?10, 0, NULL, ?11)",
                params![
                    job.user_uuid,
                    job.template_id,
                    job.quiz_id,
                    job.root_quiz_id,
                    job.chain_type.as_str(),
                    job.quiz_count_at_start,
                    job.chain_generation,
                    job.step,
                    encode_ts(&job.scheduled_at),
                    job.merge_window_expires_at.as_ref().map(encode_ts),
                    encode_ts(&job.created_at),
                ],
            )
            .map_err(|e| ChainmailError::Ledger(format!("insert job: {e}")))?;
        Ok(self.tx.last_insert_rowid())
    }
}

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EmailJob> {
    let chain_type: String = row.get(5)?;
    let status: String = row.get(9)?;
    Ok(EmailJob {
        id: row.get(0)?,
        user_uuid: row.get(1)?,
        template_id: row.get(2)?,
        quiz_id: row.get(3)?,
        root_quiz_id: row.get(4)?,
        chain_type: ChainType::parse(&chain_type).unwrap_or(ChainType::Personal),
        quiz_count_at_start: row.get(6)?,
        chain_generation: row.get(7)?,
        step: row.get(8)?,
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Pending),
        scheduled_at: decode_ts(&row.get::<_, String>(10)?),
        merge_window_expires_at: row.get::<_, Option<String>>(11)?.map(|s| decode_ts(&s)),
        attempts: row.get(12)?,
        sent_at: row.get::<_, Option<String>>(13)?.map(|s| decode_ts(&s)),
        created_at: decode_ts(&row.get::<_, String>(14)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn temp_ledger(tag: &str) -> (JobLedger, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("chainmail-ledger-{tag}"));
        std::fs::remove_dir_all(&dir).ok();
        let ledger = JobLedger::open(&dir.join("ledger.db")).unwrap();
        (ledger, dir)
    }

    fn job(user: &str, quiz: i64, step: i64, anchor: bool, now: DateTime<Utc>) -> NewJob {
        NewJob {
            user_uuid: user.into(),
            template_id: 10 + step,
            quiz_id: quiz,
            root_quiz_id: anchor.then_some(quiz),
            chain_type: ChainType::Personal,
            quiz_count_at_start: 1,
            chain_generation: 1,
            step,
            scheduled_at: now + Duration::seconds(60 * step),
            merge_window_expires_at: anchor.then(|| now + Duration::minutes(5)),
            created_at: now,
        }
    }

    #[test]
    fn test_open_empty() {
        let (ledger, dir) = temp_ledger("open");
        assert!(ledger.jobs_for_user("nobody").unwrap().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_insert_and_get() {
        let (ledger, dir) = temp_ledger("insert");
        let now = Utc::now();
        let id = ledger
            .transaction(|tx| tx.insert_job(&job("u1", 7, 1, true, now)))
            .unwrap();

        let row = ledger.get_job(id).unwrap().unwrap();
        assert_eq!(row.user_uuid, "u1");
        assert_eq!(row.quiz_id, 7);
        assert_eq!(row.root_quiz_id, Some(7));
        assert_eq!(row.status, JobStatus::Pending);
        assert_eq!(row.attempts, 0);
        assert!(row.merge_window_expires_at.is_some());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_find_active_window_is_strict() {
        let (ledger, dir) = temp_ledger("window");
        let now = Utc::now();

        ledger
            .transaction(|tx| {
                let mut j = job("u1", 1, 1, true, now);
                j.merge_window_expires_at = Some(now); // expires exactly now
                tx.insert_job(&j)
            })
            .unwrap();

        // Boundary counts as expired.
        let found = ledger
            .transaction(|tx| tx.find_active_window("u1", now))
            .unwrap();
        assert!(found.is_none());

        ledger
            .transaction(|tx| tx.insert_job(&job("u1", 2, 1, true, now)))
            .unwrap();
        let found = ledger
            .transaction(|tx| tx.find_active_window("u1", now))
            .unwrap();
        assert_eq!(found.unwrap().root_quiz_id, Some(2));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_find_active_window_latest_wins() {
        let (ledger, dir) = temp_ledger("latest");
        let now = Utc::now();
        ledger
            .transaction(|tx| {
                tx.insert_job(&job("u1", 1, 1, true, now))?;
                tx.insert_job(&job("u1", 2, 1, true, now))
            })
            .unwrap();
        let found = ledger
            .transaction(|tx| tx.find_active_window("u1", now))
            .unwrap()
            .unwrap();
        assert_eq!(found.root_quiz_id, Some(2));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_bulk_update_touches_pending_only() {
        let (ledger, dir) = temp_ledger("bulk");
        let now = Utc::now();
        let (anchor_id, step2_id, sent_id) = ledger
            .transaction(|tx| {
                let anchor = tx.insert_job(&job("u1", 1, 1, true, now))?;
                let step2 = tx.insert_job(&job("u1", 1, 2, false, now))?;
                let sent = tx.insert_job(&job("u1", 1, 3, false, now))?;
                Ok((anchor, step2, sent))
            })
            .unwrap();
        assert!(ledger.mark_sent(sent_id, 1).unwrap());

        let new_expiry = now + Duration::minutes(10);
        let changed = ledger
            .transaction(|tx| tx.bulk_update_pending_chain("u1", 1, 2, new_expiry))
            .unwrap();
        assert_eq!(changed, 2);

        let anchor = ledger.get_job(anchor_id).unwrap().unwrap();
        assert_eq!(anchor.chain_type, ChainType::General);
        assert_eq!(anchor.quiz_count_at_start, 2);
        let slid = anchor.merge_window_expires_at.unwrap();
        assert!((slid - new_expiry).num_seconds().abs() < 1);

        // Non-anchor pending row: chain fields updated, no window.
        let step2 = ledger.get_job(step2_id).unwrap().unwrap();
        assert_eq!(step2.chain_type, ChainType::General);
        assert!(step2.merge_window_expires_at.is_none());

        // Terminal row untouched.
        let sent = ledger.get_job(sent_id).unwrap().unwrap();
        assert_eq!(sent.chain_type, ChainType::Personal);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_delete_pending_personal_spares_terminal() {
        let (ledger, dir) = temp_ledger("delete");
        let now = Utc::now();
        let (p1, p2, sent_id) = ledger
            .transaction(|tx| {
                let p1 = tx.insert_job(&job("u1", 1, 1, true, now))?;
                let p2 = tx.insert_job(&job("u1", 1, 2, false, now))?;
                let sent = tx.insert_job(&job("u1", 1, 3, false, now))?;
                Ok((p1, p2, sent))
            })
            .unwrap();
        assert!(ledger.mark_sent(sent_id, 1).unwrap());

        let deleted = ledger
            .transaction(|tx| tx.delete_pending_personal("u1", 1))
            .unwrap();
        assert_eq!(deleted, 2);
        assert!(ledger.get_job(p1).unwrap().is_none());
        assert!(ledger.get_job(p2).unwrap().is_none());
        assert!(ledger.get_job(sent_id).unwrap().is_some());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_terminal_states_are_immutable() {
        let (ledger, dir) = temp_ledger("terminal");
        let now = Utc::now();
        let id = ledger
            .transaction(|tx| tx.insert_job(&job("u1", 1, 1, true, now)))
            .unwrap();

        assert!(ledger.record_attempt(id).unwrap());
        assert!(ledger.mark_sent(id, 2).unwrap());

        let row = ledger.get_job(id).unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Sent);
        assert_eq!(row.attempts, 2);
        assert!(row.sent_at.is_some());

        // Already terminal: nothing may move it again.
        assert!(!ledger.mark_sent(id, 3).unwrap());
        assert!(!ledger.mark_failed(id).unwrap());
        assert!(!ledger.record_attempt(id).unwrap());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_next_chain_generation() {
        let (ledger, dir) = temp_ledger("generation");
        let now = Utc::now();
        let first = ledger
            .transaction(|tx| tx.next_chain_generation("u1"))
            .unwrap();
        assert_eq!(first, 1);

        ledger
            .transaction(|tx| {
                let mut j = job("u1", 1, 1, true, now);
                j.chain_generation = first;
                tx.insert_job(&j)
            })
            .unwrap();
        let second = ledger
            .transaction(|tx| tx.next_chain_generation("u1"))
            .unwrap();
        assert_eq!(second, 2);
        // Other users keep their own counter.
        let other = ledger
            .transaction(|tx| tx.next_chain_generation("u2"))
            .unwrap();
        assert_eq!(other, 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let (ledger, dir) = temp_ledger("rollback");
        let now = Utc::now();
        let result: Result<()> = ledger.transaction(|tx| {
            tx.insert_job(&job("u1", 1, 1, true, now))?;
            Err(ChainmailError::Ledger("forced failure".into()))
        });
        assert!(result.is_err());
        assert!(ledger.jobs_for_user("u1").unwrap().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }
}
