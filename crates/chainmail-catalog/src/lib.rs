//! # Chainmail Catalog
//!
//! Lookup store for email templates. The scheduler and delivery processor
//! only read from it: `quiz_id`-scoped templates make up PERSONAL chains,
//! templates with no trigger affinity (`quiz_id` NULL) make up GENERAL
//! chains for a geography. Writes exist for seeding.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use chainmail_core::error::{ChainmailError, Result};

/// One email template.
#[derive(Debug, Clone, Serialize)]
pub struct Template {
    pub id: i64,
    /// None means general/shared; Some ties the template to one trigger.
    pub quiz_id: Option<i64>,
    pub geo: String,
    /// Ordinal position within its chain, ascending.
    pub step: i64,
    pub subject: String,
    pub html: String,
}

/// Fields for seeding a template.
#[derive(Debug, Clone)]
pub struct NewTemplate {
    pub quiz_id: Option<i64>,
    pub geo: String,
    pub step: i64,
    pub subject: String,
    pub html: String,
}

const TEMPLATE_COLUMNS: &str = "id, quiz_id, geo, step, subject, html";

/// Template catalog store.
pub struct TemplateCatalog {
    conn: Mutex<Connection>,
}

impl TemplateCatalog {
    /// Open or create the catalog database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| ChainmailError::Catalog(format!("open: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();

        let catalog = Self {
            conn: Mutex::new(conn),
        };
        catalog.migrate()?;
        Ok(catalog)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS email_templates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                quiz_id INTEGER,                 -- NULL = general/shared
                geo TEXT NOT NULL,
                step INTEGER NOT NULL,
                subject TEXT NOT NULL,
                html TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_email_templates_lookup
                ON email_templates(geo, quiz_id, step);
            ",
        )
        .map_err(|e| ChainmailError::Catalog(format!("migration: {e}")))?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ChainmailError::Catalog(format!("lock poisoned: {e}")))
    }

    /// Templates tied to one trigger for a geography, step ascending.
    pub fn find_personal(&self, trigger_id: i64, geo: &str) -> Result<Vec<Template>> {
        self.query(
            &format!(
                "SELECT {TEMPLATE_COLUMNS} FROM email_templates
                 WHERE quiz_id = ?1 AND geo = ?2 ORDER BY step ASC"
            ),
            params![trigger_id, geo],
        )
    }

    /// Shared templates for a geography, step ascending.
    pub fn find_general(&self, geo: &str) -> Result<Vec<Template>> {
        self.query(
            &format!(
                "SELECT {TEMPLATE_COLUMNS} FROM email_templates
                 WHERE quiz_id IS NULL AND geo = ?1 ORDER BY step ASC"
            ),
            params![geo],
        )
    }

    /// Fetch one template by id.
    pub fn find_by_id(&self, id: i64) -> Result<Option<Template>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {TEMPLATE_COLUMNS} FROM email_templates WHERE id = ?1"),
            params![id],
            template_from_row,
        )
        .optional()
        .map_err(|e| ChainmailError::Catalog(format!("find by id: {e}")))
    }

    /// Insert one template and return its id.
    pub fn insert(&self, template: &NewTemplate) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO email_templates (quiz_id, geo, step, subject, html)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                template.quiz_id,
                template.geo,
                template.step,
                template.subject,
                template.html,
            ],
        )
        .map_err(|e| ChainmailError::Catalog(format!("insert: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Template>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| ChainmailError::Catalog(format!("query: {e}")))?;
        let rows = stmt
            .query_map(params, template_from_row)
            .map_err(|e| ChainmailError::Catalog(format!("query: {e}")))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| ChainmailError::Catalog(format!("query: {e}")))
    }
}

fn template_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Template> {
    Ok(Template {
        id: row.get(0)?,
        quiz_id: row.get(1)?,
        geo: row.get(2)?,
        step: row.get(3)?,
        subject: row.get(4)?,
        html: row.get(5)?,
    })
}
