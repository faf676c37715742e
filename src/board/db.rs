use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;
use super::position;
use crate::errors::{DashboardError, DashboardResult};

/// Async-safe handle to the dashboard database.
///
/// Wraps `BoardDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, keeping synchronous SQLite
/// I/O off the async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<BoardDb>>,
}

impl DbHandle {
    pub fn new(db: BoardDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    ///
    /// Typed [`DashboardError`]s raised inside the closure come back out
    /// unchanged; anything else is reported as a database error.
    pub async fn call<F, R>(&self, f: F) -> DashboardResult<R>
    where
        F: FnOnce(&BoardDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?;
        outcome.map_err(into_dashboard_error)
    }

    /// Acquire the database mutex synchronously. For startup and tests only.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, BoardDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

fn into_dashboard_error(e: anyhow::Error) -> DashboardError {
    match e.downcast::<DashboardError>() {
        Ok(typed) => typed,
        Err(other) => DashboardError::Database(other),
    }
}

const LEAD_COLUMNS_SQL: &str =
    "id, column_id, name, phone, email, company, value, notes, position, created_at, updated_at";

const DEFAULT_COLUMN_NAME: &str = "New";
const DEFAULT_COLUMN_COLOR: &str = "#64748b";

pub struct BoardDb {
    conn: Connection,
}

impl BoardDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS lead_columns (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    color TEXT NOT NULL DEFAULT '#64748b',
                    position INTEGER NOT NULL DEFAULT 0,
                    is_default INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS leads (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id TEXT NOT NULL,
                    column_id INTEGER NOT NULL REFERENCES lead_columns(id),
                    name TEXT NOT NULL,
                    phone TEXT,
                    email TEXT,
                    company TEXT,
                    value REAL,
                    notes TEXT,
                    position REAL NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS contacts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    phone TEXT NOT NULL,
                    email TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS contact_lists (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS contact_list_members (
                    list_id INTEGER NOT NULL REFERENCES contact_lists(id) ON DELETE CASCADE,
                    contact_id INTEGER NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
                    PRIMARY KEY (list_id, contact_id)
                );

                CREATE TABLE IF NOT EXISTS conversations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id TEXT NOT NULL,
                    contact_phone TEXT NOT NULL,
                    contact_name TEXT,
                    last_message_at TEXT,
                    unread_count INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id TEXT NOT NULL,
                    conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                    direction TEXT NOT NULL,
                    body TEXT NOT NULL DEFAULT '',
                    media_url TEXT,
                    status TEXT NOT NULL DEFAULT 'pending',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS webhooks (
                    name TEXT PRIMARY KEY,
                    url TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS user_plans (
                    user_id TEXT PRIMARY KEY,
                    payload TEXT NOT NULL DEFAULT '{}'
                );

                CREATE INDEX IF NOT EXISTS idx_lead_columns_user ON lead_columns(user_id, position);
                CREATE INDEX IF NOT EXISTS idx_leads_column ON leads(column_id, position);
                CREATE INDEX IF NOT EXISTS idx_leads_user ON leads(user_id);
                CREATE INDEX IF NOT EXISTS idx_contacts_user ON contacts(user_id);
                CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations(user_id);
                CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    /// Resolve a row's owner, failing with `NotFound` or `AccessDenied`.
    fn ensure_owned(&self, table: &str, entity: &'static str, user: &Principal, id: i64) -> Result<()> {
        let owner: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT user_id FROM {} WHERE id = ?1", table),
                params![id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("Failed to look up {} owner", table))?;
        match owner {
            None => Err(DashboardError::not_found(entity, id).into()),
            Some(owner) if owner != user.user_id => Err(DashboardError::AccessDenied.into()),
            Some(_) => Ok(()),
        }
    }

    // ── Columns ───────────────────────────────────────────────────────

    /// Return the principal's default column, creating it on first use.
    pub fn ensure_default_column(&self, user: &Principal) -> Result<LeadColumn> {
        let existing = self
            .conn
            .query_row(
                "SELECT id, name, color, position, is_default FROM lead_columns
                 WHERE user_id = ?1 AND is_default = 1 ORDER BY id LIMIT 1",
                params![user.user_id],
                column_from_row,
            )
            .optional()
            .context("Failed to query default column")?;
        if let Some(column) = existing {
            return Ok(column);
        }

        self.conn
            .execute(
                "INSERT INTO lead_columns (user_id, name, color, position, is_default) VALUES (?1, ?2, ?3, 0, 1)",
                params![user.user_id, DEFAULT_COLUMN_NAME, DEFAULT_COLUMN_COLOR],
            )
            .context("Failed to insert default column")?;
        let id = self.conn.last_insert_rowid();
        tracing::info!(user = %user, column_id = id, "created default lead column");
        self.get_column(user, id)
    }

    pub fn list_columns(&self, user: &Principal) -> Result<Vec<LeadColumn>> {
        self.ensure_default_column(user)?;
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, color, position, is_default FROM lead_columns
                 WHERE user_id = ?1 ORDER BY position, id",
            )
            .context("Failed to prepare list_columns")?;
        let rows = stmt
            .query_map(params![user.user_id], column_from_row)
            .context("Failed to query columns")?;
        let mut columns = Vec::new();
        for row in rows {
            columns.push(row.context("Failed to read column row")?);
        }
        Ok(columns)
    }

    pub fn get_column(&self, user: &Principal, id: i64) -> Result<LeadColumn> {
        self.ensure_owned("lead_columns", "Column", user, id)?;
        self.conn
            .query_row(
                "SELECT id, name, color, position, is_default FROM lead_columns WHERE id = ?1",
                params![id],
                column_from_row,
            )
            .context("Failed to read column")
    }

    pub fn create_column(&self, user: &Principal, name: &str, color: &str) -> Result<LeadColumn> {
        self.ensure_default_column(user)?;
        let max_pos: i32 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(position), -1) FROM lead_columns WHERE user_id = ?1",
                params![user.user_id],
                |row| row.get(0),
            )
            .context("Failed to get max column position")?;
        self.conn
            .execute(
                "INSERT INTO lead_columns (user_id, name, color, position, is_default) VALUES (?1, ?2, ?3, ?4, 0)",
                params![user.user_id, name, color, max_pos + 1],
            )
            .context("Failed to insert column")?;
        let id = self.conn.last_insert_rowid();
        self.get_column(user, id)
    }

    pub fn update_column(
        &self,
        user: &Principal,
        id: i64,
        name: Option<&str>,
        color: Option<&str>,
        position: Option<i32>,
    ) -> Result<LeadColumn> {
        self.ensure_owned("lead_columns", "Column", user, id)?;
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        if let Some(n) = name {
            tx.execute("UPDATE lead_columns SET name = ?1 WHERE id = ?2", params![n, id])
                .context("Failed to update column name")?;
        }
        if let Some(c) = color {
            tx.execute("UPDATE lead_columns SET color = ?1 WHERE id = ?2", params![c, id])
                .context("Failed to update column color")?;
        }
        if let Some(p) = position {
            tx.execute("UPDATE lead_columns SET position = ?1 WHERE id = ?2", params![p, id])
                .context("Failed to update column position")?;
        }
        tx.commit().context("Failed to commit column update")?;
        self.get_column(user, id)
    }

    /// Delete a non-default column. Its leads move to the end of the default
    /// column, keeping their relative order. Returns the number moved.
    pub fn delete_column(&self, user: &Principal, id: i64) -> Result<usize> {
        let column = self.get_column(user, id)?;
        if column.is_default {
            return Err(DashboardError::DefaultColumnProtected.into());
        }
        let default = self.ensure_default_column(user)?;

        let orphans = self.column_leads(user, id)?;
        let mut next = self
            .column_leads(user, default.id)?
            .last()
            .map(|l| l.position + 1.0)
            .unwrap_or(0.0);

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        for lead in &orphans {
            tx.execute(
                "UPDATE leads SET column_id = ?1, position = ?2, updated_at = datetime('now') WHERE id = ?3",
                params![default.id, next, lead.id],
            )
            .context("Failed to reassign lead to default column")?;
            next += 1.0;
        }
        tx.execute("DELETE FROM lead_columns WHERE id = ?1", params![id])
            .context("Failed to delete column")?;
        tx.commit().context("Failed to commit column delete")?;
        Ok(orphans.len())
    }

    // ── Leads ─────────────────────────────────────────────────────────

    pub fn list_leads(&self, user: &Principal) -> Result<Vec<Lead>> {
        self.query_leads(
            &format!("SELECT {} FROM leads WHERE user_id = ?1", LEAD_COLUMNS_SQL),
            params![user.user_id],
        )
    }

    /// Leads of one column in board order.
    pub fn column_leads(&self, user: &Principal, column_id: i64) -> Result<Vec<Lead>> {
        self.query_leads(
            &format!(
                "SELECT {} FROM leads WHERE user_id = ?1 AND column_id = ?2",
                LEAD_COLUMNS_SQL
            ),
            params![user.user_id, column_id],
        )
    }

    fn query_leads(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Lead>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare lead query")?;
        let rows = stmt
            .query_map(params, lead_from_row)
            .context("Failed to query leads")?;
        let mut leads = Vec::new();
        for row in rows {
            leads.push(row.context("Failed to read lead row")?);
        }
        position::sort_leads(&mut leads);
        Ok(leads)
    }

    pub fn get_lead(&self, user: &Principal, id: i64) -> Result<Lead> {
        self.ensure_owned("leads", "Lead", user, id)?;
        self.conn
            .query_row(
                &format!("SELECT {} FROM leads WHERE id = ?1", LEAD_COLUMNS_SQL),
                params![id],
                lead_from_row,
            )
            .context("Failed to read lead")
    }

    /// Insert a lead at the bottom of its column (the default column when
    /// none is given).
    pub fn create_lead(&self, user: &Principal, input: &LeadInput) -> Result<Lead> {
        let name = input
            .name
            .as_deref()
            .ok_or_else(|| DashboardError::Validation("Lead name is required".into()))?;
        let column_id = match input.column_id {
            Some(id) => self.get_column(user, id)?.id,
            None => self.ensure_default_column(user)?.id,
        };
        let positions: Vec<f64> = self
            .column_leads(user, column_id)?
            .iter()
            .map(|l| l.position)
            .collect();
        let pos = position::position_for_drop(&positions, positions.len());

        self.conn
            .execute(
                "INSERT INTO leads (user_id, column_id, name, phone, email, company, value, notes, position)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    user.user_id,
                    column_id,
                    name,
                    input.phone,
                    input.email,
                    input.company,
                    input.value,
                    input.notes,
                    pos
                ],
            )
            .context("Failed to insert lead")?;
        let id = self.conn.last_insert_rowid();
        self.get_lead(user, id)
    }

    /// Edit a lead's descriptive fields. Column and position change only
    /// through [`BoardDb::move_lead`].
    pub fn update_lead(&self, user: &Principal, id: i64, input: &LeadInput) -> Result<Lead> {
        self.ensure_owned("leads", "Lead", user, id)?;
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let fields: [(&str, Option<&dyn rusqlite::ToSql>); 6] = [
            ("name", input.name.as_ref().map(|v| v as &dyn rusqlite::ToSql)),
            ("phone", input.phone.as_ref().map(|v| v as &dyn rusqlite::ToSql)),
            ("email", input.email.as_ref().map(|v| v as &dyn rusqlite::ToSql)),
            ("company", input.company.as_ref().map(|v| v as &dyn rusqlite::ToSql)),
            ("value", input.value.as_ref().map(|v| v as &dyn rusqlite::ToSql)),
            ("notes", input.notes.as_ref().map(|v| v as &dyn rusqlite::ToSql)),
        ];
        for (field, value) in fields {
            if let Some(v) = value {
                tx.execute(
                    &format!(
                        "UPDATE leads SET {} = ?1, updated_at = datetime('now') WHERE id = ?2",
                        field
                    ),
                    params![v, id],
                )
                .with_context(|| format!("Failed to update lead {}", field))?;
            }
        }
        tx.commit().context("Failed to commit lead update")?;
        self.get_lead(user, id)
    }

    /// Single atomic write of `(column_id, position)`.
    pub fn move_lead(&self, user: &Principal, id: i64, column_id: i64, position: f64) -> Result<Lead> {
        self.ensure_owned("leads", "Lead", user, id)?;
        self.ensure_owned("lead_columns", "Column", user, column_id)?;
        self.conn
            .execute(
                "UPDATE leads SET column_id = ?1, position = ?2, updated_at = datetime('now') WHERE id = ?3",
                params![column_id, position, id],
            )
            .context("Failed to move lead")?;
        self.get_lead(user, id)
    }

    /// Rewrite every key in a column to `0, 1, 2, ...` in current board order.
    pub fn renormalize_column(&self, user: &Principal, column_id: i64) -> Result<Vec<Lead>> {
        self.ensure_owned("lead_columns", "Column", user, column_id)?;
        let leads = self.column_leads(user, column_id)?;
        let keys = position::renormalized(leads.len());
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        for (lead, key) in leads.iter().zip(keys) {
            tx.execute(
                "UPDATE leads SET position = ?1 WHERE id = ?2",
                params![key, lead.id],
            )
            .context("Failed to renormalize lead position")?;
        }
        tx.commit().context("Failed to commit renormalization")?;
        tracing::debug!(column_id, count = leads.len(), "renormalized column positions");
        self.column_leads(user, column_id)
    }

    pub fn delete_lead(&self, user: &Principal, id: i64) -> Result<()> {
        self.ensure_owned("leads", "Lead", user, id)?;
        self.conn
            .execute("DELETE FROM leads WHERE id = ?1", params![id])
            .context("Failed to delete lead")?;
        Ok(())
    }

    /// Open a lead from a conversation's contact details.
    pub fn create_lead_from_conversation(
        &self,
        user: &Principal,
        conversation_id: i64,
        column_id: Option<i64>,
    ) -> Result<Lead> {
        let conversation = self.get_conversation(user, conversation_id)?;
        let name = conversation
            .contact_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| conversation.contact_phone.clone());
        self.create_lead(
            user,
            &LeadInput {
                column_id,
                name: Some(name),
                phone: Some(conversation.contact_phone),
                notes: Some(format!("Created from conversation #{}", conversation_id)),
                ..LeadInput::default()
            },
        )
    }

    /// Turn leads into contacts gathered in one new list. Leads without a
    /// phone number are skipped and counted. A repeated id counts once.
    /// All-or-nothing.
    pub fn convert_leads_to_contacts(
        &self,
        user: &Principal,
        lead_ids: &[i64],
        list_name: &str,
    ) -> Result<ConversionReport> {
        let mut seen = HashSet::new();
        let mut leads = Vec::with_capacity(lead_ids.len());
        for id in lead_ids.iter().filter(|id| seen.insert(**id)) {
            leads.push(self.get_lead(user, *id)?);
        }
        let (with_phone, without_phone): (Vec<Lead>, Vec<Lead>) = leads
            .into_iter()
            .partition(|l| l.phone.as_deref().is_some_and(|p| !p.trim().is_empty()));
        if with_phone.is_empty() {
            return Err(DashboardError::Validation(
                "None of the selected leads has a phone number".into(),
            )
            .into());
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO contact_lists (user_id, name) VALUES (?1, ?2)",
            params![user.user_id, list_name],
        )
        .context("Failed to insert contact list")?;
        let list_id = tx.last_insert_rowid();

        let mut members_created = 0;
        for lead in &with_phone {
            let phone = lead.phone.as_deref().unwrap_or_default().trim();
            tx.execute(
                "INSERT INTO contacts (user_id, name, phone, email) VALUES (?1, ?2, ?3, ?4)",
                params![user.user_id, lead.name, phone, lead.email],
            )
            .context("Failed to insert contact")?;
            let contact_id = tx.last_insert_rowid();
            members_created += tx
                .execute(
                    "INSERT INTO contact_list_members (list_id, contact_id) VALUES (?1, ?2)",
                    params![list_id, contact_id],
                )
                .context("Failed to insert list member")?;
        }
        tx.commit().context("Failed to commit lead conversion")?;

        Ok(ConversionReport {
            list: self.get_contact_list(user, list_id)?,
            contacts_created: with_phone.len(),
            members_created,
            skipped_without_phone: without_phone.len(),
        })
    }

    // ── Contacts ──────────────────────────────────────────────────────

    pub fn list_contacts(&self, user: &Principal) -> Result<Vec<Contact>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, phone, email, created_at FROM contacts WHERE user_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_contacts")?;
        let rows = stmt
            .query_map(params![user.user_id], |row| {
                Ok(Contact {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    phone: row.get(2)?,
                    email: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })
            .context("Failed to query contacts")?;
        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row.context("Failed to read contact row")?);
        }
        Ok(contacts)
    }

    pub fn delete_contact(&self, user: &Principal, id: i64) -> Result<()> {
        self.ensure_owned("contacts", "Contact", user, id)?;
        self.conn
            .execute("DELETE FROM contacts WHERE id = ?1", params![id])
            .context("Failed to delete contact")?;
        Ok(())
    }

    pub fn list_contact_lists(&self, user: &Principal) -> Result<Vec<ContactList>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, created_at FROM contact_lists WHERE user_id = ?1 ORDER BY id")
            .context("Failed to prepare list_contact_lists")?;
        let rows = stmt
            .query_map(params![user.user_id], contact_list_from_row)
            .context("Failed to query contact lists")?;
        let mut lists = Vec::new();
        for row in rows {
            lists.push(row.context("Failed to read contact list row")?);
        }
        Ok(lists)
    }

    pub fn get_contact_list(&self, user: &Principal, id: i64) -> Result<ContactList> {
        self.ensure_owned("contact_lists", "Contact list", user, id)?;
        self.conn
            .query_row(
                "SELECT id, name, created_at FROM contact_lists WHERE id = ?1",
                params![id],
                contact_list_from_row,
            )
            .context("Failed to read contact list")
    }

    pub fn list_members(&self, user: &Principal, list_id: i64) -> Result<Vec<ContactListMember>> {
        self.ensure_owned("contact_lists", "Contact list", user, list_id)?;
        let mut stmt = self
            .conn
            .prepare(
                "SELECT list_id, contact_id FROM contact_list_members WHERE list_id = ?1 ORDER BY contact_id",
            )
            .context("Failed to prepare list_members")?;
        let rows = stmt
            .query_map(params![list_id], |row| {
                Ok(ContactListMember {
                    list_id: row.get(0)?,
                    contact_id: row.get(1)?,
                })
            })
            .context("Failed to query list members")?;
        let mut members = Vec::new();
        for row in rows {
            members.push(row.context("Failed to read member row")?);
        }
        Ok(members)
    }

    // ── Conversations & messages ──────────────────────────────────────

    pub fn create_conversation(
        &self,
        user: &Principal,
        contact_phone: &str,
        contact_name: Option<&str>,
    ) -> Result<Conversation> {
        self.conn
            .execute(
                "INSERT INTO conversations (user_id, contact_phone, contact_name) VALUES (?1, ?2, ?3)",
                params![user.user_id, contact_phone, contact_name],
            )
            .context("Failed to insert conversation")?;
        let id = self.conn.last_insert_rowid();
        self.get_conversation(user, id)
    }

    pub fn list_conversations(&self, user: &Principal) -> Result<Vec<Conversation>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, contact_phone, contact_name, last_message_at, unread_count
                 FROM conversations WHERE user_id = ?1
                 ORDER BY last_message_at IS NULL, last_message_at DESC, id DESC",
            )
            .context("Failed to prepare list_conversations")?;
        let rows = stmt
            .query_map(params![user.user_id], conversation_from_row)
            .context("Failed to query conversations")?;
        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row.context("Failed to read conversation row")?);
        }
        Ok(conversations)
    }

    pub fn get_conversation(&self, user: &Principal, id: i64) -> Result<Conversation> {
        self.ensure_owned("conversations", "Conversation", user, id)?;
        self.conn
            .query_row(
                "SELECT id, contact_phone, contact_name, last_message_at, unread_count
                 FROM conversations WHERE id = ?1",
                params![id],
                conversation_from_row,
            )
            .context("Failed to read conversation")
    }

    /// Append a message and bump the conversation's activity (and unread
    /// count, for inbound messages).
    pub fn insert_message(
        &self,
        user: &Principal,
        conversation_id: i64,
        direction: MessageDirection,
        body: &str,
        media_url: Option<&str>,
        status: &str,
    ) -> Result<Message> {
        self.ensure_owned("conversations", "Conversation", user, conversation_id)?;
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO messages (user_id, conversation_id, direction, body, media_url, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![user.user_id, conversation_id, direction.as_str(), body, media_url, status],
        )
        .context("Failed to insert message")?;
        let id = tx.last_insert_rowid();
        let unread_increment = i64::from(direction == MessageDirection::Inbound);
        tx.execute(
            "UPDATE conversations SET last_message_at = datetime('now'), unread_count = unread_count + ?1 WHERE id = ?2",
            params![unread_increment, conversation_id],
        )
        .context("Failed to update conversation activity")?;
        tx.commit().context("Failed to commit message insert")?;
        self.get_message(id)
    }

    fn get_message(&self, id: i64) -> Result<Message> {
        let row = self
            .conn
            .query_row(
                "SELECT id, conversation_id, direction, body, media_url, status, created_at
                 FROM messages WHERE id = ?1",
                params![id],
                message_row_from_row,
            )
            .context("Failed to read message")?;
        row.into_message()
    }

    pub fn list_messages(&self, user: &Principal, conversation_id: i64) -> Result<Vec<Message>> {
        self.ensure_owned("conversations", "Conversation", user, conversation_id)?;
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, conversation_id, direction, body, media_url, status, created_at
                 FROM messages WHERE conversation_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_messages")?;
        let rows = stmt
            .query_map(params![conversation_id], message_row_from_row)
            .context("Failed to query messages")?;
        let mut messages = Vec::new();
        for row in rows {
            let r = row.context("Failed to read message row")?;
            messages.push(r.into_message()?);
        }
        Ok(messages)
    }

    pub fn mark_conversation_read(&self, user: &Principal, id: i64) -> Result<Conversation> {
        self.ensure_owned("conversations", "Conversation", user, id)?;
        self.conn
            .execute(
                "UPDATE conversations SET unread_count = 0 WHERE id = ?1",
                params![id],
            )
            .context("Failed to mark conversation read")?;
        self.get_conversation(user, id)
    }

    // ── Webhook registry ──────────────────────────────────────────────

    pub fn upsert_webhook(&self, name: &str, url: &str) -> Result<WebhookEndpoint> {
        self.conn
            .execute(
                "INSERT INTO webhooks (name, url) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET url = excluded.url, updated_at = datetime('now')",
                params![name, url],
            )
            .context("Failed to upsert webhook")?;
        Ok(WebhookEndpoint {
            name: name.to_string(),
            url: url.to_string(),
        })
    }

    pub fn get_webhook(&self, name: &str) -> Result<Option<WebhookEndpoint>> {
        self.conn
            .query_row(
                "SELECT name, url FROM webhooks WHERE name = ?1",
                params![name],
                |row| {
                    Ok(WebhookEndpoint {
                        name: row.get(0)?,
                        url: row.get(1)?,
                    })
                },
            )
            .optional()
            .context("Failed to query webhook")
    }

    pub fn list_webhooks(&self) -> Result<Vec<WebhookEndpoint>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, url FROM webhooks ORDER BY name")
            .context("Failed to prepare list_webhooks")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(WebhookEndpoint {
                    name: row.get(0)?,
                    url: row.get(1)?,
                })
            })
            .context("Failed to query webhooks")?;
        let mut hooks = Vec::new();
        for row in rows {
            hooks.push(row.context("Failed to read webhook row")?);
        }
        Ok(hooks)
    }

    // ── Aggregates ────────────────────────────────────────────────────

    pub fn stats(&self, user: &Principal) -> Result<DashboardStats> {
        let count = |sql: &str| -> Result<i64> {
            self.conn
                .query_row(sql, params![user.user_id], |row| row.get(0))
                .with_context(|| format!("Failed to run stats query: {}", sql))
        };
        Ok(DashboardStats {
            leads: count("SELECT COUNT(*) FROM leads WHERE user_id = ?1")?,
            contacts: count("SELECT COUNT(*) FROM contacts WHERE user_id = ?1")?,
            conversations: count("SELECT COUNT(*) FROM conversations WHERE user_id = ?1")?,
            unread_messages: count(
                "SELECT COALESCE(SUM(unread_count), 0) FROM conversations WHERE user_id = ?1",
            )?,
            messages_sent: count(
                "SELECT COUNT(*) FROM messages WHERE user_id = ?1 AND direction = 'outbound'",
            )?,
        })
    }

    pub fn set_plan_payload(&self, user: &Principal, payload: &serde_json::Value) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO user_plans (user_id, payload) VALUES (?1, ?2)
                 ON CONFLICT(user_id) DO UPDATE SET payload = excluded.payload",
                params![user.user_id, payload.to_string()],
            )
            .context("Failed to store plan payload")?;
        Ok(())
    }

    /// Plan limits with live usage. The stored payload is loosely shaped;
    /// defaults are applied once here.
    pub fn plan_usage(&self, user: &Principal) -> Result<PlanUsage> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT payload FROM user_plans WHERE user_id = ?1",
                params![user.user_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read plan payload")?;
        let value = raw
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(serde_json::Value::Null);
        let mut usage = PlanUsage::from_value(&value);
        usage.messages_used = self.stats(user)?.messages_sent;
        Ok(usage)
    }

    // ── Board view ────────────────────────────────────────────────────

    pub fn get_board(&self, user: &Principal) -> Result<BoardView> {
        let all_leads = self.list_leads(user)?;
        let columns = self
            .list_columns(user)?
            .into_iter()
            .map(|column| {
                let leads = all_leads
                    .iter()
                    .filter(|l| l.column_id == column.id)
                    .cloned()
                    .collect();
                ColumnView { column, leads }
            })
            .collect();
        Ok(BoardView { columns })
    }
}

fn column_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LeadColumn> {
    Ok(LeadColumn {
        id: row.get(0)?,
        name: row.get(1)?,
        color: row.get(2)?,
        position: row.get(3)?,
        is_default: row.get(4)?,
    })
}

fn lead_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lead> {
    Ok(Lead {
        id: row.get(0)?,
        column_id: row.get(1)?,
        name: row.get(2)?,
        phone: row.get(3)?,
        email: row.get(4)?,
        company: row.get(5)?,
        value: row.get(6)?,
        notes: row.get(7)?,
        position: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn contact_list_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContactList> {
    Ok(ContactList {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: row.get(2)?,
    })
}

fn conversation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        contact_phone: row.get(1)?,
        contact_name: row.get(2)?,
        last_message_at: row.get(3)?,
        unread_count: row.get(4)?,
    })
}

/// Intermediate row struct for messages before the direction is parsed.
struct MessageRow {
    id: i64,
    conversation_id: i64,
    direction: String,
    body: String,
    media_url: Option<String>,
    status: String,
    created_at: String,
}

fn message_row_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        direction: row.get(2)?,
        body: row.get(3)?,
        media_url: row.get(4)?,
        status: row.get(5)?,
        created_at: row.get(6)?,
    })
}

impl MessageRow {
    fn into_message(self) -> Result<Message> {
        let direction = MessageDirection::from_str(&self.direction)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Invalid direction in messages row")?;
        Ok(Message {
            id: self.id,
            conversation_id: self.conversation_id,
            direction,
            body: self.body,
            media_url: self.media_url,
            status: self.status,
            created_at: self.created_at,
        })
    }
}
