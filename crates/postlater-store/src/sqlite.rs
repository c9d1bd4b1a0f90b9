//! SQLite-backed credential and message store.
//!
//! One connection behind a mutex. Each trait call holds the lock for its whole
//! read-modify-write, so per-key credential updates and the status
//! compare-and-set are atomic with respect to each other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use postlater_core::error::{PostlaterError, Result};
use postlater_core::traits::{CredentialStore, MessageStore};
use postlater_core::types::{
    CredentialKey, CredentialPatch, CredentialRecord, MessagePatch, MessageStatus,
    ScheduledMessage,
};

const MESSAGE_COLUMNS: &str = "id, workspace_id, user_id, channel_id, channel_name, content, \
     scheduled_for, timezone, status, created_at, sent_at, error_message";

const CREDENTIAL_COLUMNS: &str =
    "workspace_id, user_id, access_token, refresh_token, expires_at, created_at, updated_at";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database file and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        tracing::debug!("opened message database at {}", path.display());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS credentials (
                workspace_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                access_token TEXT NOT NULL,
                refresh_token TEXT,
                expires_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (workspace_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS scheduled_messages (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                channel_name TEXT,
                content TEXT NOT NULL,
                scheduled_for TEXT NOT NULL,   -- RFC 3339 UTC, sorts lexically
                timezone TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                sent_at TEXT,
                error_message TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_messages_due
                ON scheduled_messages (status, scheduled_for);
            CREATE INDEX IF NOT EXISTS idx_messages_owner
                ON scheduled_messages (workspace_id, user_id);
            ",
            )
            .map_err(db_err)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| PostlaterError::Store(format!("connection lock poisoned: {e}")))
    }

    fn fetch_credential(conn: &Connection, key: &CredentialKey) -> Result<Option<CredentialRecord>> {
        conn.query_row(
            &format!("SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE workspace_id = ?1 AND user_id = ?2"),
            params![key.workspace_id, key.user_id],
            credential_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    /// Write the record and return it as stored.
    fn write_credential(conn: &Connection, record: &CredentialRecord) -> Result<CredentialRecord> {
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO credentials ({CREDENTIAL_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            ),
            params![
                record.workspace_id,
                record.user_id,
                record.access_token,
                record.refresh_token,
                record.expires_at.map(|t| ts(&t)),
                ts(&record.created_at),
                ts(&record.updated_at),
            ],
        )
        .map_err(db_err)?;
        Self::fetch_credential(conn, &record.key())?.ok_or_else(|| {
            PostlaterError::Store(format!("credential for {} missing after write", record.key()))
        })
    }

    fn fetch_message(conn: &Connection, id: &str) -> Result<Option<ScheduledMessage>> {
        conn.query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM scheduled_messages WHERE id = ?1"),
            params![id],
            message_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    /// Apply `patch` to one row, optionally guarded by the current status.
    /// Returns the number of rows touched.
    fn patch_message(
        conn: &Connection,
        id: &str,
        expected: Option<MessageStatus>,
        patch: MessagePatch,
    ) -> Result<usize> {
        conn.execute(
            "UPDATE scheduled_messages SET
                status = COALESCE(?2, status),
                channel_name = COALESCE(?3, channel_name),
                sent_at = COALESCE(?4, sent_at),
                error_message = COALESCE(?5, error_message)
             WHERE id = ?1 AND (?6 IS NULL OR status = ?6)",
            params![
                id,
                patch.status.map(MessageStatus::as_str),
                patch.channel_name,
                patch.sent_at.map(|t| ts(&t)),
                patch.error_message,
                expected.map(MessageStatus::as_str),
            ],
        )
        .map_err(db_err)
    }

    fn query_messages(
        conn: &Connection,
        where_clause: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<ScheduledMessage>> {
        let mut stmt = conn
            .prepare(&format!("SELECT {MESSAGE_COLUMNS} FROM scheduled_messages {where_clause}"))
            .map_err(db_err)?;
        let rows = stmt.query_map(args, message_from_row).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}

#[async_trait]
impl CredentialStore for SqliteStore {
    async fn get(&self, key: &CredentialKey) -> Result<Option<CredentialRecord>> {
        let conn = self.lock()?;
        Self::fetch_credential(&conn, key)
    }

    async fn create(&self, record: CredentialRecord) -> Result<CredentialRecord> {
        let conn = self.lock()?;
        if Self::fetch_credential(&conn, &record.key())?.is_some() {
            return Err(PostlaterError::Store(format!(
                "credential for {} already exists",
                record.key()
            )));
        }
        Self::write_credential(&conn, &record)
    }

    async fn upsert(&self, mut record: CredentialRecord) -> Result<CredentialRecord> {
        let conn = self.lock()?;
        if let Some(existing) = Self::fetch_credential(&conn, &record.key())? {
            record.created_at = existing.created_at;
        }
        Self::write_credential(&conn, &record)
    }

    async fn update(
        &self,
        key: &CredentialKey,
        patch: CredentialPatch,
    ) -> Result<Option<CredentialRecord>> {
        let conn = self.lock()?;
        let Some(mut record) = Self::fetch_credential(&conn, key)? else {
            return Ok(None);
        };
        patch.apply(&mut record, Utc::now());
        Self::write_credential(&conn, &record).map(Some)
    }

    async fn delete(&self, key: &CredentialKey) -> Result<bool> {
        let conn = self.lock()?;
        let removed = conn
            .execute(
                "DELETE FROM credentials WHERE workspace_id = ?1 AND user_id = ?2",
                params![key.workspace_id, key.user_id],
            )
            .map_err(db_err)?;
        Ok(removed > 0)
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn get(&self, id: &str) -> Result<Option<ScheduledMessage>> {
        let conn = self.lock()?;
        Self::fetch_message(&conn, id)
    }

    async fn create(&self, message: ScheduledMessage) -> Result<ScheduledMessage> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO scheduled_messages ({MESSAGE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                message.id,
                message.workspace_id,
                message.user_id,
                message.channel_id,
                message.channel_name,
                message.content,
                ts(&message.scheduled_for),
                message.timezone,
                message.status.as_str(),
                ts(&message.created_at),
                message.sent_at.map(|t| ts(&t)),
                message.error_message,
            ],
        )
        .map_err(db_err)?;
        Self::fetch_message(&conn, &message.id)?
            .ok_or_else(|| PostlaterError::Store(format!("message {} missing after insert", message.id)))
    }

    async fn update(&self, id: &str, patch: MessagePatch) -> Result<Option<ScheduledMessage>> {
        let conn = self.lock()?;
        if Self::patch_message(&conn, id, None, patch)? == 0 {
            return Ok(None);
        }
        Self::fetch_message(&conn, id)
    }

    async fn update_if_status(
        &self,
        id: &str,
        expected: MessageStatus,
        patch: MessagePatch,
    ) -> Result<Option<ScheduledMessage>> {
        let conn = self.lock()?;
        if Self::patch_message(&conn, id, Some(expected), patch)? == 0 {
            return Ok(None);
        }
        Self::fetch_message(&conn, id)
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledMessage>> {
        let conn = self.lock()?;
        Self::query_messages(
            &conn,
            "WHERE status = 'pending' AND scheduled_for <= ?1 ORDER BY scheduled_for",
            params![ts(&now)],
        )
    }

    async fn list_by_owner(&self, owner: &CredentialKey) -> Result<Vec<ScheduledMessage>> {
        let conn = self.lock()?;
        Self::query_messages(
            &conn,
            "WHERE workspace_id = ?1 AND user_id = ?2 ORDER BY scheduled_for DESC",
            params![owner.workspace_id, owner.user_id],
        )
    }
}

// ─── Row mapping ──────────────────────────────────────

/// Fixed-width RFC 3339 so string comparison in SQL matches instant order.
fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, s)).transpose()
}

fn credential_from_row(row: &Row<'_>) -> rusqlite::Result<CredentialRecord> {
    Ok(CredentialRecord {
        workspace_id: row.get(0)?,
        user_id: row.get(1)?,
        access_token: row.get(2)?,
        refresh_token: row.get(3)?,
        expires_at: parse_opt_ts(4, row.get(4)?)?,
        created_at: parse_ts(5, row.get(5)?)?,
        updated_at: parse_ts(6, row.get(6)?)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduledMessage> {
    let status: String = row.get(8)?;
    let status = status.parse::<MessageStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(ScheduledMessage {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        user_id: row.get(2)?,
        channel_id: row.get(3)?,
        channel_name: row.get(4)?,
        content: row.get(5)?,
        scheduled_for: parse_ts(6, row.get(6)?)?,
        timezone: row.get(7)?,
        status,
        created_at: parse_ts(9, row.get(9)?)?,
        sent_at: parse_opt_ts(10, row.get(10)?)?,
        error_message: row.get(11)?,
    })
}

fn db_err(e: rusqlite::Error) -> PostlaterError {
    PostlaterError::Store(e.to_string())
}
