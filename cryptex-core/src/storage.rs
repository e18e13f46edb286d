//! Local durable storage for vault metadata.
//!
//! Every save replaces the whole record, blob included, inside one
//! transaction, so a record is either the old version or the new one.

use crate::crypto::EncryptedBlob;
use crate::vault::VaultMetadata;
use crate::{CryptexError, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Persistence for [`VaultMetadata`] records.
pub trait VaultStore: Send + Sync {
    /// Insert or fully replace a record.
    fn save(&self, metadata: &VaultMetadata) -> Result<()>;

    fn load_all(&self) -> Result<Vec<VaultMetadata>>;

    fn load(&self, id: Uuid) -> Result<Option<VaultMetadata>>;

    /// Returns whether a record was removed.
    fn delete(&self, id: Uuid) -> Result<bool>;

    /// Look a record up by exact id or case-insensitive name.
    fn find(&self, key: &str) -> Result<Option<VaultMetadata>> {
        if let Ok(id) = Uuid::parse_str(key) {
            if let Some(found) = self.load(id)? {
                return Ok(Some(found));
            }
        }
        Ok(self
            .load_all()?
            .into_iter()
            .find(|m| m.name.eq_ignore_ascii_case(key)))
    }
}

/// SQLite-backed [`VaultStore`].
pub struct SqliteVaultStore {
    conn: Mutex<Connection>,
}

impl SqliteVaultStore {
    /// Open (and create if needed) a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Create a new in-memory store for testing
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS vaults (
                id TEXT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                last_used INTEGER NOT NULL,
                blob TEXT
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CryptexError::Storage("vault store lock poisoned".to_string()))
    }
}

impl VaultStore for SqliteVaultStore {
    fn save(&self, metadata: &VaultMetadata) -> Result<()> {
        let blob = metadata
            .blob
            .as_ref()
            .map(|b| b.to_json())
            .transpose()?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO vaults (id, name, description, created_at, last_used, blob)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                created_at = excluded.created_at,
                last_used = excluded.last_used,
                blob = excluded.blob",
            params![
                metadata.id.to_string(),
                metadata.name,
                metadata.description,
                metadata.created_at.timestamp_millis(),
                metadata.last_used.timestamp_millis(),
                blob,
            ],
        )?;
        tx.commit()?;

        debug!(vault = %metadata.id, name = %metadata.name, "Saved vault");
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<VaultMetadata>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, description, created_at, last_used, blob
             FROM vaults ORDER BY created_at, name",
        )?;
        let rows = stmt.query_map([], read_row)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    fn load(&self, id: Uuid) -> Result<Option<VaultMetadata>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, name, description, created_at, last_used, blob
                 FROM vaults WHERE id = ?1",
                params![id.to_string()],
                read_row,
            )
            .optional()?;
        row.transpose()
    }

    fn delete(&self, id: Uuid) -> Result<bool> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM vaults WHERE id = ?1", params![id.to_string()])?;
        if removed > 0 {
            debug!(vault = %id, "Deleted vault");
        }
        Ok(removed > 0)
    }
}

type RawRow = (String, String, String, i64, i64, Option<String>);

fn read_row(row: &Row<'_>) -> rusqlite::Result<Result<VaultMetadata>> {
    let raw: RawRow = (
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    );
    Ok(decode_row(raw))
}

fn decode_row(
    (id, name, description, created_at, last_used, blob): RawRow,
) -> Result<VaultMetadata> {
    let id = Uuid::parse_str(&id)
        .map_err(|e| CryptexError::Storage(format!("Invalid vault id '{}': {}", id, e)))?;
    let blob = blob
        .map(|json| EncryptedBlob::from_json(&json))
        .transpose()?;

    Ok(VaultMetadata {
        id,
        name,
        description,
        created_at: from_millis(created_at)?,
        last_used: from_millis(last_used)?,
        blob,
    })
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| CryptexError::Storage(format!("Invalid timestamp {}", millis)))
}
