//! SQLite Storage Backend
//!
//! Coordination tables stored in a SQLite database file. Every process that
//! opens the same file takes part in the same elections; SQLite serializes
//! writers, which gives `conditional_update` its per-row atomicity.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tokio::sync::Mutex;

use super::{check_table_name, StorageBackend, StoredRow};
use crate::error::{Error, Result};

/// How long a writer waits on a locked database before giving up
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Storage backend backed by SQLite
pub struct SqliteBackend {
    /// Database connection
    conn: Mutex<Connection>,
    /// Database file path
    path: PathBuf,
}

impl SqliteBackend {
    /// Open (or create) the database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!("Opened {:?} (journal_mode={})", path, mode);

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn encode(row: &StoredRow) -> Result<String> {
    Ok(serde_json::to_string(&row.data)?)
}

fn decode(key: String, version: i64, data: String) -> Result<StoredRow> {
    Ok(StoredRow {
        key,
        version,
        data: serde_json::from_str(&data)?,
    })
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn create_table_if_not_exists(&self, table: &str) -> Result<()> {
        check_table_name(table)?;
        let conn = self.conn.lock().await;
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                row_key TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                data TEXT NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            "#
        ))?;
        Ok(())
    }

    async fn upsert(&self, table: &str, row: StoredRow) -> Result<()> {
        check_table_name(table)?;
        let data = encode(&row)?;
        let conn = self.conn.lock().await;
        conn.execute(
            &format!(
                r#"
                INSERT INTO {table} (row_key, version, data) VALUES (?1, ?2, ?3)
                ON CONFLICT(row_key) DO UPDATE SET
                    version = ?2,
                    data = ?3,
                    updated_at = CURRENT_TIMESTAMP
                "#
            ),
            params![row.key, row.version, data],
        )?;
        Ok(())
    }

    async fn insert(&self, table: &str, row: StoredRow) -> Result<()> {
        check_table_name(table)?;
        let data = encode(&row)?;
        let conn = self.conn.lock().await;
        let result = conn.execute(
            &format!("INSERT INTO {table} (row_key, version, data) VALUES (?1, ?2, ?3)"),
            params![row.key, row.version, data],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(Error::AlreadyExists {
                    table: table.to_string(),
                    key: row.key,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, table: &str, key: &str) -> Result<Option<StoredRow>> {
        check_table_name(table)?;
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                &format!("SELECT row_key, version, data FROM {table} WHERE row_key = ?1"),
                params![key],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?)),
            )
            .optional()?;

        raw.map(|(key, version, data)| decode(key, version, data))
            .transpose()
    }

    async fn delete(&self, table: &str, key: &str) -> Result<u64> {
        check_table_name(table)?;
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            &format!("DELETE FROM {table} WHERE row_key = ?1"),
            params![key],
        )?;
        Ok(deleted as u64)
    }

    async fn conditional_update(
        &self,
        table: &str,
        expected_version: i64,
        row: StoredRow,
    ) -> Result<u64> {
        check_table_name(table)?;
        let data = encode(&row)?;
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            &format!(
                r#"
                UPDATE {table}
                SET version = ?1, data = ?2, updated_at = CURRENT_TIMESTAMP
                WHERE row_key = ?3 AND version = ?4
                "#
            ),
            params![row.version, data, row.key, expected_version],
        )?;
        Ok(updated as u64)
    }

    async fn list(&self, table: &str) -> Result<Vec<StoredRow>> {
        check_table_name(table)?;
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT row_key, version, data FROM {table} ORDER BY row_key"
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?))
        })?;

        let mut out = Vec::new();
        for result in rows {
            let (key, version, data) = result?;
            out.push(decode(key, version, data)?);
        }

        Ok(out)
    }
}
