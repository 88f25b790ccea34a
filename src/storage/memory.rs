//! In-process storage backend.
//!
//! Rows live in a `BTreeMap` per table behind one `RwLock`, so every
//! operation is atomic with respect to every other. Clones share state,
//! which lets several election handles in one process (or one test) race
//! against the same tables.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{StorageBackend, StoredRow};
use crate::error::{Error, Result};

type Tables = HashMap<String, BTreeMap<String, StoredRow>>;

/// Shared in-memory backend
#[derive(Clone, Default)]
pub struct MemoryBackend {
    tables: Arc<RwLock<Tables>>,
    /// When set, every call fails as if the store were unreachable
    offline: Arc<AtomicBool>,
}

impl MemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store going away (or coming back)
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::StorageUnavailable("memory backend is offline".into()));
        }
        Ok(())
    }
}

fn missing_table(table: &str) -> Error {
    Error::StorageUnavailable(format!("table {} does not exist", table))
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn create_table_if_not_exists(&self, table: &str) -> Result<()> {
        self.check_online()?;
        self.tables
            .write()
            .await
            .entry(table.to_string())
            .or_default();
        Ok(())
    }

    async fn upsert(&self, table: &str, row: StoredRow) -> Result<()> {
        self.check_online()?;
        let mut tables = self.tables.write().await;
        let rows = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        rows.insert(row.key.clone(), row);
        Ok(())
    }

    async fn insert(&self, table: &str, row: StoredRow) -> Result<()> {
        self.check_online()?;
        let mut tables = self.tables.write().await;
        let rows = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        if rows.contains_key(&row.key) {
            return Err(Error::AlreadyExists {
                table: table.to_string(),
                key: row.key,
            });
        }
        rows.insert(row.key.clone(), row);
        Ok(())
    }

    async fn get(&self, table: &str, key: &str) -> Result<Option<StoredRow>> {
        self.check_online()?;
        let tables = self.tables.read().await;
        let rows = tables.get(table).ok_or_else(|| missing_table(table))?;
        Ok(rows.get(key).cloned())
    }

    async fn delete(&self, table: &str, key: &str) -> Result<u64> {
        self.check_online()?;
        let mut tables = self.tables.write().await;
        let rows = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        Ok(rows.remove(key).map_or(0, |_| 1))
    }

    async fn conditional_update(
        &self,
        table: &str,
        expected_version: i64,
        row: StoredRow,
    ) -> Result<u64> {
        self.check_online()?;
        let mut tables = self.tables.write().await;
        let rows = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        match rows.get_mut(&row.key) {
            Some(current) if current.version == expected_version => {
                *current = row;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn list(&self, table: &str) -> Result<Vec<StoredRow>> {
        self.check_online()?;
        let tables = self.tables.read().await;
        let rows = tables.get(table).ok_or_else(|| missing_table(table))?;
        Ok(rows.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(key: &str, version: i64) -> StoredRow {
        StoredRow {
            key: key.to_string(),
            version,
            data: json!({ "v": version }),
        }
    }

    #[tokio::test]
    async fn test_conditional_update_checks_version() {
        let backend = MemoryBackend::new();
        backend.create_table_if_not_exists("leadership").await.unwrap();
        backend.insert("leadership", row("group", 1)).await.unwrap();

        assert_eq!(backend.conditional_update("leadership", 7, row("group", 8)).await.unwrap(), 0);
        assert_eq!(backend.conditional_update("leadership", 1, row("group", 2)).await.unwrap(), 1);
        assert_eq!(backend.conditional_update("leadership", 1, row("group", 2)).await.unwrap(), 0);

        let stored = backend.get("leadership", "group").await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn test_conditional_update_on_missing_row() {
        let backend = MemoryBackend::new();
        backend.create_table_if_not_exists("leadership").await.unwrap();
        assert_eq!(backend.conditional_update("leadership", 0, row("group", 1)).await.unwrap(), 0);
        assert!(backend.get("leadership", "group").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_conflict_and_idempotent_delete() {
        let backend = MemoryBackend::new();
        backend.create_table_if_not_exists("t").await.unwrap();
        backend.create_table_if_not_exists("t").await.unwrap();

        backend.insert("t", row("a", 1)).await.unwrap();
        let err = backend.insert("t", row("a", 2)).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));

        assert_eq!(backend.delete("t", "a").await.unwrap(), 1);
        assert_eq!(backend.delete("t", "a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_offline_backend_fails() {
        let backend = MemoryBackend::new();
        backend.create_table_if_not_exists("t").await.unwrap();
        backend.set_offline(true);

        let err = backend.list("t").await.unwrap_err();
        assert!(err.is_retryable());

        backend.set_offline(false);
        assert!(backend.list("t").await.unwrap().is_empty());
    }
}
