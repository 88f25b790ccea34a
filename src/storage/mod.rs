//! Storage Backend Contract
//!
//! The election core talks to its shared store only through
//! [`StorageBackend`]. Every table is a set of [`StoredRow`]s keyed by a
//! string, each carrying an integer version and a JSON body. The version is
//! the field conditional updates are gated on; leadership rows bump it on
//! every write.
//!
//! Backends must make [`StorageBackend::conditional_update`] atomic per row:
//! of two concurrent updates expecting the same version, at most one may
//! report a row affected. A store that can only overwrite unconditionally
//! cannot host an election.

mod memory;
mod mysql;
mod sqlite;

pub use memory::MemoryBackend;
pub use mysql::MySqlBackend;
pub use sqlite::SqliteBackend;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A single row in a coordination table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    /// Primary key
    pub key: String,
    /// Version field checked by conditional updates
    pub version: i64,
    /// Row body
    pub data: serde_json::Value,
}

impl StoredRow {
    /// Encode a serializable value into a row
    pub fn encode<T: Serialize>(key: impl Into<String>, version: i64, value: &T) -> Result<Self> {
        Ok(Self {
            key: key.into(),
            version,
            data: serde_json::to_value(value)?,
        })
    }

    /// Decode the row body
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// Narrow persistence contract consumed by the election core
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Create a table if it does not exist yet. Safe to race.
    async fn create_table_if_not_exists(&self, table: &str) -> Result<()>;

    /// Insert or replace a row by key
    async fn upsert(&self, table: &str, row: StoredRow) -> Result<()>;

    /// Insert a row, failing with `Error::AlreadyExists` if the key is taken
    async fn insert(&self, table: &str, row: StoredRow) -> Result<()>;

    /// Fetch a row by key
    async fn get(&self, table: &str, key: &str) -> Result<Option<StoredRow>>;

    /// Delete a row by key, returning how many rows were removed
    async fn delete(&self, table: &str, key: &str) -> Result<u64>;

    /// Replace `row` only if the stored version equals `expected_version`.
    /// Returns the number of rows affected (0 or 1).
    async fn conditional_update(
        &self,
        table: &str,
        expected_version: i64,
        row: StoredRow,
    ) -> Result<u64>;

    /// All rows of a table, ordered by key
    async fn list(&self, table: &str) -> Result<Vec<StoredRow>>;
}

/// Reject table names that cannot be spliced into SQL
pub(crate) fn check_table_name(table: &str) -> Result<()> {
    let valid = !table.is_empty()
        && table.len() <= 64
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !table.starts_with(|c: char| c.is_ascii_digit());

    if valid {
        Ok(())
    } else {
        Err(crate::Error::ConfigurationInvalid(format!(
            "invalid table name '{}': use ASCII letters, digits and '_'",
            table
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_check() {
        assert!(check_table_name("wolfcoord_members").is_ok());
        assert!(check_table_name("").is_err());
        assert!(check_table_name("members; DROP TABLE x").is_err());
        assert!(check_table_name("1members").is_err());
    }

    #[test]
    fn test_row_codec() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Probe {
            name: String,
        }

        let row = StoredRow::encode("k", 3, &Probe { name: "a".into() }).unwrap();
        assert_eq!(row.version, 3);
        assert_eq!(row.decode::<Probe>().unwrap(), Probe { name: "a".into() });
    }
}
