//! Leadership Record
//!
//! One row per election group naming the current leader, its term and the
//! time its lease runs out. Every write (claim, refresh, release) is a
//! conditional update gated on the row version the writer last saw, and
//! every write bumps that version. A claim built on a read that predates a
//! refresh therefore fails instead of deposing a leader that is still alive.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock;
use crate::error::{Error, Result};
use crate::storage::{StorageBackend, StoredRow};

/// Version of a freshly created leadership row
const FIRST_VERSION: i64 = 1;

/// Stored leadership for one election group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadershipRecord {
    /// Election group this record belongs to
    pub group: String,
    /// Node currently holding the lease
    pub leader_id: String,
    /// Generation counter, bumped on every successful claim
    pub term: u64,
    /// The leader must refresh before this instant to keep leadership
    pub lease_expiry: DateTime<Utc>,
    /// Row version, bumped by every write. Kept in the row's version column.
    #[serde(skip)]
    pub version: i64,
}

impl LeadershipRecord {
    /// Check if the lease has run out at `now`, allowing `skew` for clock drift
    /// between the leader and the observer
    pub fn is_expired(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        clock::add(self.lease_expiry, skew) < now
    }

    fn to_row(&self) -> Result<StoredRow> {
        StoredRow::encode(&self.group, self.version, self)
    }

    /// The record that replaces this one on the next write
    fn successor(&self, leader_id: &str, term: u64, lease_expiry: DateTime<Utc>) -> Result<Self> {
        let version = self.version.checked_add(1).ok_or_else(|| {
            Error::StorageUnavailable(format!("leadership row for {} ran out of versions", self.group))
        })?;

        Ok(Self {
            group: self.group.clone(),
            leader_id: leader_id.to_string(),
            term,
            lease_expiry,
            version,
        })
    }
}

/// Reads and conditionally writes the leadership row of one group
pub struct LeadershipTable {
    backend: Arc<dyn StorageBackend>,
    table: String,
    group: String,
}

impl LeadershipTable {
    /// Create a leadership manager for `group` stored in `table`
    pub fn new(backend: Arc<dyn StorageBackend>, table: String, group: String) -> Self {
        Self {
            backend,
            table,
            group,
        }
    }

    /// Election group name
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Read the current record, if any
    pub async fn read(&self) -> Result<Option<LeadershipRecord>> {
        match self.backend.get(&self.table, &self.group).await? {
            Some(row) => {
                let mut record: LeadershipRecord = row.decode()?;
                record.version = row.version;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Create the first record of the group at term 1. Returns `None` if
    /// another node created it first.
    pub async fn try_create(
        &self,
        leader_id: &str,
        lease_expiry: DateTime<Utc>,
    ) -> Result<Option<LeadershipRecord>> {
        let record = LeadershipRecord {
            group: self.group.clone(),
            leader_id: leader_id.to_string(),
            term: 1,
            lease_expiry,
            version: FIRST_VERSION,
        };

        match self.backend.insert(&self.table, record.to_row()?).await {
            Ok(()) => Ok(Some(record)),
            Err(Error::AlreadyExists { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Claim leadership at `observed.term + 1`. Returns the written record,
    /// or `None` if the row changed since `observed` was read.
    pub async fn claim(
        &self,
        leader_id: &str,
        observed: &LeadershipRecord,
        lease_expiry: DateTime<Utc>,
    ) -> Result<Option<LeadershipRecord>> {
        let term = observed.term.checked_add(1).ok_or_else(|| {
            Error::StorageUnavailable(format!("term of group {} cannot grow further", self.group))
        })?;
        let record = observed.successor(leader_id, term, lease_expiry)?;
        self.write_over(observed, record).await
    }

    /// Move the lease expiry of `held`, the record this node last wrote.
    /// Returns the written record, or `None` if anyone wrote the row since.
    pub async fn refresh(
        &self,
        held: &LeadershipRecord,
        lease_expiry: DateTime<Utc>,
    ) -> Result<Option<LeadershipRecord>> {
        let record = held.successor(&held.leader_id, held.term, lease_expiry)?;
        self.write_over(held, record).await
    }

    async fn write_over(
        &self,
        previous: &LeadershipRecord,
        record: LeadershipRecord,
    ) -> Result<Option<LeadershipRecord>> {
        let affected = self
            .backend
            .conditional_update(&self.table, previous.version, record.to_row()?)
            .await?;
        Ok((affected > 0).then_some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    async fn leadership() -> LeadershipTable {
        let backend = MemoryBackend::new();
        backend.create_table_if_not_exists("leadership").await.unwrap();
        LeadershipTable::new(Arc::new(backend), "leadership".into(), "scheduler".into())
    }

    #[tokio::test]
    async fn test_first_create_wins() {
        let table = leadership().await;
        let expiry = Utc::now();

        assert!(table.read().await.unwrap().is_none());
        let created = table.try_create("node-1", expiry).await.unwrap().unwrap();
        assert!(table.try_create("node-2", expiry).await.unwrap().is_none());

        let record = table.read().await.unwrap().unwrap();
        assert_eq!(record, created);
        assert_eq!(record.leader_id, "node-1");
        assert_eq!(record.term, 1);
        assert_eq!(record.version, 1);
        assert_eq!(record.group, "scheduler");
    }

    #[tokio::test]
    async fn test_claim_is_gated_on_observed_row() {
        let table = leadership().await;
        let expiry = Utc::now();
        let first = table.try_create("node-1", expiry).await.unwrap().unwrap();

        let claimed = table.claim("node-2", &first, expiry).await.unwrap().unwrap();
        assert_eq!(claimed.term, 2);
        assert_eq!(claimed.version, 2);
        assert!(table.claim("node-3", &first, expiry).await.unwrap().is_none());

        let record = table.read().await.unwrap().unwrap();
        assert_eq!(record.leader_id, "node-2");
        assert_eq!(record.term, 2);
    }

    #[tokio::test]
    async fn test_refresh_fails_after_supersede() {
        let table = leadership().await;
        let now = Utc::now();
        let held = table.try_create("node-1", now).await.unwrap().unwrap();

        let later = clock::add(now, Duration::from_secs(5));
        let held = table.refresh(&held, later).await.unwrap().unwrap();
        assert_eq!(held.term, 1);
        assert_eq!(held.version, 2);
        assert_eq!(table.read().await.unwrap().unwrap().lease_expiry, later);

        table.claim("node-2", &held, later).await.unwrap().unwrap();
        assert!(table.refresh(&held, later).await.unwrap().is_none());
        assert_eq!(table.read().await.unwrap().unwrap().leader_id, "node-2");
    }

    #[tokio::test]
    async fn test_claim_on_read_older_than_refresh_fails() {
        let table = leadership().await;
        let now = Utc::now();
        let held = table.try_create("node-1", now).await.unwrap().unwrap();

        // node-2 reads the lapsed lease, then node-1 refreshes before the claim lands
        let observed = table.read().await.unwrap().unwrap();
        let later = clock::add(now, Duration::from_secs(5));
        table.refresh(&held, later).await.unwrap().unwrap();

        assert!(table.claim("node-2", &observed, later).await.unwrap().is_none());
        let record = table.read().await.unwrap().unwrap();
        assert_eq!(record.leader_id, "node-1");
        assert_eq!(record.term, 1);
    }

    #[test]
    fn test_expiry_with_skew() {
        let now = Utc::now();
        let record = LeadershipRecord {
            group: "g".into(),
            leader_id: "node-1".into(),
            term: 1,
            lease_expiry: now,
            version: 1,
        };

        let just_after = clock::add(now, Duration::from_millis(100));
        assert!(record.is_expired(just_after, Duration::ZERO));
        assert!(!record.is_expired(just_after, Duration::from_millis(500)));
        assert!(!record.is_expired(now, Duration::ZERO));
    }
}
