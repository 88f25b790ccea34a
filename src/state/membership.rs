//! Cluster Membership Management
//!
//! Each participating node keeps one row in the membership table and
//! refreshes its heartbeat timestamp on every tick. Rows that stop being
//! refreshed go stale and any node may prune them.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{self, Clock};
use crate::error::Result;
use crate::storage::{StorageBackend, StoredRow};

/// Membership rows are never conditionally updated
const MEMBER_ROW_VERSION: i64 = 0;

/// A node participating in an election group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Unique node identifier
    pub id: String,
    /// Last heartbeat time
    pub last_heartbeat: DateTime<Utc>,
    /// Address advertised by the node (host:port)
    #[serde(default)]
    pub address: Option<String>,
    /// When the node's process joined the group
    pub joined_at: DateTime<Utc>,
}

impl Member {
    /// Create a member row for a node seen at `now`
    pub fn new(id: String, address: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            last_heartbeat: now,
            address,
            joined_at: now,
        }
    }

    /// Check if the heartbeat is older than `threshold` at `now`
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.last_heartbeat < clock::sub(now, threshold)
    }

    /// Time since last heartbeat (zero if the heartbeat is in the future)
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Manages the membership and leadership tables for one node
pub struct MembershipTable {
    /// Shared store
    backend: Arc<dyn StorageBackend>,
    /// Time source
    clock: Arc<dyn Clock>,
    /// Membership table name
    table: String,
    /// Leadership table name (created alongside)
    leadership_table: String,
    /// This node's ID
    node_id: String,
    /// This node's address
    address: Option<String>,
    /// Join time reported in this process's member row
    joined_at: DateTime<Utc>,
}

impl MembershipTable {
    /// Create a membership manager
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
        table: String,
        leadership_table: String,
        node_id: String,
        address: Option<String>,
    ) -> Self {
        let joined_at = clock.now();
        Self {
            backend,
            clock,
            table,
            leadership_table,
            node_id,
            address,
            joined_at,
        }
    }

    /// Get this node's ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Ensure the membership and leadership tables exist
    pub async fn create_leadership_table(&self) -> Result<()> {
        self.backend.create_table_if_not_exists(&self.table).await?;
        self.backend
            .create_table_if_not_exists(&self.leadership_table)
            .await?;
        tracing::debug!(
            "Coordination tables ready: {}, {}",
            self.table,
            self.leadership_table
        );
        Ok(())
    }

    /// Write this node's row with a fresh heartbeat
    pub async fn update_membership_table(&self) -> Result<Member> {
        let member = Member {
            id: self.node_id.clone(),
            last_heartbeat: self.clock.now(),
            address: self.address.clone(),
            joined_at: self.joined_at,
        };

        let row = StoredRow::encode(&member.id, MEMBER_ROW_VERSION, &member)?;
        self.backend.upsert(&self.table, row).await?;
        tracing::trace!("Heartbeat recorded for {}", member.id);
        Ok(member)
    }

    /// Remove a member row. Removing an absent member is not an error.
    pub async fn remove_member(&self, member_id: &str) -> Result<bool> {
        let removed = self.backend.delete(&self.table, member_id).await? > 0;
        if removed {
            tracing::info!("Removed member {}", member_id);
        }
        Ok(removed)
    }

    /// Get a single member row
    pub async fn get_member(&self, member_id: &str) -> Result<Option<Member>> {
        match self.backend.get(&self.table, member_id).await? {
            Some(row) => Ok(Some(row.decode()?)),
            None => Ok(None),
        }
    }

    /// All member rows ordered by ID, stale ones included
    pub async fn members(&self) -> Result<Vec<Member>> {
        let rows = self.backend.list(&self.table).await?;
        let mut members = rows
            .iter()
            .map(StoredRow::decode::<Member>)
            .collect::<Result<Vec<_>>>()?;
        members.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(members)
    }

    /// Peers whose heartbeat is older than `threshold`. Never includes self.
    pub async fn stale_members(&self, threshold: Duration) -> Result<Vec<Member>> {
        let now = self.clock.now();
        Ok(self
            .members()
            .await?
            .into_iter()
            .filter(|m| m.id != self.node_id && m.is_stale(now, threshold))
            .collect())
    }
}
