//! WolfCoord - Lease-Based Leader Election and Cluster Membership
//!
//! Coordination primitives for services that share a persistent store but
//! no consensus service. Nodes keep heartbeat rows in a membership table and
//! compete for a single leadership row per election group; every write to
//! that row is a conditional update on its term, so exactly one candidate
//! wins each term.
//!
//! # Architecture
//!
//! - [`storage`]: the narrow backend contract (`StorageBackend`) plus
//!   in-memory, SQLite and MySQL implementations
//! - [`state`]: membership table, leadership record and the
//!   [`LeaderElection`] handle with its heartbeat and monitor loops
//! - [`clock`]: wall-clock source used for leases and heartbeats
//!
//! # Guarantees
//!
//! A crashed leader can overlap with its successor for at most the lease TTL
//! plus the configured clock skew. Nodes default to follower whenever their
//! leadership is in doubt.

pub mod clock;
pub mod config;
pub mod error;
pub mod state;
pub mod storage;

pub use config::WolfCoordConfig;
pub use error::{Error, Result};
pub use state::{ElectionConfig, ElectionOutcome, ElectionState, LeaderElection, LeaderStatus};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::WolfCoordConfig;
    pub use crate::error::{Error, Result};
    pub use crate::state::{
        ElectionConfig, ElectionOutcome, ElectionState, LeaderElection, LeaderInfo, LeaderStatus,
        LeadershipRecord, Member, MonitorAction, MonitorReport,
    };
    pub use crate::storage::{MemoryBackend, MySqlBackend, SqliteBackend, StorageBackend, StoredRow};
}
