//! Leader Election
//!
//! Lease-based leader election over a shared store. The leadership row is
//! only ever written through conditional updates gated on the row version
//! the writer last read or wrote, so of several candidates racing for the
//! same term exactly one wins, and a superseded leader can never overwrite
//! its successor.
//!
//! A node is leader only while its cached won term matches the stored term
//! and its local view of the lease has not run out. Whenever that is in
//! doubt the node reports itself as a follower.

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::{self, Clock, SystemClock};
use crate::error::{Error, Result};
use crate::state::leadership::{LeadershipRecord, LeadershipTable};
use crate::state::membership::{Member, MembershipTable};
use crate::storage::{check_table_name, StorageBackend};

/// Election state of the local node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionState {
    /// Constructed, initial election not yet run
    Initializing,
    /// Another node holds the lease
    Follower,
    /// This node holds the lease
    Leader,
    /// Stopped; no longer participating
    Stopped,
}

impl fmt::Display for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElectionState::Initializing => write!(f, "INITIALIZING"),
            ElectionState::Follower => write!(f, "FOLLOWER"),
            ElectionState::Leader => write!(f, "LEADER"),
            ElectionState::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Election configuration
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// This node's ID
    pub node_id: String,
    /// Advertised address stored in the member row
    pub address: Option<String>,
    /// Election group; the key of the leadership row
    pub group: String,
    /// Table holding member heartbeat rows
    pub membership_table: String,
    /// Table holding leadership rows
    pub leadership_table: String,
    /// How often the member row (and the lease, when leader) is refreshed
    pub heartbeat_interval: Duration,
    /// How often the leadership record is checked for expiry
    pub monitor_interval: Duration,
    /// Lease duration granted by each claim or refresh
    pub lease_ttl: Duration,
    /// A member row is stale after this many heartbeat intervals
    pub stale_after_multiple: u32,
    /// Largest clock difference tolerated between nodes
    pub max_clock_skew: Duration,
}

impl ElectionConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(Error::ConfigurationInvalid("node_id cannot be empty".into()));
        }

        if self.group.is_empty() {
            return Err(Error::ConfigurationInvalid("group cannot be empty".into()));
        }

        check_table_name(&self.membership_table)?;
        check_table_name(&self.leadership_table)?;
        if self.membership_table == self.leadership_table {
            return Err(Error::ConfigurationInvalid(
                "membership_table and leadership_table must differ".into(),
            ));
        }

        if self.heartbeat_interval.is_zero() || self.monitor_interval.is_zero() {
            return Err(Error::ConfigurationInvalid(
                "heartbeat_interval and monitor_interval must be non-zero".into(),
            ));
        }

        if self.lease_ttl <= self.heartbeat_interval {
            return Err(Error::ConfigurationInvalid(format!(
                "lease_ttl ({:?}) must be longer than heartbeat_interval ({:?})",
                self.lease_ttl, self.heartbeat_interval
            )));
        }

        if self.max_clock_skew >= self.lease_ttl {
            return Err(Error::ConfigurationInvalid(format!(
                "max_clock_skew ({:?}) must be shorter than lease_ttl ({:?})",
                self.max_clock_skew, self.lease_ttl
            )));
        }

        if self.stale_after_multiple == 0 {
            return Err(Error::ConfigurationInvalid(
                "stale_after_multiple must be at least 1".into(),
            ));
        }

        if self.lease_ttl < self.heartbeat_interval * 3 {
            tracing::warn!(
                "lease_ttl {:?} is less than 3x heartbeat_interval {:?}; a couple of slow ticks may cost leadership",
                self.lease_ttl,
                self.heartbeat_interval
            );
        }

        Ok(())
    }

    /// Heartbeat age after which a member row may be pruned
    pub fn stale_threshold(&self) -> Duration {
        self.heartbeat_interval * self.stale_after_multiple
    }
}

/// Local view of leadership, published to subscribers on every change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderStatus {
    /// Current state
    pub state: ElectionState,
    /// Term won by this node (only while leader)
    pub term: Option<u64>,
    /// Last known leader
    pub leader_id: Option<String>,
    /// Local deadline after which this node stops trusting its lease
    pub lease_deadline: Option<DateTime<Utc>>,
    /// Leadership row as this node last wrote it (only while leader)
    #[serde(skip)]
    lease: Option<LeadershipRecord>,
}

impl LeaderStatus {
    fn initializing() -> Self {
        Self {
            state: ElectionState::Initializing,
            term: None,
            leader_id: None,
            lease_deadline: None,
            lease: None,
        }
    }
}

/// Result of one election attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// This node holds the lease for `term`
    Leader { term: u64 },
    /// Another node holds (or just won) the lease
    Follower {
        leader_id: Option<String>,
        term: Option<u64>,
    },
}

impl ElectionOutcome {
    /// Check if the attempt left this node as leader
    pub fn is_leader(&self) -> bool {
        matches!(self, ElectionOutcome::Leader { .. })
    }
}

/// The current leader resolved to its member row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderInfo {
    /// Stored leadership record
    pub record: LeadershipRecord,
    /// The leader's member row
    pub member: Member,
}

/// What a monitor tick found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorAction {
    /// Lease valid and the leader's member row exists
    Healthy,
    /// Lease valid but the leader has no member row; takeover waits for expiry
    StaleReference(String),
    /// Record missing or lease expired; an election was run
    Elected(ElectionOutcome),
}

/// Report of one monitor tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorReport {
    /// Member rows removed as stale
    pub pruned: Vec<String>,
    /// Leadership check result
    pub action: MonitorAction,
}

/// Per-process election handle
pub struct LeaderElection {
    /// Election configuration
    pub(super) config: ElectionConfig,
    /// Time source
    pub(super) clock: Arc<dyn Clock>,
    /// Membership rows
    pub(super) membership: MembershipTable,
    /// Leadership row
    pub(super) leadership: LeadershipTable,
    /// Local leadership status
    pub(super) status: watch::Sender<LeaderStatus>,
    /// Stop signal for the background loops
    pub(super) cancel: CancellationToken,
    /// Background loop handles
    pub(super) tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Set once start() has begun
    pub(super) started: AtomicBool,
}

impl LeaderElection {
    /// Create an election handle using the system clock
    pub fn new(config: ElectionConfig, backend: Arc<dyn StorageBackend>) -> Result<Self> {
        Self::with_clock(config, backend, Arc::new(SystemClock))
    }

    /// Create an election handle with an explicit time source
    pub fn with_clock(
        config: ElectionConfig,
        backend: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let membership = MembershipTable::new(
            Arc::clone(&backend),
            Arc::clone(&clock),
            config.membership_table.clone(),
            config.leadership_table.clone(),
            config.node_id.clone(),
            config.address.clone(),
        );
        let leadership = LeadershipTable::new(
            backend,
            config.leadership_table.clone(),
            config.group.clone(),
        );
        let (status, _) = watch::channel(LeaderStatus::initializing());

        Ok(Self {
            config,
            clock,
            membership,
            leadership,
            status,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Get this node's ID
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Get the election configuration
    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    /// Check if this node currently holds a lease it can trust
    pub fn is_leader(&self) -> bool {
        let status = self.status.borrow();
        status.state == ElectionState::Leader
            && status
                .lease_deadline
                .map_or(false, |deadline| self.clock.now() < deadline)
    }

    /// Snapshot of the local leadership status
    pub fn status(&self) -> LeaderStatus {
        self.status.borrow().clone()
    }

    /// Get current state
    pub fn state(&self) -> ElectionState {
        self.status.borrow().state
    }

    /// Subscribe to leadership status changes
    pub fn subscribe(&self) -> watch::Receiver<LeaderStatus> {
        self.status.subscribe()
    }

    /// Snapshot of all member rows, ordered by ID
    pub async fn members(&self) -> Result<Vec<Member>> {
        self.membership.members().await
    }

    /// Term this node won, if it is leader
    pub(super) fn won_term(&self) -> Option<u64> {
        self.held_lease().map(|lease| lease.term)
    }

    /// Leadership row this node last wrote, if it is leader
    pub(super) fn held_lease(&self) -> Option<LeadershipRecord> {
        let status = self.status.borrow();
        match status.state {
            ElectionState::Leader => status.lease.clone(),
            _ => None,
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    /// Run one election attempt.
    ///
    /// With `re_election == false` a valid lease held by another node is
    /// respected. With `re_election == true` a claim is attempted only if the
    /// record is missing or its lease is observed expired; a follower never
    /// forces a takeover while the lease still looks valid. Losing a race is
    /// reported as [`ElectionOutcome::Follower`], not as an error.
    pub async fn elect_leader(&self, re_election: bool) -> Result<ElectionOutcome> {
        self.ensure_running()?;

        let now = self.clock.now();
        let lease_expiry = clock::add(now, self.config.lease_ttl);
        let node_id = self.config.node_id.as_str();

        let current = match self.leadership.read().await? {
            Some(record) => record,
            None => {
                if let Some(created) = self.leadership.try_create(node_id, lease_expiry).await? {
                    return Ok(self.become_leader(created));
                }
                tracing::debug!(
                    "Lost initial election for group {} to a concurrent candidate",
                    self.leadership.group()
                );
                let winner = self.read_after_loss().await;
                return Ok(self.become_follower(winner.as_ref()));
            }
        };

        let expired = current.is_expired(now, self.config.max_clock_skew);

        if !expired && self.won_term() == Some(current.term) && current.leader_id == node_id {
            return Ok(ElectionOutcome::Leader { term: current.term });
        }

        if !expired && current.leader_id != node_id {
            if re_election {
                tracing::debug!(
                    "Lease of {} (term {}) valid until {}, not forcing takeover",
                    current.leader_id,
                    current.term,
                    current.lease_expiry
                );
            }
            return Ok(self.become_follower(Some(&current)));
        }

        // Lease expired, or the record names this node from an earlier run
        match self.leadership.claim(node_id, &current, lease_expiry).await? {
            Some(claimed) => Ok(self.become_leader(claimed)),
            None => {
                tracing::debug!(
                    "Lost claim for term {} of group {}",
                    current.term + 1,
                    self.leadership.group()
                );
                let winner = self.read_after_loss().await;
                Ok(self.become_follower(winner.as_ref()))
            }
        }
    }

    /// Resolve the stored leader to its member row
    pub async fn get_leader(&self) -> Result<LeaderInfo> {
        let record = self.leadership.read().await?.ok_or(Error::NoLeader)?;
        self.resolve_leader(record).await
    }

    async fn resolve_leader(&self, record: LeadershipRecord) -> Result<LeaderInfo> {
        match self.membership.get_member(&record.leader_id).await? {
            Some(member) => Ok(LeaderInfo { record, member }),
            None => Err(Error::StaleLeadershipReference(record.leader_id)),
        }
    }

    /// One heartbeat tick: refresh the member row and, if leader, the lease
    pub async fn heartbeat(&self) -> Result<()> {
        self.ensure_running()?;

        let upsert = self.membership.update_membership_table().await;
        let refresh = self.refresh_lease().await;

        match (upsert, refresh) {
            (Ok(_), refresh) => refresh,
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(refresh_err)) => {
                tracing::warn!("Lease refresh failed alongside the member upsert: {}", refresh_err);
                Err(e)
            }
        }
    }

    async fn refresh_lease(&self) -> Result<()> {
        let Some(held) = self.held_lease() else {
            return Ok(());
        };

        let lease_expiry = clock::add(self.clock.now(), self.config.lease_ttl);
        match self.leadership.refresh(&held, lease_expiry).await {
            Ok(Some(written)) => {
                let deadline = self.local_deadline(lease_expiry);
                self.status.send_if_modified(|s| {
                    let still_held = s.lease.as_ref().map(|l| l.version) == Some(held.version);
                    if s.state == ElectionState::Leader && still_held {
                        s.lease_deadline = Some(deadline);
                        s.lease = Some(written);
                    }
                    false
                });
                tracing::trace!("Lease for term {} refreshed until {}", held.term, lease_expiry);
                Ok(())
            }
            Ok(None) => {
                tracing::warn!(
                    "Leadership of group {} moved on since term {} was refreshed",
                    self.leadership.group(),
                    held.term
                );
                let current = self.read_after_loss().await;
                self.step_down_from(held.term, current.as_ref());
                Ok(())
            }
            Err(e) => {
                if !self.is_leader() {
                    tracing::warn!(
                        "Lease for term {} lapsed while the store was unreachable",
                        held.term
                    );
                    self.step_down_from(held.term, None);
                }
                Err(e)
            }
        }
    }

    /// One monitor tick: prune stale members, then take over if the lease
    /// is missing or expired
    pub async fn monitor_leader(&self) -> Result<MonitorReport> {
        self.ensure_running()?;

        let pruned = self.prune_stale_members().await;

        let now = self.clock.now();
        let action = match self.leadership.read().await? {
            None => {
                tracing::info!(
                    "No leadership record for group {}, starting election",
                    self.leadership.group()
                );
                MonitorAction::Elected(self.elect_leader(true).await?)
            }
            Some(record) if record.is_expired(now, self.config.max_clock_skew) => {
                tracing::info!(
                    "Lease of {} (term {}) expired at {}, attempting takeover",
                    record.leader_id,
                    record.term,
                    record.lease_expiry
                );
                MonitorAction::Elected(self.elect_leader(true).await?)
            }
            Some(record) => {
                match self.won_term() {
                    Some(term) if record.term != term || record.leader_id != self.config.node_id => {
                        self.step_down_from(term, Some(&record));
                    }
                    Some(_) => {}
                    None => self.observe_leader(&record),
                }

                match self.resolve_leader(record).await {
                    Ok(_) => MonitorAction::Healthy,
                    Err(Error::StaleLeadershipReference(leader_id)) => {
                        tracing::warn!(
                            "Leader {} has no member row; takeover once its lease expires",
                            leader_id
                        );
                        MonitorAction::StaleReference(leader_id)
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        Ok(MonitorReport { pruned, action })
    }

    async fn prune_stale_members(&self) -> Vec<String> {
        let threshold = self.config.stale_threshold();
        let stale = match self.membership.stale_members(threshold).await {
            Ok(stale) => stale,
            Err(e) => {
                tracing::warn!("Failed to list members for pruning: {}", e);
                return Vec::new();
            }
        };

        let now = self.clock.now();
        let mut pruned = Vec::new();
        for member in stale {
            tracing::info!(
                "Pruning member {} (no heartbeat for {:?})",
                member.id,
                member.heartbeat_age(now)
            );
            match self.membership.remove_member(&member.id).await {
                Ok(_) => pruned.push(member.id),
                Err(e) => tracing::warn!("Failed to prune member {}: {}", member.id, e),
            }
        }
        pruned
    }

    async fn read_after_loss(&self) -> Option<LeadershipRecord> {
        match self.leadership.read().await {
            Ok(record) => record,
            Err(e) => {
                tracing::debug!("Could not read winning leadership record: {}", e);
                None
            }
        }
    }

    fn local_deadline(&self, lease_expiry: DateTime<Utc>) -> DateTime<Utc> {
        clock::sub(lease_expiry, self.config.max_clock_skew)
    }

    /// Become the leader of the term `written` carries
    fn become_leader(&self, written: LeadershipRecord) -> ElectionOutcome {
        let term = written.term;
        let deadline = self.local_deadline(written.lease_expiry);
        let node_id = self.config.node_id.clone();
        let mut previous = None;

        self.status.send_if_modified(|s| {
            if s.state == ElectionState::Stopped {
                return false;
            }
            previous = Some(s.state);
            let changed = s.state != ElectionState::Leader || s.term != Some(term);
            s.state = ElectionState::Leader;
            s.term = Some(term);
            s.leader_id = Some(node_id);
            s.lease_deadline = Some(deadline);
            s.lease = Some(written);
            changed
        });

        if matches!(previous, Some(state) if state != ElectionState::Leader) {
            tracing::info!(
                "Won election for group {} at term {}, becoming LEADER (node: {})",
                self.leadership.group(),
                term,
                self.config.node_id
            );
        }

        ElectionOutcome::Leader { term }
    }

    /// Become a follower of whoever `current` names
    fn become_follower(&self, current: Option<&LeadershipRecord>) -> ElectionOutcome {
        let leader_id = current.map(|r| r.leader_id.clone());
        let term = current.map(|r| r.term);
        let mut stepped_down = false;

        self.status.send_if_modified(|s| {
            if s.state == ElectionState::Stopped {
                return false;
            }
            stepped_down = s.state == ElectionState::Leader;
            let changed = s.state != ElectionState::Follower || s.leader_id != leader_id;
            s.state = ElectionState::Follower;
            s.term = None;
            s.leader_id = leader_id.clone();
            s.lease_deadline = None;
            s.lease = None;
            changed
        });

        if stepped_down {
            tracing::info!("Stepping down to follower (leader: {:?})", leader_id);
        }

        ElectionOutcome::Follower { leader_id, term }
    }

    /// Step down only if still leader at `term`
    pub(super) fn step_down_from(&self, term: u64, current: Option<&LeadershipRecord>) {
        if self.won_term() == Some(term) {
            self.become_follower(current);
        }
    }

    fn observe_leader(&self, record: &LeadershipRecord) {
        self.status.send_if_modified(|s| {
            if s.state != ElectionState::Follower || s.leader_id.as_deref() == Some(&record.leader_id) {
                return false;
            }
            s.leader_id = Some(record.leader_id.clone());
            true
        });
    }
}
