//! Election lifecycle: initial election, background loops and shutdown.
//!
//! The heartbeat and monitor loops are independent tasks sharing one
//! cancellation token. A tick that has started always runs to completion;
//! cancellation only prevents the next one from being scheduled.

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::election::{ElectionOutcome, ElectionState, LeaderElection};
use super::leadership::LeadershipRecord;
use crate::clock;
use crate::error::{Error, Result};

impl LeaderElection {
    /// Join the group: ensure tables, register, run the initial election and
    /// launch the heartbeat and monitor loops.
    ///
    /// Returns the outcome of the initial election.
    pub async fn start(self: &Arc<Self>) -> Result<ElectionOutcome> {
        if self.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        let outcome = match self.join().await {
            Ok(outcome) => outcome,
            Err(e) => {
                // The member row may already be written; a failed join leaves nothing behind
                if let Err(cleanup) = self.membership.remove_member(&self.config.node_id).await {
                    tracing::debug!("Could not remove member row after failed start: {}", cleanup);
                }
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let heartbeat = self.spawn_heartbeat_loop();
        let monitor = self.spawn_monitor_loop();
        self.tasks.lock().await.extend([heartbeat, monitor]);

        tracing::info!(
            "Node {} joined group {} as {}",
            self.config.node_id,
            self.config.group,
            self.state()
        );

        Ok(outcome)
    }

    async fn join(&self) -> Result<ElectionOutcome> {
        self.membership.create_leadership_table().await?;
        self.membership.update_membership_table().await?;
        self.elect_leader(false).await
    }

    fn spawn_heartbeat_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let election = Arc::clone(self);
        let cancel = self.cancel.clone();
        let period = self.config.heartbeat_interval;

        tokio::spawn(async move {
            // Skip the immediate first tick; start() just wrote both rows
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Heartbeat loop shutting down");
                        break;
                    }

                    _ = ticker.tick() => {
                        if let Err(e) = election.heartbeat().await {
                            tracing::warn!("Heartbeat failed, retrying next tick: {}", e);
                        }
                    }
                }
            }
        })
    }

    fn spawn_monitor_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let election = Arc::clone(self);
        let cancel = self.cancel.clone();
        let period = self.config.monitor_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + first_monitor_delay(period), period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Monitor loop shutting down");
                        break;
                    }

                    _ = ticker.tick() => {
                        match election.monitor_leader().await {
                            Ok(report) => {
                                tracing::trace!("Monitor tick: {:?}", report);
                            }
                            Err(e) => {
                                tracing::warn!("Leader monitor failed, retrying next tick: {}", e);
                            }
                        }
                    }
                }
            }
        })
    }

    /// Leave the group: stop both loops, release the lease if held and
    /// remove this node's member row.
    ///
    /// If releasing or removing fails the error is returned and the handle
    /// is not marked stopped, so calling `stop()` again retries the cleanup.
    /// Once it has succeeded further calls are no-ops.
    pub async fn stop(&self) -> Result<()> {
        if self.state() == ElectionState::Stopped {
            return Ok(());
        }

        self.cancel.cancel();

        let handles = std::mem::take(&mut *self.tasks.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("Election task ended abnormally: {}", e);
            }
        }

        if let Some(held) = self.held_lease() {
            self.release_lease(held).await?;
        }

        if self.started.load(Ordering::SeqCst) {
            if let Err(e) = self.membership.remove_member(&self.config.node_id).await {
                tracing::warn!("Failed to remove member row on shutdown: {}", e);
                return Err(e);
            }
        }

        self.status.send_modify(|s| {
            s.state = ElectionState::Stopped;
            s.term = None;
            s.lease_deadline = None;
        });

        tracing::info!(
            "Node {} left group {}",
            self.config.node_id,
            self.config.group
        );

        Ok(())
    }

    /// Backdate the held lease so followers see it expired on their next
    /// tick, then drop local leadership
    async fn release_lease(&self, held: LeadershipRecord) -> Result<()> {
        let now = self.clock.now();
        let released = clock::sub(now, self.config.lease_ttl + self.config.max_clock_skew);

        match self.leadership.refresh(&held, released).await {
            Ok(Some(_)) => tracing::info!("Released leadership of term {}", held.term),
            Ok(None) => tracing::debug!("Term {} already superseded, nothing to release", held.term),
            Err(e) => {
                tracing::warn!("Failed to release lease for term {}: {}", held.term, e);
                return Err(e);
            }
        }

        self.step_down_from(held.term, None);
        Ok(())
    }

    /// Run `work` only while this node is leader
    pub async fn run_if_leader<F, Fut, T>(&self, work: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if self.is_leader() {
            Some(work().await)
        } else {
            None
        }
    }

    /// Token cancelled when the election stops
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Random offset for the first monitor tick so nodes started together do
/// not probe the store in lockstep
fn first_monitor_delay(period: Duration) -> Duration {
    let max_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX).max(1);
    Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    use async_trait::async_trait;
    use chrono::Utc;

    use crate::state::{ElectionConfig, LeadershipTable};
    use crate::storage::{MemoryBackend, StorageBackend, StoredRow};

    /// Memory backend whose point reads can be made to fail
    #[derive(Clone, Default)]
    struct FlakyReads {
        inner: MemoryBackend,
        fail_get: Arc<AtomicBool>,
    }

    #[async_trait]
    impl StorageBackend for FlakyReads {
        async fn create_table_if_not_exists(&self, table: &str) -> Result<()> {
            self.inner.create_table_if_not_exists(table).await
        }

        async fn upsert(&self, table: &str, row: StoredRow) -> Result<()> {
            self.inner.upsert(table, row).await
        }

        async fn insert(&self, table: &str, row: StoredRow) -> Result<()> {
            self.inner.insert(table, row).await
        }

        async fn get(&self, table: &str, key: &str) -> Result<Option<StoredRow>> {
            if self.fail_get.load(Ordering::SeqCst) {
                return Err(Error::StorageUnavailable("read timed out".into()));
            }
            self.inner.get(table, key).await
        }

        async fn delete(&self, table: &str, key: &str) -> Result<u64> {
            self.inner.delete(table, key).await
        }

        async fn conditional_update(
            &self,
            table: &str,
            expected_version: i64,
            row: StoredRow,
        ) -> Result<u64> {
            self.inner.conditional_update(table, expected_version, row).await
        }

        async fn list(&self, table: &str) -> Result<Vec<StoredRow>> {
            self.inner.list(table).await
        }
    }

    fn config(node_id: &str) -> ElectionConfig {
        ElectionConfig {
            node_id: node_id.to_string(),
            address: None,
            group: "jobs".to_string(),
            membership_table: "members".to_string(),
            leadership_table: "leadership".to_string(),
            heartbeat_interval: Duration::from_millis(20),
            monitor_interval: Duration::from_millis(20),
            lease_ttl: Duration::from_millis(200),
            stale_after_multiple: 5,
            max_clock_skew: Duration::ZERO,
        }
    }

    #[test]
    fn test_first_monitor_delay_within_period() {
        for _ in 0..100 {
            assert!(first_monitor_delay(Duration::from_millis(50)) < Duration::from_millis(50));
        }
        assert_eq!(first_monitor_delay(Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let election = LeaderElection::new(config("node-1"), Arc::new(MemoryBackend::new())).unwrap();
        election.stop().await.unwrap();
        assert_eq!(election.state(), ElectionState::Stopped);
        assert!(matches!(election.heartbeat().await, Err(Error::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let backend = Arc::new(MemoryBackend::new());
        let election = Arc::new(LeaderElection::new(config("node-1"), backend).unwrap());

        let outcome = election.start().await.unwrap();
        assert!(outcome.is_leader());
        assert!(matches!(election.start().await, Err(Error::AlreadyStarted)));

        election.stop().await.unwrap();
        assert!(matches!(election.start().await, Err(Error::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_failed_start_can_be_retried() {
        let backend = MemoryBackend::new();
        backend.set_offline(true);
        let election = Arc::new(LeaderElection::new(config("node-1"), Arc::new(backend.clone())).unwrap());

        assert!(election.start().await.unwrap_err().is_retryable());
        assert_eq!(election.state(), ElectionState::Initializing);

        backend.set_offline(false);
        assert!(election.start().await.unwrap().is_leader());
        election.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_releases_lease_and_membership() {
        let backend = MemoryBackend::new();
        let leader = Arc::new(LeaderElection::new(config("node-1"), Arc::new(backend.clone())).unwrap());
        let follower = Arc::new(LeaderElection::new(config("node-2"), Arc::new(backend.clone())).unwrap());

        assert!(leader.start().await.unwrap().is_leader());
        assert!(!follower.start().await.unwrap().is_leader());
        assert_eq!(follower.members().await.unwrap().len(), 2);

        leader.stop().await.unwrap();
        assert_eq!(leader.state(), ElectionState::Stopped);
        assert!(!leader.is_leader());
        leader.stop().await.unwrap();

        let members = follower.members().await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].id, "node-2");

        // The released lease lets the follower take over without waiting out the TTL.
        // Its own monitor loop may get there first; either way the term is 2.
        follower.monitor_leader().await.unwrap();
        assert!(follower.is_leader());
        assert_eq!(follower.status().term, Some(2));

        follower.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_loops_keep_leader_alive() {
        let backend = MemoryBackend::new();
        let leader = Arc::new(LeaderElection::new(config("node-1"), Arc::new(backend.clone())).unwrap());
        let follower = Arc::new(LeaderElection::new(config("node-2"), Arc::new(backend.clone())).unwrap());

        leader.start().await.unwrap();
        follower.start().await.unwrap();

        // Several lease lifetimes pass; the loops keep the original leader in place
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(leader.is_leader());
        assert!(!follower.is_leader());
        assert_eq!(leader.status().term, Some(1));

        let ran = leader.run_if_leader(|| async { 42 }).await;
        assert_eq!(ran, Some(42));
        assert_eq!(follower.run_if_leader(|| async { 42 }).await, None);

        leader.stop().await.unwrap();
        follower.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_start_removes_member_row() {
        let backend = FlakyReads::default();
        backend.fail_get.store(true, Ordering::SeqCst);
        let election = Arc::new(LeaderElection::new(config("node-1"), Arc::new(backend.clone())).unwrap());

        // Tables and the member row are written before the election read fails
        assert!(election.start().await.unwrap_err().is_retryable());
        assert!(backend.inner.list("members").await.unwrap().is_empty());

        backend.fail_get.store(false, Ordering::SeqCst);
        assert!(election.start().await.unwrap().is_leader());
        assert_eq!(backend.inner.list("members").await.unwrap().len(), 1);

        election.stop().await.unwrap();
        assert!(backend.inner.list("members").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_can_be_retried_after_storage_failure() {
        let backend = MemoryBackend::new();
        let election = Arc::new(LeaderElection::new(config("node-1"), Arc::new(backend.clone())).unwrap());
        assert!(election.start().await.unwrap().is_leader());

        backend.set_offline(true);
        assert!(election.stop().await.unwrap_err().is_retryable());
        assert_ne!(election.state(), ElectionState::Stopped);

        backend.set_offline(false);
        election.stop().await.unwrap();
        assert_eq!(election.state(), ElectionState::Stopped);
        assert!(!election.is_leader());
        assert!(backend.list("members").await.unwrap().is_empty());

        let leadership = LeadershipTable::new(Arc::new(backend.clone()), "leadership".into(), "jobs".into());
        let record = leadership.read().await.unwrap().unwrap();
        assert_eq!(record.term, 1);
        assert!(record.is_expired(Utc::now(), Duration::ZERO));

        election.stop().await.unwrap();
    }
}
