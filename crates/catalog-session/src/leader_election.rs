//! Lease-based leader election over the shared store
//!
//! Each execution context runs one [`LeaseManager`]. A context claims the
//! lease by writing `{peerId, timestamp}` under the coordination key, waits
//! one claim window, and becomes leader only if it still reads its own id.
//! The leader rewrites the record every heartbeat; followers take over once
//! the record is older than the stale timeout or has been removed.
//!
//! The store has no compare-and-swap, so two contexts that pass the
//! staleness check together both write a claim. Last write wins on the
//! store and the overwritten claimant steps down on confirmation, leaving a
//! window of at most one claim window with two leaders.

use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::coordination::{LeadershipEvent, LeadershipNotifier};
use crate::error::{Result, SessionError};
use crate::lease::{to_chrono, LeaseRecord};
use crate::lease_store::{LeaseStore, LeaseWatch};
use crate::peer::{PeerId, PeerRole, PeerState};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Protocol timings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTimings {
    pub stale_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub claim_window: Duration,
}

impl From<&SessionConfig> for LeaseTimings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            stale_timeout: config.stale_timeout,
            heartbeat_interval: config.heartbeat_interval,
            claim_window: config.claim_window,
        }
    }
}

/// Result of a claim attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Claim written; confirm at the given instant
    Claimed { confirm_at: DateTime<Utc> },

    /// Another context holds a valid lease
    Following { holder: PeerId },

    /// This context already leads and its record is fresh
    AlreadyLeader,

    /// Store unavailable; this context leads without coordination
    Degraded,

    /// Transient store failure; retry on the next tick
    Deferred,

    /// The manager has shut down
    Stopped,
}

struct DriverHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Per-context lease protocol engine
pub struct LeaseManager {
    id: PeerId,
    state: Mutex<PeerState>,
    leases: LeaseStore,
    clock: Arc<dyn Clock>,
    timings: LeaseTimings,
    notifier: Arc<LeadershipNotifier>,
    driver: Mutex<Option<DriverHandle>>,
}

impl LeaseManager {
    pub fn new(
        peer_id: PeerId,
        leases: LeaseStore,
        clock: Arc<dyn Clock>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            id: peer_id,
            state: Mutex::new(PeerState::new(peer_id)),
            leases,
            clock,
            timings: LeaseTimings::from(config),
            notifier: Arc::new(LeadershipNotifier::new(config.event_capacity)),
            driver: Mutex::new(None),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.id
    }

    pub fn notifier(&self) -> &Arc<LeadershipNotifier> {
        &self.notifier
    }

    pub fn lease_store(&self) -> &LeaseStore {
        &self.leases
    }

    /// Current leadership flag
    pub fn is_leader(&self) -> bool {
        self.notifier.is_leader()
    }

    pub async fn role(&self) -> PeerRole {
        self.state.lock().await.role
    }

    /// Snapshot of the in-memory protocol state
    pub async fn snapshot(&self) -> PeerState {
        self.state.lock().await.clone()
    }

    /// Read the lease and claim it if it is absent, malformed or stale
    pub async fn try_claim(&self) -> ClaimOutcome {
        let mut state = self.state.lock().await;
        self.claim_locked(&mut state).await
    }

    /// Re-read the lease after the claim window and settle the role
    pub async fn confirm_claim(&self) -> PeerRole {
        let mut state = self.state.lock().await;
        if !state.alive || state.degraded || state.role == PeerRole::Leader {
            return state.role;
        }

        match self.leases.read().await {
            Ok(Some(record)) if record.is_held_by(&state.id) => {
                state.last_observed = Some(record);
                tracing::info!("Peer {} confirmed its claim on the session lease", state.id);
                self.set_role(&mut state, PeerRole::Leader, None);
            }
            Ok(record) => {
                state.last_observed = record;
                let holder = record.map(|r| r.peer_id);
                tracing::info!(
                    "Peer {} lost the claim race to {:?}",
                    state.id,
                    holder.map(|h| h.to_string())
                );
                self.set_role(&mut state, PeerRole::Follower, holder);
            }
            Err(SessionError::StoreUnavailable(msg)) => self.enter_degraded(&mut state, &msg),
            Err(e) => {
                tracing::warn!("Peer {} could not confirm its claim: {}", state.id, e);
                self.set_role(&mut state, PeerRole::Follower, None);
            }
        }

        state.role
    }

    /// Renew the lease. Returns whether this context is still leader.
    pub async fn heartbeat(&self) -> bool {
        let mut state = self.state.lock().await;
        if !state.alive || state.role != PeerRole::Leader {
            return false;
        }
        if state.degraded {
            return true;
        }

        let now = self.clock.now();
        match self.leases.read().await {
            Ok(Some(record))
                if !record.is_held_by(&state.id)
                    && !record.is_stale(now, self.timings.stale_timeout) =>
            {
                tracing::info!(
                    "Peer {} found the lease held by {}, stepping down",
                    state.id,
                    record.peer_id
                );
                state.last_observed = Some(record);
                self.set_role(&mut state, PeerRole::Follower, Some(record.peer_id));
                return false;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("Heartbeat read failed for peer {}: {}", state.id, e);
            }
        }

        let record = LeaseRecord::new(state.id, state.next_write_timestamp(now));
        match self.leases.write(&record).await {
            Ok(()) => {
                state.last_written = Some(record.timestamp);
                state.last_observed = Some(record);
                tracing::trace!("Heartbeat from peer {} at {}", state.id, record.timestamp);
            }
            Err(e) => {
                // Tolerated until the record goes stale; retried next tick
                tracing::warn!("Heartbeat write failed for peer {}: {}", state.id, e);
            }
        }
        true
    }

    /// React to another context's mutation of the coordination key
    pub async fn on_external_change(&self, record: Option<LeaseRecord>) -> Option<ClaimOutcome> {
        let mut state = self.state.lock().await;
        if !state.alive || state.degraded {
            return None;
        }

        let now = self.clock.now();
        match record {
            Some(record) if record.is_held_by(&state.id) => {
                state.last_observed = Some(record);
                if state.role != PeerRole::Leader {
                    tracing::debug!("Peer {} saw its own lease echoed back", state.id);
                    self.set_role(&mut state, PeerRole::Leader, None);
                }
                None
            }
            Some(record) if !record.is_stale(now, self.timings.stale_timeout) => {
                state.last_observed = Some(record);
                self.set_role(&mut state, PeerRole::Follower, Some(record.peer_id));
                None
            }
            _ => {
                tracing::debug!("Peer {} saw the lease vacated, claiming", state.id);
                self.set_role(&mut state, PeerRole::Unclaimed, None);
                Some(self.claim_locked(&mut state).await)
            }
        }
    }

    /// Stop participating. A leader removes its record so a follower can
    /// take over without waiting for the stale timeout.
    pub async fn on_shutdown(&self) {
        let mut state = self.state.lock().await;
        if !state.alive {
            return;
        }
        state.alive = false;

        if state.role == PeerRole::Leader && !state.degraded {
            match self.leases.read().await {
                Ok(Some(record)) if record.is_held_by(&state.id) => match self.leases.clear().await {
                    Ok(()) => tracing::info!("Peer {} released the session lease", state.id),
                    Err(e) => tracing::warn!("Peer {} failed to release the lease: {}", state.id, e),
                },
                Ok(_) => tracing::debug!("Peer {} no longer owns the lease record", state.id),
                Err(e) => tracing::warn!("Peer {} could not read the lease on shutdown: {}", state.id, e),
            }
        }

        self.set_role(&mut state, PeerRole::Unclaimed, None);
    }

    /// Spawn the driver task for this context
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut driver = self.driver.lock().await;
        if driver.is_some() {
            tracing::warn!("Lease manager for peer {} already started", self.peer_id());
            return Ok(());
        }

        let watch = match self.leases.watch().await {
            Ok(watch) => Some(watch),
            Err(SessionError::StoreUnavailable(msg)) => {
                let mut state = self.state.lock().await;
                self.enter_degraded(&mut state, &msg);
                None
            }
            Err(e) => {
                tracing::warn!("Lease subscription failed, relying on periodic checks: {}", e);
                None
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.clone().run(watch, shutdown_rx));
        *driver = Some(DriverHandle {
            shutdown: shutdown_tx,
            task,
        });

        tracing::info!("Lease manager started for peer {}", self.peer_id());
        Ok(())
    }

    /// Stop the driver, cancel pending timers and release the lease
    pub async fn shutdown(&self) {
        self.stop_driver().await;
        self.on_shutdown().await;
    }

    /// Stop the driver without releasing anything, as if the context had
    /// been killed. Other contexts recover through the stale timeout.
    pub async fn abandon(&self) {
        self.stop_driver().await;
        self.state.lock().await.alive = false;
    }

    /// Abort the driver without waiting for it, for teardown paths that
    /// cannot await. The lease is left to go stale.
    pub fn cancel(&self) {
        let handle = match self.driver.try_lock() {
            Ok(mut driver) => driver.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            let _ = handle.shutdown.send(true);
            handle.task.abort();
            tracing::debug!("Lease driver cancelled for peer {}", self.id);
        }
        if let Ok(mut state) = self.state.try_lock() {
            state.alive = false;
        }
    }

    async fn stop_driver(&self) {
        let handle = self.driver.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.shutdown.send(true);
            if let Err(e) = handle.task.await {
                if !e.is_cancelled() {
                    tracing::warn!("Lease driver task failed: {}", e);
                }
            }
        }
    }

    /// When the recurring check should next run
    pub async fn next_check(&self) -> DateTime<Utc> {
        let state = self.state.lock().await;
        self.plan_next_check(&state, self.clock.now())
    }

    fn plan_next_check(&self, state: &PeerState, now: DateTime<Utc>) -> DateTime<Utc> {
        let tick = now + to_chrono(self.timings.heartbeat_interval);

        match state.role {
            PeerRole::Leader if !state.degraded => match state.last_written {
                Some(written) => {
                    let due = written + to_chrono(self.timings.heartbeat_interval);
                    if due > now {
                        due
                    } else {
                        tick
                    }
                }
                None => tick,
            },
            PeerRole::Follower | PeerRole::Unclaimed => match state.last_observed {
                // Wake exactly when the observed lease would go stale
                Some(record) if !record.is_held_by(&state.id) => {
                    let stale_at = record.stale_at(self.timings.stale_timeout);
                    if stale_at > now && stale_at < tick {
                        stale_at
                    } else {
                        tick
                    }
                }
                _ => tick,
            },
            _ => tick,
        }
    }

    async fn run(self: Arc<Self>, mut watch: Option<LeaseWatch>, mut shutdown: watch::Receiver<bool>) {
        let mut confirm_at = match self.try_claim().await {
            ClaimOutcome::Claimed { confirm_at } => Some(confirm_at),
            _ => None,
        };

        loop {
            let next_check = self.next_check().await;
            let deadline = match confirm_at {
                Some(at) if at < next_check => at,
                _ => next_check,
            };

            tokio::select! {
                _ = shutdown.changed() => break,
                change = next_change(&mut watch) => match change {
                    Some(record) => {
                        if let Some(ClaimOutcome::Claimed { confirm_at: at }) =
                            self.on_external_change(record).await
                        {
                            confirm_at = Some(at);
                        }
                    }
                    None => {
                        tracing::warn!("Lease subscription closed, relying on periodic checks");
                        watch = None;
                    }
                },
                _ = self.clock.sleep_until(deadline) => {
                    let now = self.clock.now();
                    match confirm_at {
                        Some(at) if at <= now => {
                            confirm_at = None;
                            self.confirm_claim().await;
                        }
                        _ => {
                            if self.role().await == PeerRole::Leader {
                                self.heartbeat().await;
                            } else if let ClaimOutcome::Claimed { confirm_at: at } =
                                self.try_claim().await
                            {
                                confirm_at = Some(at);
                            }
                        }
                    }
                }
            }
        }

        tracing::debug!("Lease driver stopped for peer {}", self.peer_id());
    }

    async fn claim_locked(&self, state: &mut PeerState) -> ClaimOutcome {
        if !state.alive {
            return ClaimOutcome::Stopped;
        }
        if state.degraded {
            return ClaimOutcome::Degraded;
        }

        let now = self.clock.now();
        let current = match self.leases.read().await {
            Ok(current) => current,
            Err(SessionError::StoreUnavailable(msg)) => {
                self.enter_degraded(state, &msg);
                return ClaimOutcome::Degraded;
            }
            Err(e) => {
                tracing::warn!("Lease read failed for peer {}: {}", state.id, e);
                return ClaimOutcome::Deferred;
            }
        };
        state.last_observed = current;

        if let Some(record) = current {
            if !record.is_stale(now, self.timings.stale_timeout) {
                if !record.is_held_by(&state.id) {
                    self.set_role(state, PeerRole::Follower, Some(record.peer_id));
                    return ClaimOutcome::Following {
                        holder: record.peer_id,
                    };
                }
                if state.role == PeerRole::Leader {
                    return ClaimOutcome::AlreadyLeader;
                }
            } else {
                tracing::info!(
                    "Lease held by {} is stale ({} ms old), peer {} claiming",
                    record.peer_id,
                    record.age(now).num_milliseconds(),
                    state.id
                );
            }
        }

        let record = LeaseRecord::new(state.id, state.next_write_timestamp(now));
        match self.leases.write(&record).await {
            Ok(()) => {
                state.last_written = Some(record.timestamp);
                state.last_observed = Some(record);
                self.set_role(state, PeerRole::Claiming, None);
                ClaimOutcome::Claimed {
                    confirm_at: self.clock.now() + to_chrono(self.timings.claim_window),
                }
            }
            Err(SessionError::StoreUnavailable(msg)) => {
                self.enter_degraded(state, &msg);
                ClaimOutcome::Degraded
            }
            Err(e) => {
                tracing::warn!("Claim write failed for peer {}: {}", state.id, e);
                ClaimOutcome::Deferred
            }
        }
    }

    fn enter_degraded(&self, state: &mut PeerState, reason: &str) {
        if state.degraded {
            return;
        }
        tracing::warn!(
            "Shared store unavailable ({}); peer {} acts as leader without coordination",
            reason,
            state.id
        );
        state.degraded = true;
        self.set_role(state, PeerRole::Leader, None);
    }

    fn set_role(&self, state: &mut PeerState, role: PeerRole, holder: Option<PeerId>) {
        let previous = state.role;
        if previous == role {
            return;
        }
        state.role = role;
        tracing::info!("Peer {} changed role: {} -> {}", state.id, previous, role);

        let timestamp = self.clock.now();
        if role == PeerRole::Leader {
            self.notifier.publish(LeadershipEvent::Acquired {
                peer_id: state.id,
                timestamp,
            });
        } else if previous == PeerRole::Leader {
            self.notifier.publish(LeadershipEvent::Lost {
                peer_id: state.id,
                role,
                holder,
                timestamp,
            });
        }
    }
}

async fn next_change(watch: &mut Option<LeaseWatch>) -> Option<Option<LeaseRecord>> {
    match watch {
        Some(watch) => watch.next().await,
        None => std::future::pending().await,
    }
}
