//! Catalog Session Authority
//!
//! Several execution contexts of the media catalog (windows, tabs, workers)
//! share one authenticated session. This crate elects exactly one of them
//! as the session authority through a lease kept in a shared key-value
//! store, and only lets that context issue session-mutating calls.

pub mod clock;
pub mod config;
pub mod coordination;
pub mod error;
pub mod gate;
pub mod leader_election;
pub mod lease;
pub mod lease_store;
pub mod peer;
pub mod session;
pub mod store;

pub use clock::{Clock, SystemClock, VirtualClock};
pub use config::{SessionConfig, StoreBackendConfig};
pub use coordination::{LeadershipCallback, LeadershipEvent, LeadershipNotifier};
pub use error::{Result, SessionError};
pub use gate::SessionGate;
pub use leader_election::{ClaimOutcome, LeaseManager, LeaseTimings};
pub use lease::LeaseRecord;
pub use lease_store::LeaseStore;
pub use peer::{PeerId, PeerRole, PeerState};
pub use session::{AuthBackend, AuthSession, SessionController, SignInRequest, UserProfile};
pub use store::{SharedStore, StoreChange, StoreError, StoreHealth};

use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;

/// One execution context's view of the session authority
pub struct SessionAuthority {
    pub config: SessionConfig,
    manager: Arc<LeaseManager>,
    gate: SessionGate,
}

impl SessionAuthority {
    /// Create an authority over the store named in `config`
    pub async fn new(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let store = store::create_store_backend(&config.store).await?;
        Self::with_parts(store, Arc::new(SystemClock), config)
    }

    /// Create an authority over an existing store handle and clock
    pub fn with_parts(
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;

        let peer_id = PeerId::new();
        let leases = LeaseStore::new(store, config.coordination_key.clone());
        let manager = Arc::new(LeaseManager::new(peer_id, leases, clock, &config));
        let gate = SessionGate::new(manager.notifier().clone());

        Ok(Self {
            config,
            manager,
            gate,
        })
    }

    /// Start participating in the election
    pub async fn start(&self) -> Result<()> {
        tracing::info!(
            "Starting session authority for peer {} on key {}",
            self.peer_id(),
            self.config.coordination_key
        );
        self.manager.start().await
    }

    /// Leave the election, releasing the lease if this context holds it
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down session authority for peer {}", self.peer_id());
        self.manager.shutdown().await;
    }

    pub fn peer_id(&self) -> PeerId {
        self.manager.peer_id()
    }

    /// Check if this context is the session authority
    pub fn is_leader(&self) -> bool {
        self.manager.is_leader()
    }

    pub async fn role(&self) -> PeerRole {
        self.manager.role().await
    }

    /// Register a callback for transitions to and from leadership
    pub fn on_leadership_change<F>(&self, callback: F)
    where
        F: Fn(&LeadershipEvent) + Send + Sync + 'static,
    {
        self.manager.notifier().on_change(callback);
    }

    /// Subscribe to leadership events
    pub fn subscribe(&self) -> broadcast::Receiver<LeadershipEvent> {
        self.manager.notifier().subscribe()
    }

    /// Run `op` only if this context is the leader
    pub async fn guard<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.gate.guard(op).await
    }

    pub fn gate(&self) -> SessionGate {
        self.gate.clone()
    }

    /// Session calls that go through this context's gate
    pub fn controller(&self, backend: Arc<dyn AuthBackend>) -> SessionController {
        SessionController::new(self.gate(), backend)
    }

    pub fn manager(&self) -> &Arc<LeaseManager> {
        &self.manager
    }

    /// Lease record currently in the store
    pub async fn current_lease(&self) -> Result<Option<LeaseRecord>> {
        self.manager.lease_store().read().await
    }

    /// Health of the shared store
    pub async fn store_health(&self) -> Result<StoreHealth> {
        Ok(self.manager.lease_store().shared_store().health_check().await?)
    }
}

impl Drop for SessionAuthority {
    fn drop(&mut self) {
        // No-op after shutdown(); otherwise stop heartbeating so the lease can go stale
        self.manager.cancel();
    }
}
