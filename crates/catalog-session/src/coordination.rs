//! Leadership flag and change notifications

use crate::peer::{PeerId, PeerRole};
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use tokio::sync::{broadcast, watch};

/// Callback fired on every transition to or from leadership
pub type LeadershipCallback = Box<dyn Fn(&LeadershipEvent) + Send + Sync>;

/// A transition of this context's leadership
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipEvent {
    /// This context became the leader
    Acquired {
        peer_id: PeerId,
        timestamp: DateTime<Utc>,
    },

    /// This context stopped being the leader
    Lost {
        peer_id: PeerId,
        role: PeerRole,
        holder: Option<PeerId>,
        timestamp: DateTime<Utc>,
    },
}

impl LeadershipEvent {
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Acquired { .. })
    }

    pub fn peer_id(&self) -> PeerId {
        match self {
            Self::Acquired { peer_id, .. } | Self::Lost { peer_id, .. } => *peer_id,
        }
    }
}

/// Publishes leadership transitions to the rest of the application.
///
/// Holds the boolean flag read by the session gate, a broadcast channel for
/// async subscribers and a list of synchronous callbacks.
pub struct LeadershipNotifier {
    flag: watch::Sender<bool>,
    events: broadcast::Sender<LeadershipEvent>,
    callbacks: Mutex<Vec<LeadershipCallback>>,
}

impl LeadershipNotifier {
    pub fn new(capacity: usize) -> Self {
        let (flag, _) = watch::channel(false);
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            flag,
            events,
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Current leadership flag
    pub fn is_leader(&self) -> bool {
        *self.flag.borrow()
    }

    /// Receiver that always holds the current flag
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.flag.subscribe()
    }

    /// Subscribe to leadership events
    pub fn subscribe(&self) -> broadcast::Receiver<LeadershipEvent> {
        self.events.subscribe()
    }

    /// Register a callback for leadership transitions
    pub fn on_change<F>(&self, callback: F)
    where
        F: Fn(&LeadershipEvent) + Send + Sync + 'static,
    {
        self.callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Box::new(callback));
    }

    /// Record a transition. Ignored when the flag already matches.
    pub fn publish(&self, event: LeadershipEvent) {
        let leader = event.is_leader();
        let previous = self.flag.send_replace(leader);
        if previous == leader {
            return;
        }

        let _ = self.events.send(event.clone());

        let callbacks = self
            .callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for callback in callbacks.iter() {
            callback(&event);
        }
    }
}
