//! Execution context identity and in-memory lease state

use crate::error::{Result, SessionError};
use crate::lease::LeaseRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of one execution context, unique for the lifetime of the process
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Create a new random peer ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a peer ID from a UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parse a peer ID from its string form
    pub fn parse(s: &str) -> Result<Self> {
        let uuid = Uuid::parse_str(s)
            .map_err(|e| SessionError::malformed_record(format!("Invalid peer ID: {}", e)))?;
        Ok(Self(uuid))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Role of a context in the lease protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    /// No claim made yet, or the lease was vacated
    Unclaimed,

    /// Claim written, waiting for the confirmation window to elapse
    Claiming,

    /// Holds the lease and heartbeats it
    Leader,

    /// Another context holds a valid lease
    Follower,
}

impl Default for PeerRole {
    fn default() -> Self {
        Self::Unclaimed
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unclaimed => write!(f, "unclaimed"),
            Self::Claiming => write!(f, "claiming"),
            Self::Leader => write!(f, "leader"),
            Self::Follower => write!(f, "follower"),
        }
    }
}

/// Per-context protocol state. Never persisted.
#[derive(Debug, Clone)]
pub struct PeerState {
    pub id: PeerId,
    pub role: PeerRole,

    /// Most recent record read from or delivered by the store
    pub last_observed: Option<LeaseRecord>,

    /// Timestamp of the last record this context wrote itself
    pub last_written: Option<DateTime<Utc>>,

    /// Store is structurally unavailable; this context acts as leader alone
    pub degraded: bool,

    /// Cleared on shutdown so late timers become no-ops
    pub alive: bool,
}

impl PeerState {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            role: PeerRole::Unclaimed,
            last_observed: None,
            last_written: None,
            degraded: false,
            alive: true,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == PeerRole::Leader
    }

    /// Timestamp for the next record this context writes.
    ///
    /// Never earlier than the previous write, so one leader's records are
    /// non-decreasing even if the wall clock steps backwards.
    pub fn next_write_timestamp(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.last_written {
            Some(previous) if previous > now => previous,
            _ => now,
        }
    }
}
