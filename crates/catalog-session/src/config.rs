//! Session authority configuration management

use crate::error::{Result, SessionError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default key under which the lease record is stored
pub const DEFAULT_COORDINATION_KEY: &str = "catalog.session.leader";

/// Upper bound on the stale timeout, and through ordering on every other timing
pub const MAX_STALE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Main session authority configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Store key holding the lease record
    pub coordination_key: String,

    /// Buffer size of the leadership event channel
    pub event_capacity: usize,

    /// Age beyond which a lease record is no longer honored
    pub stale_timeout: Duration,

    /// Interval at which the leader renews its lease; followers check for
    /// staleness at the same cadence
    pub heartbeat_interval: Duration,

    /// Delay between writing a claim and confirming it won
    pub claim_window: Duration,

    /// Shared store backend
    pub store: StoreBackendConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            coordination_key: DEFAULT_COORDINATION_KEY.to_string(),
            event_capacity: 64,
            stale_timeout: Duration::from_millis(5000),
            heartbeat_interval: Duration::from_millis(4000),
            claim_window: Duration::from_millis(100),
            store: StoreBackendConfig::default(),
        }
    }
}

/// Shared store backend configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreBackendConfig {
    /// In-process medium (tests, single-process hosts)
    Memory,

    /// Embedded sled database shared by contexts of one process
    Sled {
        path: PathBuf,
    },

    /// Directory shared by contexts in separate processes
    File {
        dir: PathBuf,
        poll_interval: Duration,
    },
}

impl Default for StoreBackendConfig {
    fn default() -> Self {
        Self::Memory
    }
}

impl SessionConfig {
    /// Load configuration from file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SessionError::configuration(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| SessionError::configuration(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| SessionError::configuration(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| SessionError::configuration(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.coordination_key.is_empty() {
            return Err(SessionError::configuration("Coordination key cannot be empty"));
        }

        if self.claim_window.is_zero() {
            return Err(SessionError::configuration("Claim window must be non-zero"));
        }

        if self.stale_timeout > MAX_STALE_TIMEOUT {
            return Err(SessionError::configuration(format!(
                "Stale timeout ({:?}) cannot exceed {:?}",
                self.stale_timeout, MAX_STALE_TIMEOUT
            )));
        }

        // A live leader must renew before its record goes stale
        if self.heartbeat_interval >= self.stale_timeout {
            return Err(SessionError::configuration(format!(
                "Heartbeat interval ({:?}) must be shorter than the stale timeout ({:?})",
                self.heartbeat_interval, self.stale_timeout
            )));
        }

        if self.claim_window >= self.heartbeat_interval {
            return Err(SessionError::configuration(format!(
                "Claim window ({:?}) must be shorter than the heartbeat interval ({:?})",
                self.claim_window, self.heartbeat_interval
            )));
        }

        if self.event_capacity == 0 {
            return Err(SessionError::configuration("Event capacity must be at least 1"));
        }

        if let StoreBackendConfig::File { poll_interval, .. } = &self.store {
            if poll_interval.is_zero() || *poll_interval >= self.heartbeat_interval {
                return Err(SessionError::configuration(
                    "File store poll interval must be non-zero and shorter than the heartbeat interval",
                ));
            }
        }

        Ok(())
    }

    /// Longest time after a leader vanishes before a follower takes over
    pub fn takeover_bound(&self) -> Duration {
        self.stale_timeout + self.claim_window
    }
}
