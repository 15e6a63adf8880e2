//! Shared key-value store port and its backends
//!
//! Every execution context of one application instance talks to the same
//! medium through a `SharedStore` handle. The contract is deliberately weak:
//! plain get/set/remove with last-write-wins, and a change subscription that
//! delivers mutations made by *other* handles. There is no compare-and-swap
//! and no ordering guarantee between contexts.

mod file_store;
mod memory;
mod sled_store;

pub use file_store::FileStore;
pub use memory::{MemoryMedium, MemoryStore};
pub use sled_store::SledStore;

use crate::config::StoreBackendConfig;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Capacity of each subscription channel
pub(crate) const WATCH_CHANNEL_CAPACITY: usize = 64;

/// Result type for raw store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failures of the underlying medium
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Medium is not accessible at all (e.g. storage disabled by host policy)
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Transient write error; the caller retries later
    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// A mutation of a watched key made by another handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub key: String,
    /// `None` when the key was removed
    pub new_value: Option<String>,
}

/// Store backend health information
#[derive(Debug, Clone)]
pub struct StoreHealth {
    pub healthy: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Port over the persisted key-value medium shared by all contexts
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Read the current value of a key
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Overwrite a key
    async fn set(&self, key: &str, value: String) -> StoreResult<()>;

    /// Delete a key. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> StoreResult<()>;

    /// Watch a key for mutations made by other handles.
    ///
    /// Writes made through this same handle are not guaranteed to be
    /// delivered; callers must not rely on seeing their own writes.
    async fn subscribe(&self, key: &str) -> StoreResult<mpsc::Receiver<StoreChange>>;

    /// Health check for the medium
    async fn health_check(&self) -> StoreResult<StoreHealth>;
}

/// Create a store handle based on configuration
pub async fn create_store_backend(
    config: &StoreBackendConfig,
) -> StoreResult<Arc<dyn SharedStore>> {
    match config {
        StoreBackendConfig::Memory => Ok(Arc::new(MemoryMedium::new().connect())),
        StoreBackendConfig::Sled { path } => Ok(Arc::new(SledStore::open(path)?)),
        StoreBackendConfig::File { dir, poll_interval } => {
            Ok(Arc::new(FileStore::open(dir, *poll_interval).await?))
        }
    }
}

/// Remembers the last value each handle wrote so its own echoes can be
/// dropped from a medium that notifies every writer.
#[derive(Debug, Clone, Default)]
pub(crate) struct EchoFilter {
    own_writes: Arc<Mutex<HashMap<String, Option<String>>>>,
}

impl EchoFilter {
    pub(crate) async fn record(&self, key: &str, value: Option<String>) {
        self.own_writes.lock().await.insert(key.to_string(), value);
    }

    /// True when `value` is exactly what this handle last wrote to `key`.
    /// The remembered write is consumed.
    pub(crate) async fn is_own_echo(&self, key: &str, value: &Option<String>) -> bool {
        let mut own_writes = self.own_writes.lock().await;
        if own_writes.get(key) == Some(value) {
            own_writes.remove(key);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_echo_filter_consumes_own_write() {
        let filter = EchoFilter::default();
        filter.record("lease", Some("v1".to_string())).await;

        assert!(!filter.is_own_echo("lease", &Some("v2".to_string())).await);
        assert!(filter.is_own_echo("lease", &Some("v1".to_string())).await);
        assert!(!filter.is_own_echo("lease", &Some("v1".to_string())).await);

        filter.record("lease", None).await;
        assert!(filter.is_own_echo("lease", &None).await);
    }

    #[tokio::test]
    async fn test_create_store_backend() {
        let memory = create_store_backend(&StoreBackendConfig::Memory).await.unwrap();
        memory.set("k", "v".to_string()).await.unwrap();
        assert_eq!(memory.get("k").await.unwrap(), Some("v".to_string()));

        let temp_dir = tempdir().unwrap();
        let sled_config = StoreBackendConfig::Sled {
            path: temp_dir.path().join("sled"),
        };
        let sled = create_store_backend(&sled_config).await.unwrap();
        sled.set("k", "sled".to_string()).await.unwrap();
        assert_eq!(sled.get("k").await.unwrap(), Some("sled".to_string()));

        let file_config = StoreBackendConfig::File {
            dir: temp_dir.path().join("files"),
            poll_interval: std::time::Duration::from_millis(50),
        };
        let file = create_store_backend(&file_config).await.unwrap();
        file.set("k", "file".to_string()).await.unwrap();
        assert_eq!(file.get("k").await.unwrap(), Some("file".to_string()));
    }
}
